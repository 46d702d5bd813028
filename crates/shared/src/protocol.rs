use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{
        BaseLayer, DetailLayer, PipelineStatus, SpiceLevel, Stage, StageStatus, TranslatedLayer,
    },
    error::SyncError,
};

const COMPLETION_KINDS: &[&str] = &["complete", "completed", "processing_completed"];
const FAILURE_STATUSES: &[&str] = &["error", "failed"];

/// Raw message as it arrives on the progress channel. Every field is optional and
/// loosely typed; a mistyped scalar is treated as absent instead of failing the whole
/// message. [`InboundMessage::parse`] turns it into typed events.
#[derive(Debug, Default, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub stage: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub progress_percent: Option<Value>,
    #[serde(default)]
    pub processing_category: Option<Value>,
    #[serde(default)]
    pub elapsed_time: Option<Value>,
    #[serde(default)]
    pub heartbeat: Option<Value>,
    #[serde(default)]
    pub categories: Option<Value>,
    #[serde(rename = "translatedCategories", alias = "translated_categories", default)]
    pub translated_categories: Option<Value>,
    #[serde(rename = "partialResults", alias = "partial_results", default)]
    pub partial_results: Option<Value>,
    #[serde(rename = "partialMenu", alias = "partial_menu", default)]
    pub partial_menu: Option<Value>,
    #[serde(rename = "finalMenu", alias = "final_menu", default)]
    pub final_menu: Option<Value>,
    #[serde(default)]
    pub category_translations: Option<Value>,
}

/// One menu item entry as the pipeline sends it in any stage payload.
#[derive(Debug, Default, Deserialize)]
struct WireItem {
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    japanese_name: Option<Value>,
    #[serde(default)]
    original_name: Option<Value>,
    #[serde(default)]
    english_name: Option<Value>,
    #[serde(default)]
    translated_name: Option<Value>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    ingredients: Option<Value>,
    #[serde(default)]
    cooking_method: Option<Value>,
    #[serde(default)]
    cultural_background: Option<Value>,
    #[serde(default)]
    allergens: Option<Value>,
    #[serde(default)]
    spice_level: Option<Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl WireItem {
    fn original_name(&self) -> String {
        self.japanese_name
            .as_ref()
            .and_then(text)
            .or_else(|| self.name.as_ref().and_then(text))
            .or_else(|| self.original_name.as_ref().and_then(text))
            .unwrap_or_default()
    }

    fn translated_name(&self) -> Option<String> {
        self.english_name
            .as_ref()
            .and_then(text)
            .or_else(|| self.translated_name.as_ref().and_then(text))
    }

    fn into_base(self) -> BaseLayer {
        BaseLayer {
            price: self.price.as_ref().and_then(text),
            extra: self.extra,
        }
    }

    fn into_translated(self) -> TranslatedLayer {
        TranslatedLayer {
            translated_name: self.translated_name(),
            price: self.price.as_ref().and_then(text),
            extra: self.extra,
        }
    }

    fn into_detail(self) -> DetailLayer {
        let translated_name = self.translated_name();
        let mut extra = self.extra;
        if let Some(price) = self.price.as_ref().and_then(text) {
            extra.insert("price".to_string(), Value::String(price));
        }
        DetailLayer {
            translated_name,
            description: self.description.as_ref().and_then(text),
            ingredients: self.ingredients.as_ref().and_then(text_list),
            cooking_method: self.cooking_method.as_ref().and_then(text),
            cultural_background: self.cultural_background.as_ref().and_then(text),
            allergens: self.allergens.as_ref().and_then(text_list),
            spice_level: self.spice_level.as_ref().and_then(spice_level),
            extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemEntry<L> {
    /// Index of the entry within its category array in the payload.
    pub position: usize,
    pub original_name: String,
    pub layer: L,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryPayload<L> {
    pub name: String,
    pub entries: Vec<ItemEntry<L>>,
    /// Entries (or the whole category value) that were not JSON objects.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailDepth {
    Partial,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportedProgress {
    pub percent: Option<f64>,
    pub processing_category: Option<String>,
    pub elapsed_time: Option<f64>,
    pub message: Option<String>,
    pub heartbeat: bool,
}

/// A normalized domain event. One wire message may expand into several.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageTransition {
        stage: Stage,
        ordinal: u64,
        status: StageStatus,
    },
    Structured {
        categories: Vec<CategoryPayload<BaseLayer>>,
    },
    Translated {
        categories: Vec<CategoryPayload<TranslatedLayer>>,
        category_names: BTreeMap<String, String>,
    },
    Enriched {
        depth: DetailDepth,
        categories: Vec<CategoryPayload<DetailLayer>>,
    },
    Reported(ReportedProgress),
    Finished(PipelineStatus),
    Unknown {
        kind: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingFrame {
    /// Producer-side timestamp, echoed back in the acknowledgement.
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InboundMessage {
    Ping(PingFrame),
    Progress(Vec<ProgressEvent>),
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(SyncError::Parse("expected a JSON object".to_string()));
        }
        let wire: WireMessage = serde_json::from_value(value)?;
        Ok(Self::from_wire(wire))
    }

    pub fn from_wire(wire: WireMessage) -> Self {
        let kind = wire
            .kind
            .as_ref()
            .and_then(text)
            .map(|k| k.to_ascii_lowercase());
        if kind.as_deref() == Some("ping") {
            return InboundMessage::Ping(PingFrame {
                timestamp: wire.timestamp.as_ref().and_then(number),
            });
        }
        InboundMessage::Progress(normalize(wire, kind))
    }
}

fn normalize(wire: WireMessage, kind: Option<String>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    let status = wire
        .status
        .as_ref()
        .and_then(text)
        .map(|s| s.to_ascii_lowercase());
    let message = wire.message.as_ref().and_then(text);
    let category_names = wire.category_translations.as_ref().and_then(name_map);

    if let Some(ordinal) = wire.stage.as_ref().and_then(stage_ordinal) {
        events.push(ProgressEvent::StageTransition {
            stage: Stage::from_ordinal(ordinal),
            ordinal,
            status: StageStatus::from_wire(status.as_deref()),
        });
    }

    if let Some(categories) = object(wire.categories) {
        events.push(ProgressEvent::Structured {
            categories: category_payloads(categories, WireItem::into_base),
        });
    }

    if let Some(categories) = object(wire.translated_categories) {
        events.push(ProgressEvent::Translated {
            categories: category_payloads(categories, WireItem::into_translated),
            category_names: category_names.unwrap_or_default(),
        });
    } else if let Some(names) = category_names {
        events.push(ProgressEvent::Translated {
            categories: Vec::new(),
            category_names: names,
        });
    }

    let partial: Vec<_> = [object(wire.partial_results), object(wire.partial_menu)]
        .into_iter()
        .flatten()
        .flat_map(|categories| category_payloads(categories, WireItem::into_detail))
        .collect();
    if !partial.is_empty() {
        events.push(ProgressEvent::Enriched {
            depth: DetailDepth::Partial,
            categories: partial,
        });
    }

    if let Some(categories) = object(wire.final_menu) {
        events.push(ProgressEvent::Enriched {
            depth: DetailDepth::Final,
            categories: category_payloads(categories, WireItem::into_detail),
        });
    }

    let reported = ReportedProgress {
        percent: wire.progress_percent.as_ref().and_then(number),
        processing_category: wire.processing_category.as_ref().and_then(text),
        elapsed_time: wire.elapsed_time.as_ref().and_then(number),
        message: message.clone(),
        heartbeat: wire.heartbeat.as_ref().is_some_and(flag),
    };
    if reported != ReportedProgress::default() {
        events.push(ProgressEvent::Reported(reported));
    }

    let failed = kind.as_deref() == Some("error")
        || status
            .as_deref()
            .is_some_and(|s| FAILURE_STATUSES.contains(&s));
    if failed {
        let message = wire
            .error
            .as_ref()
            .and_then(text)
            .or(message)
            .unwrap_or_else(|| "processing failed".to_string());
        events.push(ProgressEvent::Finished(PipelineStatus::Failed { message }));
    } else if kind
        .as_deref()
        .is_some_and(|k| COMPLETION_KINDS.contains(&k))
    {
        events.push(ProgressEvent::Finished(PipelineStatus::Completed));
    }

    if events.is_empty() {
        events.push(ProgressEvent::Unknown { kind });
    }
    events
}

fn object(value: Option<Value>) -> Option<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn name_map(value: &Value) -> Option<BTreeMap<String, String>> {
    let Value::Object(map) = value else {
        return None;
    };
    Some(
        map.iter()
            .filter_map(|(name, translated)| Some((name.clone(), text(translated)?)))
            .collect(),
    )
}

fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn category_payloads<L>(
    categories: Map<String, Value>,
    into_layer: fn(WireItem) -> L,
) -> Vec<CategoryPayload<L>> {
    categories
        .into_iter()
        .map(|(name, value)| {
            let Value::Array(items) = value else {
                return CategoryPayload {
                    name,
                    entries: Vec::new(),
                    skipped: 1,
                };
            };
            let mut entries = Vec::with_capacity(items.len());
            let mut skipped = 0;
            for (position, item) in items.into_iter().enumerate() {
                if !item.is_object() {
                    skipped += 1;
                    continue;
                }
                match serde_json::from_value::<WireItem>(item) {
                    Ok(item) => entries.push(ItemEntry {
                        position,
                        original_name: item.original_name(),
                        layer: into_layer(item),
                    }),
                    Err(_) => skipped += 1,
                }
            }
            CategoryPayload {
                name,
                entries,
                skipped,
            }
        })
        .collect()
}

fn stage_ordinal(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .ok()
            .or_else(|| Stage::from_label(s).map(Stage::ordinal)),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Strings and numbers become trimmed text; empty text counts as absent so it can
/// never overwrite a stored value.
fn text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn text_list(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Array(values) => values.iter().filter_map(text).collect(),
        Value::String(s) => s
            .split([',', '、'])
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => return None,
    };
    (!items.is_empty()).then_some(items)
}

fn spice_level(value: &Value) -> Option<SpiceLevel> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|level| u8::try_from(level).ok())
            .map(SpiceLevel::Level),
        other => text(other).map(SpiceLevel::Label),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongRequest {
    pub ping_timestamp: Option<f64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamHealth {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
}

impl UpstreamHealth {
    pub fn is_available(&self) -> bool {
        let status_ok = self
            .status
            .as_deref()
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "available"))
            .unwrap_or(true);
        status_ok && self.services.values().all(|up| *up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(raw: &str) -> Vec<ProgressEvent> {
        match InboundMessage::parse(raw).expect("parse") {
            InboundMessage::Progress(events) => events,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ping_is_classified_with_timestamp() {
        let message = InboundMessage::parse(r#"{"type":"ping","timestamp":1712.5}"#).expect("ping");
        assert_eq!(
            message,
            InboundMessage::Ping(PingFrame {
                timestamp: Some(1712.5)
            })
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = InboundMessage::parse("{not json").expect_err("should fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
        let err = InboundMessage::parse("[1,2]").expect_err("arrays are not messages");
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[test]
    fn structuring_payload_keeps_category_order_and_positions() {
        let events = progress(
            r#"{"stage":2,"status":"completed","categories":{
                "Mains":[{"name":"ラーメン","price":900}],
                "Appetizers":[{"name":"焼き鳥","price":"¥500"},"junk",{"name":"海老フライ"}]
            }}"#,
        );
        assert_eq!(
            events[0],
            ProgressEvent::StageTransition {
                stage: Stage::Structuring,
                ordinal: 2,
                status: StageStatus::Completed,
            }
        );
        let ProgressEvent::Structured { categories } = &events[1] else {
            panic!("expected structured event: {:?}", events[1]);
        };
        assert_eq!(categories[0].name, "Mains");
        assert_eq!(categories[0].entries[0].layer.price.as_deref(), Some("900"));
        let appetizers = &categories[1];
        assert_eq!(appetizers.skipped, 1);
        assert_eq!(appetizers.entries[1].position, 2);
        assert_eq!(appetizers.entries[1].original_name, "海老フライ");
    }

    #[test]
    fn translation_prefers_japanese_and_english_names() {
        let events = progress(
            r#"{"translatedCategories":{"Appetizers":[
                {"japanese_name":"焼き鳥","name":"ignored","english_name":"Yakitori"}
            ]}}"#,
        );
        let ProgressEvent::Translated { categories, .. } = &events[0] else {
            panic!("expected translated event");
        };
        let entry = &categories[0].entries[0];
        assert_eq!(entry.original_name, "焼き鳥");
        assert_eq!(entry.layer.translated_name.as_deref(), Some("Yakitori"));
        assert!(entry.layer.extra.is_empty());
    }

    #[test]
    fn enrichment_normalizes_lists_and_spice_level() {
        let events = progress(
            r#"{"finalMenu":{"Appetizers":[{
                "japanese_name":"焼き鳥","english_name":"Yakitori",
                "ingredients":"chicken, tare","allergens":["soy",""],
                "spice_level":2,"description":"  "
            }]}}"#,
        );
        let ProgressEvent::Enriched { depth, categories } = &events[0] else {
            panic!("expected enriched event");
        };
        assert_eq!(*depth, DetailDepth::Final);
        let layer = &categories[0].entries[0].layer;
        assert_eq!(
            layer.ingredients,
            Some(vec!["chicken".to_string(), "tare".to_string()])
        );
        assert_eq!(layer.allergens, Some(vec!["soy".to_string()]));
        assert_eq!(layer.spice_level, Some(SpiceLevel::Level(2)));
        assert_eq!(layer.description, None);
        assert_eq!(layer.translated_name.as_deref(), Some("Yakitori"));
    }

    #[test]
    fn enrichment_keeps_translated_name_and_price_together() {
        let events = progress(
            r#"{"partialMenu":{"Mains":[{
                "japanese_name":"ラーメン","translated_name":"Ramen","price":900,"chef_note":"x"
            }]}}"#,
        );
        let ProgressEvent::Enriched { depth, categories } = &events[0] else {
            panic!("expected enriched event");
        };
        assert_eq!(*depth, DetailDepth::Partial);
        let layer = &categories[0].entries[0].layer;
        assert_eq!(layer.translated_name.as_deref(), Some("Ramen"));
        assert_eq!(layer.extra.get("price"), Some(&Value::String("900".into())));
        assert_eq!(layer.extra.get("chef_note"), Some(&Value::String("x".into())));
    }

    #[test]
    fn mistyped_scalars_do_not_drop_the_message() {
        let events = progress(
            r#"{"stage":3,"progress_percent":"45","heartbeat":"yes","elapsed_time":[1],
                "status":7,"message":{"nested":true},
                "translatedCategories":{"Appetizers":[{"japanese_name":"焼き鳥","english_name":"Yakitori"}]}}"#,
        );
        assert_eq!(
            events[0],
            ProgressEvent::StageTransition {
                stage: Stage::Translating,
                ordinal: 3,
                status: StageStatus::Active,
            }
        );
        let ProgressEvent::Translated { categories, .. } = &events[1] else {
            panic!("expected translated event: {:?}", events[1]);
        };
        assert_eq!(
            categories[0].entries[0].layer.translated_name.as_deref(),
            Some("Yakitori")
        );
        assert_eq!(
            events[2],
            ProgressEvent::Reported(ReportedProgress {
                percent: Some(45.0),
                processing_category: None,
                elapsed_time: None,
                message: None,
                heartbeat: true,
            })
        );
    }

    #[test]
    fn non_object_payload_sections_are_ignored() {
        let events = progress(
            r#"{"stage":"2","categories":"pending","category_translations":{"前菜":"Appetizers","飲物":5}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::StageTransition { ordinal: 2, .. }));
        let ProgressEvent::Translated {
            categories,
            category_names,
        } = &events[1]
        else {
            panic!("expected category names: {:?}", events[1]);
        };
        assert!(categories.is_empty());
        assert_eq!(category_names.get("前菜").map(String::as_str), Some("Appetizers"));
        assert_eq!(category_names.get("飲物").map(String::as_str), Some("5"));
    }

    #[test]
    fn scalars_become_reported_progress() {
        let events = progress(
            r#"{"progress_percent":35,"processing_category":"Drinks","elapsed_time":12.5,"heartbeat":true}"#,
        );
        assert_eq!(
            events,
            vec![ProgressEvent::Reported(ReportedProgress {
                percent: Some(35.0),
                processing_category: Some("Drinks".into()),
                elapsed_time: Some(12.5),
                message: None,
                heartbeat: true,
            })]
        );
    }

    #[test]
    fn failure_and_completion_are_terminal_events() {
        let events = progress(r#"{"status":"error","error":"ocr backend down"}"#);
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Finished(PipelineStatus::Failed {
                message: "ocr backend down".into()
            }))
        );
        let events = progress(r#"{"type":"processing_completed"}"#);
        assert_eq!(events, vec![ProgressEvent::Finished(PipelineStatus::Completed)]);
    }

    #[test]
    fn unrecognized_shapes_are_kept_as_unknown() {
        let events = progress(r#"{"type":"image_generated","url":"x"}"#);
        assert_eq!(
            events,
            vec![ProgressEvent::Unknown {
                kind: Some("image_generated".into())
            }]
        );
    }

    #[test]
    fn upstream_health_requires_every_service() {
        let health: UpstreamHealth =
            serde_json::from_str(r#"{"status":"ok","services":{"ocr":true,"translate":false}}"#)
                .expect("health");
        assert!(!health.is_available());
        assert!(UpstreamHealth::default().is_available());
    }
}
