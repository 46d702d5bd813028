use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Pipeline phase. Ordering follows the pipeline, so `Ord` doubles as "later than".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scanning,
    Structuring,
    Translating,
    Enriching,
}

impl Stage {
    /// Wire ordinals are 1-based; anything past 3 is enrichment work.
    pub fn from_ordinal(ordinal: u64) -> Self {
        match ordinal {
            0 | 1 => Stage::Scanning,
            2 => Stage::Structuring,
            3 => Stage::Translating,
            _ => Stage::Enriching,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "scanning" | "ocr" => Some(Stage::Scanning),
            "structuring" | "categorize" | "categorization" => Some(Stage::Structuring),
            "translating" | "translation" => Some(Stage::Translating),
            "enriching" | "enrichment" | "description" | "details" => Some(Stage::Enriching),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u64 {
        match self {
            Stage::Scanning => 1,
            Stage::Structuring => 2,
            Stage::Translating => 3,
            Stage::Enriching => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scanning => "scanning",
            Stage::Structuring => "structuring",
            Stage::Translating => "translating",
            Stage::Enriching => "enriching",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Active,
    Completed,
}

impl StageStatus {
    pub fn from_wire(status: Option<&str>) -> Self {
        match status.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "completed" || s == "complete" || s == "done" => {
                StageStatus::Completed
            }
            _ => StageStatus::Active,
        }
    }
}

/// Derived per-item lifecycle tag. Never stored independently of the layers it
/// is computed from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessState {
    #[default]
    Pending,
    Translated,
    PartiallyDetailed,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Running,
    Completed,
    Failed {
        message: String,
    },
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ItemKey {
    /// Normalized original-language name.
    Name(String),
    /// Position within the category's first payload that mentioned the item.
    Position(usize),
}

/// Synthetic item identity, scoped to a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub category: String,
    pub key: ItemKey,
}

impl ItemId {
    pub fn named(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: ItemKey::Name(key.into()),
        }
    }

    pub fn positional(category: impl Into<String>, position: usize) -> Self {
        Self {
            category: category.into(),
            key: ItemKey::Position(position),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            ItemKey::Name(name) => write!(f, "{}/name:{}", self.category, name),
            ItemKey::Position(position) => write!(f, "{}/pos:{}", self.category, position),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpiceLevel {
    Level(u8),
    Label(String),
}

/// Data from the structuring stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl BaseLayer {
    pub fn absorb(&mut self, incoming: BaseLayer) {
        absorb_field(&mut self.price, incoming.price);
        self.extra.extend(incoming.extra);
    }
}

/// Data from the translation stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslatedLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl TranslatedLayer {
    pub fn absorb(&mut self, incoming: TranslatedLayer) {
        absorb_field(&mut self.translated_name, incoming.translated_name);
        absorb_field(&mut self.price, incoming.price);
        self.extra.extend(incoming.extra);
    }
}

/// Enrichment data. The same shape is used for the partial and the final layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooking_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultural_background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allergens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice_level: Option<SpiceLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl DetailLayer {
    pub fn absorb(&mut self, incoming: DetailLayer) {
        absorb_field(&mut self.translated_name, incoming.translated_name);
        absorb_field(&mut self.description, incoming.description);
        absorb_field(&mut self.ingredients, incoming.ingredients);
        absorb_field(&mut self.cooking_method, incoming.cooking_method);
        absorb_field(&mut self.cultural_background, incoming.cultural_background);
        absorb_field(&mut self.allergens, incoming.allergens);
        absorb_field(&mut self.spice_level, incoming.spice_level);
        self.extra.extend(incoming.extra);
    }
}

fn absorb_field<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if let Some(value) = incoming {
        *slot = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ordinals_saturate_into_enriching() {
        assert_eq!(Stage::from_ordinal(1), Stage::Scanning);
        assert_eq!(Stage::from_ordinal(3), Stage::Translating);
        assert_eq!(Stage::from_ordinal(4), Stage::Enriching);
        assert_eq!(Stage::from_ordinal(6), Stage::Enriching);
        assert!(Stage::Structuring < Stage::Translating);
    }

    #[test]
    fn absorb_keeps_fields_missing_from_newer_layer() {
        let mut stored = DetailLayer {
            description: Some("grilled chicken skewers".into()),
            allergens: Some(vec!["soy".into()]),
            ..DetailLayer::default()
        };
        stored.absorb(DetailLayer {
            cooking_method: Some("grilled".into()),
            ..DetailLayer::default()
        });

        assert_eq!(stored.description.as_deref(), Some("grilled chicken skewers"));
        assert_eq!(stored.cooking_method.as_deref(), Some("grilled"));
        assert_eq!(stored.allergens, Some(vec!["soy".to_string()]));
    }

    #[test]
    fn item_id_display_distinguishes_key_kinds() {
        assert_eq!(
            ItemId::named("Drinks", "beer").to_string(),
            "Drinks/name:beer"
        );
        assert_eq!(ItemId::positional("Drinks", 3).to_string(), "Drinks/pos:3");
    }
}
