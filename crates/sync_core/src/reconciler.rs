use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{
        BaseLayer, CompletenessState, DetailLayer, ItemId, PipelineStatus, SessionId, SpiceLevel,
        Stage, StageStatus, TranslatedLayer,
    },
    protocol::{CategoryPayload, DetailDepth, ProgressEvent, ReportedProgress},
};
use tracing::{debug, warn};

use crate::{
    identity::{IdentityResolver, Resolution},
    progress::{self, CategoryCounts, ProgressSummary, ReportedScalars},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuItemRecord {
    pub item_id: ItemId,
    pub original_name: String,
    pub base: Option<BaseLayer>,
    pub translated: Option<TranslatedLayer>,
    pub partial: Option<DetailLayer>,
    #[serde(rename = "final")]
    pub final_layer: Option<DetailLayer>,
    state: CompletenessState,
}

impl MenuItemRecord {
    fn new(item_id: ItemId, original_name: &str) -> Self {
        Self {
            item_id,
            original_name: original_name.trim().to_string(),
            base: None,
            translated: None,
            partial: None,
            final_layer: None,
            state: CompletenessState::Pending,
        }
    }

    pub fn state(&self) -> CompletenessState {
        self.state
    }

    /// The one precedence table: final > partial > translated > base.
    fn derive_state(&self) -> CompletenessState {
        if self.final_layer.is_some() {
            CompletenessState::Complete
        } else if self.partial.is_some() {
            CompletenessState::PartiallyDetailed
        } else if self.translated.is_some() {
            CompletenessState::Translated
        } else {
            CompletenessState::Pending
        }
    }

    fn refresh(&mut self) {
        self.state = self.derive_state();
    }

    fn note_name(&mut self, original_name: &str) {
        if self.original_name.is_empty() {
            self.original_name = original_name.trim().to_string();
        }
    }

    /// Highest enrichment layer present. Detail fields are shown from this layer only.
    fn top_detail(&self) -> Option<&DetailLayer> {
        self.final_layer.as_ref().or(self.partial.as_ref())
    }

    pub fn view(&self) -> ItemView {
        let detail = self.top_detail();
        let translated_name = detail
            .and_then(|d| d.translated_name.clone())
            .or_else(|| self.translated.as_ref().and_then(|t| t.translated_name.clone()));
        let price = self
            .translated
            .as_ref()
            .and_then(|t| t.price.clone())
            .or_else(|| self.base.as_ref().and_then(|b| b.price.clone()));

        ItemView {
            item_id: self.item_id.clone(),
            original_name: self.original_name.clone(),
            translated_name,
            price,
            description: detail.and_then(|d| d.description.clone()),
            ingredients: detail.and_then(|d| d.ingredients.clone()),
            cooking_method: detail.and_then(|d| d.cooking_method.clone()),
            cultural_background: detail.and_then(|d| d.cultural_background.clone()),
            allergens: detail.and_then(|d| d.allergens.clone()),
            spice_level: detail.and_then(|d| d.spice_level.clone()),
            state: self.state,
        }
    }
}

/// Display projection of a [`MenuItemRecord`]. Consumers read `state` from here and
/// never recompute it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    pub item_id: ItemId,
    pub original_name: String,
    pub translated_name: Option<String>,
    pub price: Option<String>,
    pub description: Option<String>,
    pub ingredients: Option<Vec<String>>,
    pub cooking_method: Option<String>,
    pub cultural_background: Option<String>,
    pub allergens: Option<Vec<String>>,
    pub spice_level: Option<SpiceLevel>,
    pub state: CompletenessState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub name: String,
    pub translated_name: Option<String>,
    pub items: Vec<MenuItemRecord>,
    /// Populated by a structuring payload at least once.
    pub structured: bool,
    counts: CategoryCounts,
    percent: u8,
}

impl Category {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            translated_name: None,
            items: Vec::new(),
            structured: false,
            counts: CategoryCounts::default(),
            percent: 0,
        }
    }

    pub fn counts(&self) -> &CategoryCounts {
        &self.counts
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn item(&self, id: &ItemId) -> Option<&MenuItemRecord> {
        self.items.iter().find(|item| &item.item_id == id)
    }

    pub fn item_named(&self, original_name: &str) -> Option<&MenuItemRecord> {
        self.items
            .iter()
            .find(|item| item.original_name == original_name.trim())
    }

    /// Full re-scan; replayed events can never double count.
    fn recount(&mut self) {
        self.counts = CategoryCounts::tally(self.items.iter().map(MenuItemRecord::state));
        self.percent = self.counts.percent();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub stage: Stage,
    /// Highest raw stage ordinal the pipeline reported.
    pub pipeline_ordinal: u64,
    pub stage_history: Vec<StageEntry>,
    pub completed_stages: Vec<Stage>,
    pub status: PipelineStatus,
    pub categories: Vec<Category>,
    pub reported: ReportedScalars,
    pub progress: ProgressSummary,
    #[serde(skip)]
    identities: IdentityResolver,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            stage: Stage::Scanning,
            pipeline_ordinal: 0,
            stage_history: Vec::new(),
            completed_stages: Vec::new(),
            status: PipelineStatus::Running,
            categories: Vec::new(),
            reported: ReportedScalars::default(),
            progress: ProgressSummary::default(),
            identities: IdentityResolver::new(),
        }
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|category| category.name == name)
    }

    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }

    /// Structuring is over once it is reported completed or any later stage starts.
    pub fn structure_complete(&self) -> bool {
        self.stage > Stage::Structuring || self.completed_stages.contains(&Stage::Structuring)
    }

    fn apply(&mut self, event: &ProgressEvent, at: DateTime<Utc>) {
        match event {
            ProgressEvent::StageTransition {
                stage,
                ordinal,
                status,
            } => self.transition(*stage, *ordinal, *status, at),
            ProgressEvent::Structured { categories } => {
                self.merge(categories, true, |item, layer: &BaseLayer| {
                    item.base.get_or_insert_with(BaseLayer::default).absorb(layer.clone());
                });
            }
            ProgressEvent::Translated {
                categories,
                category_names,
            } => {
                self.merge(categories, false, |item, layer: &TranslatedLayer| {
                    item.translated
                        .get_or_insert_with(TranslatedLayer::default)
                        .absorb(layer.clone());
                });
                for (name, translated) in category_names {
                    let translated = translated.trim();
                    if translated.is_empty() {
                        continue;
                    }
                    if let Some(category) = self.categories.iter_mut().find(|c| &c.name == name) {
                        category.translated_name = Some(translated.to_string());
                    }
                }
            }
            ProgressEvent::Enriched { depth, categories } => {
                let depth = *depth;
                self.merge(categories, false, move |item, layer: &DetailLayer| {
                    let slot = match depth {
                        DetailDepth::Partial => &mut item.partial,
                        DetailDepth::Final => &mut item.final_layer,
                    };
                    slot.get_or_insert_with(DetailLayer::default)
                        .absorb(layer.clone());
                });
            }
            ProgressEvent::Reported(reported) => self.record_reported(reported),
            ProgressEvent::Finished(status) => {
                if !self.status.is_terminal() {
                    self.status = status.clone();
                }
            }
            ProgressEvent::Unknown { kind } => {
                warn!(
                    session_id = %self.session_id,
                    kind = kind.as_deref().unwrap_or("<none>"),
                    "ignoring unrecognized progress event"
                );
            }
        }
        self.progress = progress::summarize(
            self.stage,
            self.categories.iter().map(Category::counts),
            &self.reported,
        );
    }

    fn transition(&mut self, stage: Stage, ordinal: u64, status: StageStatus, at: DateTime<Utc>) {
        self.pipeline_ordinal = self.pipeline_ordinal.max(ordinal);
        if stage < self.stage {
            debug!(
                session_id = %self.session_id,
                current = self.stage.as_str(),
                reported = stage.as_str(),
                "ignoring stage regression"
            );
        } else if !self.stage_history.iter().any(|entry| entry.stage == stage) {
            self.stage = stage;
            self.stage_history.push(StageEntry {
                stage,
                entered_at: at,
            });
        }
        if status == StageStatus::Completed && !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
            self.completed_stages.sort();
        }
    }

    fn merge<L>(
        &mut self,
        payloads: &[CategoryPayload<L>],
        structuring: bool,
        apply_layer: impl Fn(&mut MenuItemRecord, &L),
    ) {
        let structure_complete = self.structure_complete();
        for payload in payloads {
            if payload.skipped > 0 {
                warn!(
                    session_id = %self.session_id,
                    category = %payload.name,
                    skipped = payload.skipped,
                    "skipping malformed menu entries"
                );
            }

            let index = match self.categories.iter().position(|c| c.name == payload.name) {
                Some(index) => index,
                None if structuring || !payload.entries.is_empty() => {
                    self.categories.push(Category::new(&payload.name));
                    self.categories.len() - 1
                }
                None => continue,
            };
            let category = &mut self.categories[index];
            let frozen = category.structured && structure_complete;
            let mut batch = self.identities.batch(&payload.name, frozen);

            for entry in &payload.entries {
                let slot = match batch.resolve(&entry.original_name, entry.position) {
                    Resolution::Existing(id) => {
                        match category.items.iter().position(|item| item.item_id == id) {
                            Some(slot) => slot,
                            None => push_item(&mut category.items, id, &entry.original_name),
                        }
                    }
                    Resolution::Minted(id) => {
                        push_item(&mut category.items, id, &entry.original_name)
                    }
                    Resolution::Rejected => {
                        warn!(
                            session_id = %self.session_id,
                            category = %payload.name,
                            item = %entry.original_name,
                            position = entry.position,
                            "category item set is fixed; dropping unknown item"
                        );
                        continue;
                    }
                };
                let item = &mut category.items[slot];
                item.note_name(&entry.original_name);
                apply_layer(item, &entry.layer);
                item.refresh();
            }

            if structuring {
                category.structured = true;
            }
            category.recount();
        }
    }

    fn record_reported(&mut self, reported: &ReportedProgress) {
        if let Some(percent) = reported.percent {
            self.reported.percent = Some(percent);
        }
        if let Some(category) = &reported.processing_category {
            self.reported.processing_category = Some(category.clone());
        }
        if let Some(elapsed) = reported.elapsed_time {
            self.reported.elapsed_time = Some(elapsed);
        }
        if let Some(message) = &reported.message {
            self.reported.message = Some(message.clone());
        }
    }
}

fn push_item(items: &mut Vec<MenuItemRecord>, id: ItemId, original_name: &str) -> usize {
    items.push(MenuItemRecord::new(id, original_name));
    items.len() - 1
}

/// Pure merge step: the state after `event`, leaving `state` untouched.
pub fn reduce(state: &SessionState, event: &ProgressEvent, at: DateTime<Utc>) -> SessionState {
    let mut next = state.clone();
    next.apply(event, at);
    next
}

/// Owns the Session State for one session.
#[derive(Debug, Clone)]
pub struct Reconciler {
    state: SessionState,
}

impl Reconciler {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            state: SessionState::new(session_id),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns whether the event changed anything.
    pub fn apply(&mut self, event: &ProgressEvent, at: DateTime<Utc>) -> bool {
        let next = reduce(&self.state, event, at);
        let changed = next != self.state;
        self.state = next;
        changed
    }

    pub fn apply_all<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a ProgressEvent>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        for event in events {
            changed |= self.apply(event, at);
        }
        changed
    }

    /// Drops everything accumulated for a restarted run of the same session.
    pub fn reset(&mut self) {
        self.state = SessionState::new(self.state.session_id.clone());
    }

    pub fn into_state(self) -> SessionState {
        self.state
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
