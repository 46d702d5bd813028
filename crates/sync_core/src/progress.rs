use serde::Serialize;
use shared::domain::{CompletenessState, Stage};

/// Exclusive per-state tallies: `pending + translated + partial + complete == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub total: usize,
    pub pending: usize,
    pub translated: usize,
    pub partial: usize,
    pub complete: usize,
}

impl CategoryCounts {
    pub fn tally(states: impl IntoIterator<Item = CompletenessState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.total += 1;
            match state {
                CompletenessState::Pending => counts.pending += 1,
                CompletenessState::Translated => counts.translated += 1,
                CompletenessState::PartiallyDetailed => counts.partial += 1,
                CompletenessState::Complete => counts.complete += 1,
            }
        }
        counts
    }

    pub fn add(&mut self, other: &CategoryCounts) {
        self.total += other.total;
        self.pending += other.pending;
        self.translated += other.translated;
        self.partial += other.partial;
        self.complete += other.complete;
    }

    pub fn percent(&self) -> u8 {
        completion_percent(self.complete, self.partial, self.total)
    }
}

/// `round((complete + partial * 0.5) / total * 100)`, or 0 for an empty category.
/// Translated-only items do not count.
pub fn completion_percent(complete: usize, partial: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let ratio = (complete as f64 + partial as f64 * 0.5) / total as f64;
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentSource {
    /// Coarse figure carried on pipeline events.
    #[default]
    Reported,
    /// Derived from item completeness.
    Items,
}

/// Scalars the pipeline reports directly; last value wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportedScalars {
    pub percent: Option<f64>,
    pub processing_category: Option<String>,
    pub elapsed_time: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub percent: u8,
    pub source: PercentSource,
    pub totals: CategoryCounts,
    pub processing_category: Option<String>,
    pub elapsed_time: Option<f64>,
    pub message: Option<String>,
}

pub fn summarize<'a>(
    stage: Stage,
    categories: impl IntoIterator<Item = &'a CategoryCounts>,
    reported: &ReportedScalars,
) -> ProgressSummary {
    let mut totals = CategoryCounts::default();
    for counts in categories {
        totals.add(counts);
    }

    let (percent, source) = if stage >= Stage::Translating {
        (totals.percent(), PercentSource::Items)
    } else {
        let coarse = reported
            .percent
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(0);
        (coarse, PercentSource::Reported)
    };

    ProgressSummary {
        percent,
        source,
        totals,
        processing_category: reported.processing_category.clone(),
        elapsed_time: reported.elapsed_time,
        message: reported.message.clone(),
    }
}
