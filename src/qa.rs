//! Per-loan validation summary
//!
//! Monthly fields count one observation per month, so a field that failed in
//! three months reports three failures. Static fields hold one value per loan
//! and report a single observation that fails only when every month failed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::model::Validity;

/// How a field's monthly flags are folded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QaMode {
    /// One observation per month
    #[default]
    Monthly,
    /// One observation per loan, passing if any month passed
    Static,
    /// Never reported
    Excluded,
}

/// Fold the flags of a static field into one: pass if any month passed
///
/// `None` when there are no flags.
#[must_use]
pub fn fold_best(flags: impl IntoIterator<Item = Validity>) -> Option<Validity> {
    flags.into_iter().fold(None, |best, flag| match (best, flag.failed()) {
        (Some(Validity::Pass), _) | (_, false) => Some(Validity::Pass),
        _ => Some(Validity::Fail),
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    mode: QaMode,
    observed: u32,
    failed: u32,
    best: Option<Validity>,
}

impl Tally {
    /// Observations and failures after folding
    const fn folded(&self) -> (u32, u32) {
        match self.mode {
            QaMode::Monthly => (self.observed, self.failed),
            QaMode::Static => match self.best {
                None => (0, 0),
                Some(flag) => (1, if flag.failed() { 1 } else { 0 }),
            },
            QaMode::Excluded => (0, 0),
        }
    }
}

/// Accumulates validity flags for one loan
#[derive(Debug, Default, Clone)]
pub struct QaTracker {
    fields: FxHashMap<Arc<str>, Tally>,
}

impl QaTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one month's flag for `field`
    ///
    /// The first call for a field fixes its mode.
    pub fn record(&mut self, field: &Arc<str>, mode: QaMode, validity: Validity) {
        if mode == QaMode::Excluded {
            return;
        }
        let tally = self.fields.entry(Arc::clone(field)).or_insert(Tally {
            mode,
            ..Tally::default()
        });
        tally.observed += 1;
        if validity.failed() {
            tally.failed += 1;
        }
        tally.best = fold_best(tally.best.into_iter().chain([validity]));
    }

    /// Summarize without consuming, so calling it twice gives the same answer
    #[must_use]
    pub fn summary(&self) -> QaSummary {
        let mut summary = QaSummary::default();
        for (name, tally) in &self.fields {
            let (observed, failed) = tally.folded();
            if observed == 0 {
                continue;
            }
            summary.failures.insert(Arc::clone(name), failed);
            if failed == observed {
                summary.systematic.insert(Arc::clone(name));
            }
        }
        summary
    }
}

/// QA outcome for one loan
///
/// `failures` holds every observed field, including those with no failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QaSummary {
    /// Failure count per observed field
    pub failures: BTreeMap<Arc<str>, u32>,
    /// Fields that failed in every observation
    pub systematic: BTreeSet<Arc<str>>,
}

impl QaSummary {
    /// Fields with at least one failure, with their counts, in name order
    pub fn failing(&self) -> impl Iterator<Item = (&Arc<str>, u32)> {
        self.failures
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, count)| (name, *count))
    }

    /// Failure count for a field, `None` if it was never observed
    #[must_use]
    pub fn failures_of(&self, field: &str) -> Option<u32> {
        self.failures.get(field).copied()
    }

    /// Whether the field failed every time it was observed
    #[must_use]
    pub fn is_systematic(&self, field: &str) -> bool {
        self.systematic.contains(field)
    }

    /// True when no field failed
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.values().all(|count| *count == 0)
    }
}
