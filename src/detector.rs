//! New-work detection between successive snapshots.
//!
//! The detector owns the baseline from the previous accepted snapshot. The
//! first evaluation only establishes that baseline; every later evaluation
//! decides whether the operator should hear the alert, then moves the
//! baseline to the new snapshot unconditionally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::order::{Order, OrderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeDetection {
    /// Alert when the active count strictly grows. An arrival and a departure
    /// inside one poll interval cancel out and stay silent.
    #[default]
    Count,
    /// Alert when any active id was absent from the previous snapshot.
    NewIds,
}

impl ChangeDetection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "count" => Some(Self::Count),
            "newids" | "ids" => Some(Self::NewIds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Baseline {
    /// No snapshot reconciled yet.
    Unset,
    Seen { count: usize, ids: BTreeSet<OrderId> },
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    mode: ChangeDetection,
    baseline: Baseline,
}

impl ChangeDetector {
    pub fn new(mode: ChangeDetection) -> Self {
        Self {
            mode,
            baseline: Baseline::Unset,
        }
    }

    /// Last reconciled active count, or `None` before the first snapshot.
    pub fn previous_count(&self) -> Option<usize> {
        match &self.baseline {
            Baseline::Unset => None,
            Baseline::Seen { count, .. } => Some(*count),
        }
    }

    /// Compare `active` against the baseline and return whether to alert.
    /// The baseline always advances to `active`.
    pub fn evaluate(&mut self, active: &[Order]) -> bool {
        let ids: BTreeSet<OrderId> = active.iter().map(|o| o.id.clone()).collect();
        let count = active.len();

        let triggered = match (&self.baseline, self.mode) {
            (Baseline::Unset, _) => false,
            (Baseline::Seen { count: previous, .. }, ChangeDetection::Count) => count > *previous,
            (Baseline::Seen { ids: previous, .. }, ChangeDetection::NewIds) => {
                !ids.is_subset(previous)
            }
        };

        self.baseline = Baseline::Seen { count, ids };
        triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;

    fn orders(ids: &[&str]) -> Vec<Order> {
        ids.iter()
            .map(|id| Order::new(*id, OrderStatus::Accepted))
            .collect()
    }

    #[test]
    fn test_first_snapshot_never_triggers() {
        let mut detector = ChangeDetector::new(ChangeDetection::Count);
        assert_eq!(detector.previous_count(), None);
        assert!(!detector.evaluate(&orders(&["1", "2", "3"])));
        assert_eq!(detector.previous_count(), Some(3));
    }

    #[test]
    fn test_growth_triggers_once() {
        let mut detector = ChangeDetector::new(ChangeDetection::Count);
        detector.evaluate(&orders(&["1"]));
        assert!(detector.evaluate(&orders(&["2", "1"])));
        assert_eq!(detector.previous_count(), Some(2));
        assert!(!detector.evaluate(&orders(&["2", "1"])));
        assert_eq!(detector.previous_count(), Some(2));
    }

    #[test]
    fn test_zero_is_a_real_baseline() {
        let mut detector = ChangeDetector::new(ChangeDetection::Count);
        assert!(!detector.evaluate(&[]));
        assert_eq!(detector.previous_count(), Some(0));
        assert!(detector.evaluate(&orders(&["1"])));
    }

    #[test]
    fn test_shrink_moves_baseline_down() {
        let mut detector = ChangeDetector::new(ChangeDetection::Count);
        detector.evaluate(&orders(&["1", "2", "3"]));
        assert!(!detector.evaluate(&orders(&["1"])));
        assert_eq!(detector.previous_count(), Some(1));
        assert!(detector.evaluate(&orders(&["1", "4"])));
    }

    #[test]
    fn test_count_mode_misses_swap() {
        let mut detector = ChangeDetector::new(ChangeDetection::Count);
        detector.evaluate(&orders(&["1", "2"]));
        assert!(!detector.evaluate(&orders(&["3", "2"])));
    }

    #[test]
    fn test_new_ids_mode_catches_swap() {
        let mut detector = ChangeDetector::new(ChangeDetection::NewIds);
        assert!(!detector.evaluate(&orders(&["1", "2"])));
        assert!(detector.evaluate(&orders(&["3", "2"])));
        assert!(!detector.evaluate(&orders(&["3"])));
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(ChangeDetection::parse("count"), Some(ChangeDetection::Count));
        assert_eq!(ChangeDetection::parse("new_ids"), Some(ChangeDetection::NewIds));
        assert_eq!(ChangeDetection::parse("diff"), None);
    }
}
