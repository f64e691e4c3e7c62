//! Diffing the scheduled monitor set against a fresh read of the store.

use std::collections::{HashMap, HashSet};

use crate::db::Monitor;

/// Changes needed to bring the in-memory set in line with the store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcilePlan {
    /// Active in the store, not yet scheduled.
    pub added: Vec<Monitor>,
    /// Scheduled, but deleted or deactivated.
    pub removed: Vec<i64>,
    /// Same interval, configuration changed; refreshed in place.
    pub updated: Vec<Monitor>,
    /// Interval changed; leaves its old group for a new one.
    pub moved: Vec<Monitor>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty() && self.moved.is_empty()
    }
}

/// Diff by monitor id. Output lists are sorted by id.
pub fn plan_reconcile(current: &HashMap<i64, Monitor>, fresh: &[Monitor]) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut seen = HashSet::with_capacity(fresh.len());

    for monitor in fresh {
        if !seen.insert(monitor.id) {
            continue;
        }
        match current.get(&monitor.id) {
            None => plan.added.push(monitor.clone()),
            Some(cached) if cached.interval_secs() != monitor.interval_secs() => {
                plan.moved.push(monitor.clone())
            }
            Some(cached) if cached != monitor => plan.updated.push(monitor.clone()),
            Some(_) => {}
        }
    }

    plan.removed = current.keys().filter(|id| !seen.contains(id)).copied().collect();

    plan.added.sort_by_key(|m| m.id);
    plan.updated.sort_by_key(|m| m.id);
    plan.moved.sort_by_key(|m| m.id);
    plan.removed.sort_unstable();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_monitor;

    fn monitor(id: i64, interval: i64) -> Monitor {
        Monitor {
            id,
            ..test_monitor("http://example.com", interval)
        }
    }

    fn current(monitors: &[Monitor]) -> HashMap<i64, Monitor> {
        monitors.iter().map(|m| (m.id, m.clone())).collect()
    }

    #[test]
    fn test_unchanged_set_is_empty_plan() {
        let monitors = vec![monitor(1, 60), monitor(2, 300)];
        assert!(plan_reconcile(&current(&monitors), &monitors).is_empty());
    }

    #[test]
    fn test_added_and_removed() {
        let before = current(&[monitor(1, 60), monitor(2, 60)]);
        let fresh = vec![monitor(2, 60), monitor(3, 120)];

        let plan = plan_reconcile(&before, &fresh);
        assert_eq!(plan.added.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(plan.removed, vec![1]);
        assert!(plan.updated.is_empty());
        assert!(plan.moved.is_empty());
    }

    #[test]
    fn test_config_edit_is_update_interval_edit_is_move() {
        let before = current(&[monitor(1, 60), monitor(2, 60)]);

        let mut edited = monitor(1, 60);
        edited.url = "http://example.com/v2".to_string();
        let moved = monitor(2, 300);

        let plan = plan_reconcile(&before, &[edited.clone(), moved.clone()]);
        assert_eq!(plan.updated, vec![edited]);
        assert_eq!(plan.moved, vec![moved]);
        assert!(plan.added.is_empty());
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_empty_store_removes_everything() {
        let before = current(&[monitor(3, 60), monitor(1, 60)]);
        let plan = plan_reconcile(&before, &[]);
        assert_eq!(plan.removed, vec![1, 3]);
    }
}
