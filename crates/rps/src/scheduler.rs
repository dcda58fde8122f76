//! Timeout scheduler: trigger block -> games awaiting a deadline action.
//!
//! Avoids rescanning every tracked game on every confirmed block. Games whose
//! action is still not legal when popped are re-inserted by the caller at
//! their recomputed trigger block.

use crate::game::GameId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    queue: BTreeMap<u64, BTreeSet<GameId>>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` to be revisited once `trigger_block` is confirmed.
    /// Scheduling the same game twice at the same block is a no-op.
    pub fn schedule(&mut self, id: GameId, trigger_block: u64) {
        self.queue.entry(trigger_block).or_default().insert(id);
    }

    /// Drop a game from every pending trigger (e.g. once completed).
    pub fn remove(&mut self, id: GameId) {
        self.queue.retain(|_, games| {
            games.remove(&id);
            !games.is_empty()
        });
    }

    /// Pop every game scheduled at a block <= `confirmed_block`, in ascending
    /// trigger order. A game queued under several due triggers is returned
    /// once.
    pub fn pop_due(&mut self, confirmed_block: u64) -> Vec<GameId> {
        let mut due = Vec::new();
        let mut seen = BTreeSet::new();
        while let Some((&block, _)) = self.queue.first_key_value() {
            if block > confirmed_block {
                break;
            }
            let games = self.queue.remove(&block).unwrap_or_default();
            for id in games {
                if seen.insert(id) {
                    due.push(id);
                }
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.values().map(|g| g.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_ascending_trigger_order() {
        let mut scheduler = TimeoutScheduler::new();
        scheduler.schedule(3, 40);
        scheduler.schedule(1, 20);
        scheduler.schedule(2, 30);
        assert_eq!(scheduler.pop_due(35), vec![1, 2]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pop_due(40), vec![3]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn nothing_due_before_trigger() {
        let mut scheduler = TimeoutScheduler::new();
        scheduler.schedule(1, 31);
        assert!(scheduler.pop_due(30).is_empty());
        assert_eq!(scheduler.pop_due(31), vec![1]);
    }

    #[test]
    fn duplicate_schedule_is_noop() {
        let mut scheduler = TimeoutScheduler::new();
        scheduler.schedule(1, 10);
        scheduler.schedule(1, 10);
        scheduler.schedule(1, 12);
        assert_eq!(scheduler.pop_due(12), vec![1]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn remove_clears_all_triggers() {
        let mut scheduler = TimeoutScheduler::new();
        scheduler.schedule(1, 10);
        scheduler.schedule(1, 20);
        scheduler.schedule(2, 20);
        scheduler.remove(1);
        assert_eq!(scheduler.pop_due(20), vec![2]);
    }
}
