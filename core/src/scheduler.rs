//! Debounced batch scheduler
//!
//! Host pages mutate dozens of nodes per reflow. Candidates are collected
//! into a pending set and processed in one pass when the window closes.
//!
//! Policy: the timer is armed by the first candidate after an idle period and
//! is **not** restarted by later candidates. A continuous stream of mutations
//! therefore still produces a flush every `delay`, instead of starving.
//!
//! The scheduler does not own a timer. [`BatchScheduler::push`] tells the
//! caller when to arm one, and the caller invokes [`BatchScheduler::flush`]
//! when it fires. This keeps the policy testable without a clock.

use hashbrown::HashSet;
use std::hash::Hash;
use std::time::Duration;

#[derive(Debug)]
pub struct BatchScheduler<N> {
    delay: Duration,
    pending: Vec<N>,
    members: HashSet<N>,
    armed: bool,
    flush_count: u64,
}

impl<N: Clone + Eq + Hash> BatchScheduler<N> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Vec::new(),
            members: HashSet::new(),
            armed: false,
            flush_count: 0,
        }
    }

    /// Queue a candidate.
    ///
    /// Returns `Some(delay)` exactly when the caller must arm the flush timer:
    /// on the first candidate since the scheduler was last idle.
    pub fn push(&mut self, candidate: N) -> Option<Duration> {
        if self.members.insert(candidate.clone()) {
            self.pending.push(candidate);
        }
        if self.armed {
            None
        } else {
            self.armed = true;
            Some(self.delay)
        }
    }

    /// Drop a pending candidate (its element was removed)
    pub fn cancel(&mut self, candidate: &N) -> bool {
        if self.members.remove(candidate) {
            self.pending.retain(|c| c != candidate);
            true
        } else {
            false
        }
    }

    /// Drain the pending set in observation order and return to idle.
    pub fn flush(&mut self) -> Vec<N> {
        self.armed = false;
        self.members.clear();
        self.flush_count += 1;
        std::mem::take(&mut self.pending)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of flushes performed so far
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_coalesces_into_one_batch() {
        let mut scheduler = BatchScheduler::new(Duration::from_millis(250));

        let arms: Vec<_> = (0..20).map(|i| scheduler.push(i)).collect();
        assert_eq!(arms[0], Some(Duration::from_millis(250)));
        assert!(arms[1..].iter().all(Option::is_none));

        let batch = scheduler.flush();
        assert_eq!(batch, (0..20).collect::<Vec<_>>());
        assert_eq!(scheduler.flush_count(), 1);
        assert!(!scheduler.is_armed());
    }

    #[test]
    fn test_duplicates_keep_first_position() {
        let mut scheduler = BatchScheduler::new(Duration::from_millis(100));
        for c in ["a", "b", "a", "c", "b"] {
            scheduler.push(c);
        }
        assert_eq!(scheduler.flush(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_timer_rearms_after_flush() {
        let mut scheduler = BatchScheduler::new(Duration::from_millis(100));
        assert!(scheduler.push(1).is_some());
        assert!(scheduler.push(2).is_none());
        scheduler.flush();

        assert!(scheduler.push(3).is_some());
        assert_eq!(scheduler.flush(), vec![3]);
        assert_eq!(scheduler.flush_count(), 2);
    }

    #[test]
    fn test_cancel_removes_pending_candidate() {
        let mut scheduler = BatchScheduler::new(Duration::from_millis(100));
        scheduler.push(1);
        scheduler.push(2);
        assert!(scheduler.cancel(&1));
        assert!(!scheduler.cancel(&9));
        assert_eq!(scheduler.pending_len(), 1);

        // Still armed: the timer already running will flush what is left.
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.flush(), vec![2]);
    }

    #[test]
    fn test_empty_flush_is_harmless() {
        let mut scheduler: BatchScheduler<u32> = BatchScheduler::new(Duration::from_millis(100));
        assert!(scheduler.flush().is_empty());
        assert!(scheduler.push(7).is_some());
    }
}
