//! Delta-queue timer service.
//!
//! Pending timers are kept sorted by deadline; each entry stores only the
//! delta from its predecessor, so re-basing the whole queue against the
//! wall clock touches a single entry. Every operation re-bases first, which
//! keeps deltas meaningful no matter how long the caller slept between
//! calls.
//!
//! [`TimerQueue::advance`] shifts the queue's notion of elapsed time
//! without sleeping, which is how tests and simulations drive expiry.

use std::time::Instant;

struct TimerEntry<K> {
    key: K,
    /// Seconds after the predecessor entry (after the reference instant
    /// for the head). May go negative once the deadline has passed.
    delta: f64,
}

/// An ordered queue of one-shot timers identified by caller-chosen keys.
pub struct TimerQueue<K> {
    entries: Vec<TimerEntry<K>>,
    reference: Instant,
    skew: f64,
}

impl<K: Copy + PartialEq> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            reference: Instant::now(),
            skew: 0.0,
        }
    }

    /// Folds wall-clock time elapsed since the last call into the head
    /// entry's delta.
    fn refresh(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.reference).as_secs_f64() + self.skew;
        self.skew = 0.0;
        self.reference = now;
        if let Some(head) = self.entries.first_mut() {
            head.delta -= elapsed;
        }
    }

    /// Pretends `secs` seconds have passed.
    pub fn advance(&mut self, secs: f64) {
        self.skew += secs;
    }

    /// Schedules `key` to fire in `secs` seconds. An already pending timer
    /// with the same key is rescheduled.
    pub fn schedule(&mut self, key: K, secs: f64) {
        self.cancel(key);
        self.refresh();
        let mut remaining = secs;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if remaining < entry.delta {
                entry.delta -= remaining;
                self.entries.insert(
                    i,
                    TimerEntry {
                        key,
                        delta: remaining,
                    },
                );
                return;
            }
            remaining -= entry.delta;
        }
        self.entries.push(TimerEntry {
            key,
            delta: remaining,
        });
    }

    /// Cancels a pending timer. Returns whether it was pending.
    pub fn cancel(&mut self, key: K) -> bool {
        self.refresh();
        let Some(index) = self.entries.iter().position(|e| e.key == key) else {
            return false;
        };
        let removed = self.entries.remove(index);
        if let Some(next) = self.entries.get_mut(index) {
            next.delta += removed.delta;
        }
        true
    }

    pub fn is_scheduled(&self, key: K) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Seconds until `key` fires, or `None` when it is not pending.
    pub fn remaining(&mut self, key: K) -> Option<f64> {
        self.refresh();
        let mut total = 0.0;
        for entry in &self.entries {
            total += entry.delta;
            if entry.key == key {
                return Some(total);
            }
        }
        None
    }

    /// Seconds until the next timer fires (zero when overdue), or `None`
    /// for an empty queue.
    pub fn next_deadline(&mut self) -> Option<f64> {
        self.refresh();
        self.entries.first().map(|e| e.delta.max(0.0))
    }

    /// Removes and returns every timer whose deadline has passed, in
    /// firing order.
    pub fn pop_expired(&mut self) -> Vec<K> {
        self.refresh();
        let mut fired = Vec::new();
        while let Some(head) = self.entries.first() {
            if head.delta > 0.0 {
                break;
            }
            let head = self.entries.remove(0);
            if let Some(next) = self.entries.first_mut() {
                next.delta += head.delta;
            }
            fired.push(head.key);
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Copy + PartialEq> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 0.05;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        q.schedule(1, 1.0);
        q.schedule(3, 3.0);
        q.schedule(2, 2.0);
        q.advance(10.0);
        assert_eq!(q.pop_expired(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_partial_expiry() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        q.schedule(1, 1.0);
        q.schedule(2, 3.0);
        q.advance(1.5);
        assert_eq!(q.pop_expired(), vec![1]);
        let left = q.remaining(2).expect("still pending");
        assert!((left - 1.5).abs() < EPS, "left = {left}");
    }

    #[test]
    fn test_cancel_keeps_successor_deadline() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        q.schedule(1, 1.0);
        q.schedule(2, 2.0);
        q.schedule(3, 3.0);
        assert!(q.cancel(2));
        assert!(!q.cancel(2));
        let left = q.remaining(3).expect("still pending");
        assert!((left - 3.0).abs() < EPS, "left = {left}");
        q.advance(3.5);
        assert_eq!(q.pop_expired(), vec![1, 3]);
    }

    #[test]
    fn test_reschedule_replaces_pending() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        q.schedule(1, 1.0);
        q.schedule(1, 5.0);
        assert_eq!(q.len(), 1);
        q.advance(2.0);
        assert!(q.pop_expired().is_empty());
        let left = q.remaining(1).expect("pending");
        assert!((left - 3.0).abs() < EPS, "left = {left}");
    }

    #[test]
    fn test_next_deadline_clamps_to_zero() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        assert!(q.next_deadline().is_none());
        q.schedule(1, 1.0);
        q.advance(2.0);
        assert_eq!(q.next_deadline(), Some(0.0));
    }

    #[test]
    fn test_remaining_accumulates_deltas() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        q.schedule(1, 1.0);
        q.schedule(2, 4.0);
        let left = q.remaining(2).expect("pending");
        assert!((left - 4.0).abs() < EPS, "left = {left}");
    }
}
