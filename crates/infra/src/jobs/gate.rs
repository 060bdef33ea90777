//! Per-topic concurrency gate.
//!
//! Counts running jobs per topic and refuses a job once its topic reached
//! the limit of its [`Parallelism`]. A refusal never blocks: the caller
//! reschedules the job.

use std::collections::HashMap;
use std::sync::Mutex;

use eventing_core::Topic;

use super::lock;
use super::types::Parallelism;

#[derive(Debug, Default)]
pub struct TopicGate {
    running: Mutex<HashMap<Topic, u32>>,
}

impl TopicGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a slot for `topic`. Unbounded topics always succeed and
    /// are not tracked.
    pub fn try_acquire(&self, topic: &Topic, parallelism: Parallelism) -> bool {
        let Some(limit) = parallelism.limit() else {
            return true;
        };
        let mut running = lock(&self.running);
        let count = running.entry(topic.clone()).or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a slot taken by [`try_acquire`](Self::try_acquire).
    pub fn release(&self, topic: &Topic, parallelism: Parallelism) {
        if parallelism.limit().is_none() {
            return;
        }
        let mut running = lock(&self.running);
        if let Some(count) = running.get_mut(topic) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(topic);
            }
        }
    }

    /// Slots currently held for `topic`.
    pub fn running(&self, topic: &Topic) -> u32 {
        lock(&self.running).get(topic).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    #[test]
    fn exclusive_topic_admits_one() {
        let gate = TopicGate::new();
        let t = topic("t");
        assert!(gate.try_acquire(&t, Parallelism::Exclusive));
        assert!(!gate.try_acquire(&t, Parallelism::Exclusive));
        gate.release(&t, Parallelism::Exclusive);
        assert!(gate.try_acquire(&t, Parallelism::Exclusive));
    }

    #[test]
    fn topics_are_independent() {
        let gate = TopicGate::new();
        assert!(gate.try_acquire(&topic("a"), Parallelism::Exclusive));
        assert!(gate.try_acquire(&topic("b"), Parallelism::Exclusive));
    }

    #[test]
    fn unbounded_is_never_tracked() {
        let gate = TopicGate::new();
        let t = topic("t");
        for _ in 0..100 {
            assert!(gate.try_acquire(&t, Parallelism::Unbounded));
        }
        assert_eq!(gate.running(&t), 0);
    }

    #[test]
    fn concurrent_acquirers_never_exceed_bound() {
        let gate = Arc::new(TopicGate::new());
        let t = topic("t");
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let t = t.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        if gate.try_acquire(&t, Parallelism::Bounded(3)) {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                            gate.release(&t, Parallelism::Bounded(3));
                        }
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.running(&t), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        /// Any interleaving of acquires and releases keeps the count within
        /// the bound and equal to successful acquires minus releases.
        #[test]
        fn count_tracks_acquires_minus_releases(limit in 1u32..6, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let gate = TopicGate::new();
            let t = topic("p");
            let policy = if limit == 1 { Parallelism::Exclusive } else { Parallelism::Bounded(limit) };
            let mut held = 0u32;
            for acquire in ops {
                if acquire {
                    let ok = gate.try_acquire(&t, policy);
                    prop_assert_eq!(ok, held < limit);
                    if ok {
                        held += 1;
                    }
                } else if held > 0 {
                    gate.release(&t, policy);
                    held -= 1;
                }
                prop_assert_eq!(gate.running(&t), held);
                prop_assert!(held <= limit);
            }
        }
    }
}
