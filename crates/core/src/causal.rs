//! Causal delivery engine
//!
//! Each participant runs one engine over its inbound chat messages. A
//! message whose stamp is causally ready against the local clock is
//! delivered at once; anything else waits in a buffer keyed by message ID
//! until its predecessors arrive. Draining re-scans the buffer after every
//! delivery, so one arrival can release a whole chain.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::clock::{Causality, Readiness, VectorClock};
use crate::models::ChatMessage;

/// Default cap on the undelivered-message buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Outcome of offering a message to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// Causally ready: the stamp was merged and the message is handed back
    /// for display. Callers should drain afterwards, since the merge may
    /// have released buffered messages.
    Delivered(ChatMessage),
    /// Held until its causal predecessors arrive.
    Buffered,
    /// Already delivered, already buffered, or a stale tick from its
    /// sender. Dropped.
    Duplicate,
    /// The buffer is at capacity; the message was not retained.
    Overflow,
}

/// A message waiting for its causal predecessors.
#[derive(Debug, Clone)]
struct BufferedEntry {
    message: ChatMessage,
    received_at: DateTime<Utc>,
    attempts: u32,
}

/// Buffer contents for observability.
#[derive(Debug, Clone)]
pub struct BufferedInfo {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub attempts: u32,
    pub waiting: Duration,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_offered: u64,
    pub delivered_immediately: u64,
    pub buffered_total: u64,
    pub max_buffer_size: usize,
    pub current_buffer_size: usize,
    pub total_delivered: u64,
}

/// Per-participant causal delivery state: the local vector clock, the
/// buffer of withheld messages, and the set of IDs already delivered.
#[derive(Debug)]
pub struct CausalEngine {
    clock: VectorClock,
    buffer: HashMap<Uuid, BufferedEntry>,
    delivered: HashSet<Uuid>,
    capacity: usize,
    stats: EngineStats,
}

impl Default for CausalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CausalEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clock: VectorClock::new(),
            buffer: HashMap::new(),
            delivered: HashSet::new(),
            capacity,
            stats: EngineStats::default(),
        }
    }

    /// The participant's current clock.
    pub fn local_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Ensure `id` has a clock entry. Idempotent.
    pub fn observe(&mut self, id: Uuid) {
        self.clock.observe(id);
    }

    /// Stamp an outgoing message: increment `id`'s entry and return the
    /// snapshot to attach to the send.
    pub fn tick(&mut self, id: Uuid) -> VectorClock {
        self.clock.tick(id)
    }

    /// Offer an incoming message.
    ///
    /// On `Delivered` the stamp has already been merged; the caller emits
    /// the message downstream and then drains. Self-sent messages must not
    /// be offered — the sender's own tick already covers them.
    pub fn offer(&mut self, message: ChatMessage) -> Offer {
        self.stats.total_offered += 1;

        if self.delivered.contains(&message.id) || self.buffer.contains_key(&message.id) {
            return Offer::Duplicate;
        }

        match self.clock.readiness(message.sender_id, &message.clock) {
            Readiness::Ready => {
                self.commit(&message);
                self.stats.delivered_immediately += 1;
                Offer::Delivered(message)
            }
            Readiness::Duplicate => {
                // A stale tick under a fresh ID: remember the ID so a
                // re-offer reports duplicate instead of re-classifying.
                self.delivered.insert(message.id);
                Offer::Duplicate
            }
            Readiness::Waiting => {
                if self.buffer.len() >= self.capacity {
                    return Offer::Overflow;
                }
                self.buffer.insert(
                    message.id,
                    BufferedEntry {
                        message,
                        received_at: Utc::now(),
                        attempts: 0,
                    },
                );
                self.stats.buffered_total += 1;
                self.stats.current_buffer_size = self.buffer.len();
                self.stats.max_buffer_size = self.stats.max_buffer_size.max(self.buffer.len());
                Offer::Buffered
            }
        }
    }

    /// Release every buffered message that is now deliverable, in
    /// deterministic delivery order.
    ///
    /// Messages are committed one at a time: each merge re-opens the scan,
    /// so a released message can unblock further entries within the same
    /// call. On return no buffered entry is causally ready (the fixpoint);
    /// a repeat call returns empty. Entries still waiting get their attempt
    /// counter bumped.
    pub fn drain(&mut self) -> Vec<ChatMessage> {
        let mut released = Vec::new();

        loop {
            let mut stale = Vec::new();
            let mut next: Option<&BufferedEntry> = None;

            for entry in self.buffer.values() {
                match self
                    .clock
                    .readiness(entry.message.sender_id, &entry.message.clock)
                {
                    Readiness::Ready => match next {
                        Some(best) if delivery_order(entry, best) != Ordering::Less => {}
                        _ => next = Some(entry),
                    },
                    Readiness::Duplicate => stale.push(entry.message.id),
                    Readiness::Waiting => {}
                }
            }

            let next_id = next.map(|e| e.message.id);

            // Entries overtaken by the advancing clock can never become
            // ready; treat them as delivered so re-offers stay duplicates.
            for id in stale {
                self.buffer.remove(&id);
                self.delivered.insert(id);
            }

            let Some(id) = next_id else { break };
            if let Some(entry) = self.buffer.remove(&id) {
                self.commit(&entry.message);
                released.push(entry.message);
            }
        }

        for entry in self.buffer.values_mut() {
            entry.attempts += 1;
        }
        self.stats.current_buffer_size = self.buffer.len();

        released
    }

    /// Current buffer contents, oldest arrival first.
    pub fn buffered(&self) -> Vec<BufferedInfo> {
        let now = Utc::now();
        let mut entries: Vec<BufferedInfo> = self
            .buffer
            .values()
            .map(|e| BufferedInfo {
                message_id: e.message.id,
                sender_id: e.message.sender_id,
                received_at: e.received_at,
                attempts: e.attempts,
                waiting: now - e.received_at,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        entries
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Clear all state: clock, buffer, delivered set, counters.
    pub fn reset(&mut self) {
        self.clock = VectorClock::new();
        self.buffer.clear();
        self.delivered.clear();
        self.stats = EngineStats::default();
    }

    fn commit(&mut self, message: &ChatMessage) {
        self.clock.merge(&message.clock);
        self.delivered.insert(message.id);
        self.stats.total_delivered += 1;
        self.stats.current_buffer_size = self.buffer.len();
    }
}

/// Delivery order among simultaneously-ready entries: happens-before
/// first; incomparable stamps fall back to arrival time, then message ID.
fn delivery_order(a: &BufferedEntry, b: &BufferedEntry) -> Ordering {
    match a.message.clock.causality(&b.message.clock) {
        Causality::Before => Ordering::Less,
        Causality::After => Ordering::Greater,
        Causality::Concurrent | Causality::Equal => a
            .received_at
            .cmp(&b.received_at)
            .then_with(|| a.message.id.cmp(&b.message.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        id: Uuid,
        name: &'static str,
        clock: VectorClock,
    }

    impl Peer {
        fn new(name: &'static str) -> Self {
            let id = Uuid::new_v4();
            Self {
                id,
                name,
                clock: VectorClock::seeded(id),
            }
        }

        fn send(&mut self, text: &str) -> ChatMessage {
            let stamp = self.clock.tick(self.id);
            ChatMessage::new("main", self.id, self.name, text, stamp)
        }

        fn saw(&mut self, message: &ChatMessage) {
            self.clock.merge(&message.clock);
        }
    }

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn test_concurrent_messages_deliver_in_either_order() {
        let mut alice = Peer::new("alice");
        let mut bob = Peer::new("bob");

        let m1 = alice.send("from alice");
        let m2 = bob.send("from bob");

        // Carol sees them in both orders; both deliver immediately.
        for pair in [[m1.clone(), m2.clone()], [m2.clone(), m1.clone()]] {
            let mut engine = CausalEngine::new();
            for msg in pair {
                assert!(matches!(engine.offer(msg), Offer::Delivered(_)));
                assert!(engine.drain().is_empty());
            }
            assert_eq!(engine.local_clock().get(alice.id), 1);
            assert_eq!(engine.local_clock().get(bob.id), 1);
        }
    }

    #[test]
    fn test_causal_chain_reordered_delivery() {
        let mut alice = Peer::new("alice");
        let mut bob = Peer::new("bob");

        let m1 = alice.send("hello");
        bob.saw(&m1);
        let m2 = bob.send("reply to hello");

        // Carol receives the reply before the message it answers.
        let mut engine = CausalEngine::new();
        assert_eq!(engine.offer(m2.clone()), Offer::Buffered);
        assert!(engine.drain().is_empty());

        let first = match engine.offer(m1.clone()) {
            Offer::Delivered(m) => m,
            other => panic!("expected delivery, got {other:?}"),
        };
        assert_eq!(first.text, "hello");

        let drained = engine.drain();
        assert_eq!(texts(&drained), vec!["reply to hello"]);

        assert_eq!(engine.local_clock().get(alice.id), 1);
        assert_eq!(engine.local_clock().get(bob.id), 1);
    }

    #[test]
    fn test_fifo_per_sender_under_reordering() {
        let mut alice = Peer::new("alice");
        let m1 = alice.send("first");
        let m2 = alice.send("second");

        let mut engine = CausalEngine::new();
        assert_eq!(engine.offer(m2), Offer::Buffered);
        assert!(matches!(engine.offer(m1), Offer::Delivered(_)));

        let drained = engine.drain();
        assert_eq!(texts(&drained), vec!["second"]);
        assert_eq!(engine.local_clock().get(alice.id), 2);
    }

    #[test]
    fn test_duplicate_suppression() {
        let mut alice = Peer::new("alice");
        let m1 = alice.send("once");

        let mut engine = CausalEngine::new();
        assert!(matches!(engine.offer(m1.clone()), Offer::Delivered(_)));
        assert_eq!(engine.offer(m1.clone()), Offer::Duplicate);
        // Clock advanced exactly once.
        assert_eq!(engine.local_clock().get(alice.id), 1);

        // Same stale tick under a fresh ID is also a duplicate.
        let mut replay = m1;
        replay.id = Uuid::new_v4();
        assert_eq!(engine.offer(replay.clone()), Offer::Duplicate);
        assert_eq!(engine.offer(replay), Offer::Duplicate);
        assert_eq!(engine.local_clock().get(alice.id), 1);
    }

    #[test]
    fn test_reoffer_of_buffered_message_is_duplicate() {
        let mut alice = Peer::new("alice");
        alice.send("skipped");
        let m2 = alice.send("ahead");

        let mut engine = CausalEngine::new();
        assert_eq!(engine.offer(m2.clone()), Offer::Buffered);
        assert_eq!(engine.offer(m2), Offer::Duplicate);
        assert_eq!(engine.stats().current_buffer_size, 1);
    }

    #[test]
    fn test_drain_reaches_fixpoint_over_long_chain() {
        let mut alice = Peer::new("alice");
        let messages: Vec<ChatMessage> =
            (0..10).map(|i| alice.send(&format!("m{i}"))).collect();

        // Everything but the first arrives, newest first.
        let mut engine = CausalEngine::new();
        for msg in messages[1..].iter().rev() {
            assert_eq!(engine.offer(msg.clone()), Offer::Buffered);
        }
        assert!(engine.drain().is_empty());

        // The missing head releases the entire chain in send order.
        assert!(matches!(engine.offer(messages[0].clone()), Offer::Delivered(_)));
        let drained = engine.drain();
        assert_eq!(
            texts(&drained),
            (1..10).map(|i| format!("m{i}")).collect::<Vec<_>>()
        );

        // Fixpoint: nothing further to release, buffer empty.
        assert!(engine.drain().is_empty());
        assert_eq!(engine.stats().current_buffer_size, 0);
    }

    #[test]
    fn test_concurrent_ready_messages_order_deterministically() {
        let mut alice = Peer::new("alice");
        let mut bob = Peer::new("bob");
        let mut carol = Peer::new("carol");

        // Neither m_a nor m_b has seen the other, but both depend on an
        // earlier message from Carol.
        let c1 = carol.send("root");
        alice.saw(&c1);
        bob.saw(&c1);
        let ma = alice.send("branch a");
        let mb = bob.send("branch b");

        let run = |first: &ChatMessage, second: &ChatMessage| {
            let mut engine = CausalEngine::new();
            assert_eq!(engine.offer(first.clone()), Offer::Buffered);
            assert_eq!(engine.offer(second.clone()), Offer::Buffered);
            assert!(matches!(engine.offer(c1.clone()), Offer::Delivered(_)));
            engine.drain()
        };

        // Arrival order decides the tie-break, so each run is internally
        // deterministic and matches its own arrival sequence.
        let ab = run(&ma, &mb);
        assert_eq!(texts(&ab), vec!["branch a", "branch b"]);
        let ba = run(&mb, &ma);
        assert_eq!(texts(&ba), vec!["branch b", "branch a"]);
    }

    #[test]
    fn test_attempts_bump_on_each_drain() {
        let mut alice = Peer::new("alice");
        alice.send("lost");
        let m2 = alice.send("waiting");

        let mut engine = CausalEngine::new();
        assert_eq!(engine.offer(m2), Offer::Buffered);

        for expected in 1..=3 {
            assert!(engine.drain().is_empty());
            let info = &engine.buffered()[0];
            assert_eq!(info.attempts, expected);
            assert!(info.waiting >= Duration::zero());
        }
    }

    #[test]
    fn test_buffer_overflow_reported() {
        let mut alice = Peer::new("alice");
        alice.send("never arrives");

        let mut engine = CausalEngine::with_capacity(2);
        let m2 = alice.send("two");
        let m3 = alice.send("three");
        let m4 = alice.send("four");

        assert_eq!(engine.offer(m2), Offer::Buffered);
        assert_eq!(engine.offer(m3), Offer::Buffered);
        assert_eq!(engine.offer(m4), Offer::Overflow);
        assert_eq!(engine.stats().current_buffer_size, 2);
    }

    #[test]
    fn test_stats_counters() {
        let mut alice = Peer::new("alice");
        let m1 = alice.send("one");
        let m2 = alice.send("two");

        let mut engine = CausalEngine::new();
        assert_eq!(engine.offer(m2), Offer::Buffered);
        assert!(matches!(engine.offer(m1.clone()), Offer::Delivered(_)));
        engine.drain();
        assert_eq!(engine.offer(m1), Offer::Duplicate);

        let stats = engine.stats();
        assert_eq!(stats.total_offered, 3);
        assert_eq!(stats.delivered_immediately, 1);
        assert_eq!(stats.buffered_total, 1);
        assert_eq!(stats.max_buffer_size, 1);
        assert_eq!(stats.current_buffer_size, 0);
        assert_eq!(stats.total_delivered, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut alice = Peer::new("alice");
        let m1 = alice.send("one");
        let m2 = alice.send("two");

        let mut engine = CausalEngine::new();
        engine.offer(m2.clone());
        engine.offer(m1.clone());
        engine.drain();

        engine.reset();
        assert_eq!(engine.stats(), EngineStats::default());
        assert!(engine.buffered().is_empty());
        assert!(engine.local_clock().is_empty());

        // After reset the old head is fresh again.
        assert!(matches!(engine.offer(m1), Offer::Delivered(_)));
    }
}
