//! Vector clocks for causal ordering
//!
//! Every participant carries a clock mapping participant IDs to logical
//! timestamps. A sender ticks its own entry before broadcasting; recipients
//! merge the stamped clock on delivery. Comparing a message's stamp against
//! the local clock decides whether the message is deliverable yet.

use std::collections::BTreeMap;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// A vector clock mapping participant IDs to logical timestamps.
///
/// Entries for participants never seen read as zero. Entries are only ever
/// added or increased; a peer leaving does not shrink the clock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: BTreeMap<Uuid, u64>,
}

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// `self` happened before `other` (all entries ≤, at least one <).
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither dominates — the events are concurrent.
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// How a message's stamp relates to a recipient's current clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The sender's entry is the immediate next tick and every other entry
    /// has already been observed.
    Ready,
    /// The sender's entry is at or below what we have already seen.
    Duplicate,
    /// Some causal predecessor has not arrived yet.
    Waiting,
}

impl VectorClock {
    /// Empty clock with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock with a single zero entry for `id` — the state of a session at
    /// birth.
    pub fn seeded(id: Uuid) -> Self {
        let mut clock = Self::default();
        clock.observe(id);
        clock
    }

    /// Ensure `id` has an entry, inserting zero if absent. Idempotent.
    pub fn observe(&mut self, id: Uuid) {
        self.entries.entry(id).or_insert(0);
    }

    /// Get the timestamp for `id`. Absent entries read as zero.
    pub fn get(&self, id: Uuid) -> u64 {
        self.entries.get(&id).copied().unwrap_or(0)
    }

    /// Set the timestamp for `id` directly.
    ///
    /// Used when the hub seeds a new session's clock from the room's
    /// current members.
    pub fn set(&mut self, id: Uuid, value: u64) {
        self.entries.insert(id, value);
    }

    /// Increment the entry for `id` and return a snapshot of the whole
    /// clock. The snapshot is a value copy, immune to later mutation.
    pub fn tick(&mut self, id: Uuid) -> VectorClock {
        *self.entries.entry(id).or_insert(0) += 1;
        self.clone()
    }

    /// Merge another clock into this one, taking the max of each entry.
    /// Unknown IDs are implicitly added.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&id, &value) in &other.entries {
            let entry = self.entries.entry(id).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Value copy of all entries.
    pub fn snapshot(&self) -> VectorClock {
        self.clone()
    }

    /// Number of known participants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, u64)> + '_ {
        self.entries.iter().map(|(&id, &v)| (id, v))
    }

    /// Compare this clock with another to determine causal ordering.
    pub fn causality(&self, other: &VectorClock) -> Causality {
        let mut self_leq = true;
        let mut other_leq = true;

        for &id in self.entries.keys().chain(other.entries.keys()) {
            let s = self.get(id);
            let o = other.get(id);
            if s > o {
                self_leq = false;
            }
            if o > s {
                other_leq = false;
            }
        }

        match (self_leq, other_leq) {
            (true, true) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (false, false) => Causality::Concurrent,
        }
    }

    /// Classify a message stamped with `stamp` from `sender` against this
    /// (recipient-side) clock.
    ///
    /// Deliverable iff the sender's entry is exactly one past what we have
    /// seen from them, and every other entry is already covered locally.
    /// A sender entry at or below our own view is a duplicate; anything
    /// else is missing a predecessor.
    pub fn readiness(&self, sender: Uuid, stamp: &VectorClock) -> Readiness {
        let sender_entry = stamp.get(sender);
        if sender_entry <= self.get(sender) {
            return Readiness::Duplicate;
        }
        if sender_entry != self.get(sender) + 1 {
            return Readiness::Waiting;
        }
        let others_covered = stamp
            .entries
            .iter()
            .all(|(&id, &t)| id == sender || t <= self.get(id));
        if others_covered {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }
}

// The wire form is an ID-ordered sequence of [id, count] pairs rather than
// a JSON object. BTreeMap iteration already yields ID order.
impl Serialize for VectorClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for (id, value) in &self.entries {
            seq.serialize_element(&(id, value))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairVisitor;

        impl<'de> Visitor<'de> for PairVisitor {
            type Value = VectorClock;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a sequence of [participant-id, count] pairs")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((id, value)) = seq.next_element::<(Uuid, u64)>()? {
                    entries.insert(id, value);
                }
                Ok(VectorClock { entries })
            }
        }

        deserializer.deserialize_seq(PairVisitor)
    }
}
