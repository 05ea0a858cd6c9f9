//! # Fragment Reassembly
//!
//! Oversize payloads are split into fragments small enough for the HLP
//! transport's request/response exchanges, then reassembled on the far
//! side. Fragments of one payload share a fresh `group_id`; a group is
//! complete once every index in `[0, total_fragments)` has arrived, in any
//! order and regardless of duplicates.
//!
//! Reassembly is exactly-once: a per-group flag is CAS-flipped so that one
//! caller wins the assembled bytes and every other concurrent caller
//! observes [`ReassemblyOutcome::AlreadyReassembled`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

/// Process-wide total order over emitted fragments.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Default time a group may sit idle before the sweep drops it.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(60);

/// Default per-table byte budget.
pub const DEFAULT_BYTE_BUDGET: usize = 64 * 1024 * 1024;

/// One piece of a fragmented payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub group_id: String,
    pub original_size: u64,
    pub fragment_size: u32,
    pub fragment_index: u32,
    pub total_fragments: u32,
    pub sequence_number: u64,
    pub data: Vec<u8>,
}

/// Splits `payload` into fragments of at most `fragment_size` bytes.
///
/// Payloads that fit in a single fragment are emitted as a trivial group
/// of one. Each fragment is stamped with a process-monotonic
/// `sequence_number` so receivers can present pieces in emit order.
pub fn split(payload: &[u8], fragment_size: usize) -> Vec<Fragment> {
    let fragment_size = fragment_size.max(1);
    let group_id = Uuid::new_v4().to_string();
    // An empty payload still forms a trivial group of one empty fragment.
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&payload[..]]
    } else {
        payload.chunks(fragment_size).collect()
    };
    let total = chunks.len() as u32;

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Fragment {
            group_id: group_id.clone(),
            original_size: payload.len() as u64,
            fragment_size: fragment_size as u32,
            fragment_index: index as u32,
            total_fragments: total,
            sequence_number: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            data: chunk.to_vec(),
        })
        .collect()
}

// ─── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FragmentError {
    /// Parameters disagree with an existing group of the same id.
    #[error("fragment parameters conflict with existing group {0}")]
    FragmentConflict(String),

    #[error("fragment index {index} out of range for a group of {total}")]
    IndexOutOfRange { index: u32, total: u32 },

    /// A fragment was re-sent for an index with *different* bytes.
    /// Byte-identical re-sends are accepted silently.
    #[error("duplicate fragment {index} of group {group_id} carries different bytes")]
    DuplicateFragment { group_id: String, index: u32 },

    /// The table's byte budget is exhausted.
    #[error("fragment table exhausted: {used} bytes held, {incoming} more would exceed {budget}")]
    ResourceExhausted {
        used: usize,
        incoming: usize,
        budget: usize,
    },
}

// ─── Fragment Group ─────────────────────────────────────────────

/// Outcome of a reassembly attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// This caller won; the concatenated payload is returned exactly once.
    Reassembled(Vec<u8>),
    /// Fragments are still missing.
    Incomplete,
    /// Another caller already won.
    AlreadyReassembled,
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
}

/// The receive-side state of one fragmented payload.
#[derive(Debug)]
pub struct FragmentGroup {
    group_id: String,
    original_size: u64,
    fragment_size: u32,
    total_fragments: u32,
    slots: Mutex<HashMap<u32, Slot>>,
    reassembled: AtomicBool,
    last_activity: Mutex<Instant>,
    /// Shared with the owning [`Reassembler`] for byte accounting.
    table_bytes: Arc<AtomicUsize>,
}

impl FragmentGroup {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn total_fragments(&self) -> u32 {
        self.total_fragments
    }

    fn matches(&self, original_size: u64, fragment_size: u32, total_fragments: u32) -> bool {
        self.original_size == original_size
            && self.fragment_size == fragment_size
            && self.total_fragments == total_fragments
    }

    fn accept(&self, fragment: Fragment) -> Result<(), FragmentError> {
        let mut slots = self.slots.lock().expect("fragment slots poisoned");
        *self.last_activity.lock().expect("last_activity poisoned") = Instant::now();

        if let Some(existing) = slots.get(&fragment.fragment_index) {
            if existing.data == fragment.data {
                return Ok(());
            }
            return Err(FragmentError::DuplicateFragment {
                group_id: self.group_id.clone(),
                index: fragment.fragment_index,
            });
        }

        self.table_bytes
            .fetch_add(fragment.data.len(), Ordering::Relaxed);
        slots.insert(
            fragment.fragment_index,
            Slot {
                data: fragment.data,
            },
        );
        Ok(())
    }

    /// Attempts to assemble the payload; linearizable across callers.
    pub fn is_complete_and_reassemble(&self) -> ReassemblyOutcome {
        let mut slots = self.slots.lock().expect("fragment slots poisoned");

        if self.reassembled.load(Ordering::Acquire) {
            return ReassemblyOutcome::AlreadyReassembled;
        }
        if slots.len() < self.total_fragments as usize {
            return ReassemblyOutcome::Incomplete;
        }
        if self
            .reassembled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ReassemblyOutcome::AlreadyReassembled;
        }

        // Winner: drain the slots in index order and release their bytes.
        let mut out = Vec::with_capacity(self.original_size as usize);
        let mut released = 0usize;
        for index in 0..self.total_fragments {
            if let Some(slot) = slots.remove(&index) {
                released += slot.data.len();
                out.extend_from_slice(&slot.data);
            }
        }
        self.table_bytes.fetch_sub(released, Ordering::Relaxed);
        out.truncate(self.original_size as usize);
        ReassemblyOutcome::Reassembled(out)
    }

    fn held_bytes(&self) -> usize {
        self.slots
            .lock()
            .expect("fragment slots poisoned")
            .values()
            .map(|s| s.data.len())
            .sum()
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity poisoned")
            .elapsed()
    }
}

// ─── Reassembler ────────────────────────────────────────────────

/// A table of in-flight fragment groups with a byte budget.
///
/// Each HLP stream processor owns exactly one table; groups are created on
/// first fragment and destroyed on successful reassembly, explicit
/// removal, or TTL expiry.
#[derive(Debug)]
pub struct Reassembler {
    groups: Mutex<HashMap<String, Arc<FragmentGroup>>>,
    total_bytes: Arc<AtomicUsize>,
    byte_budget: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_BUDGET)
    }
}

impl Reassembler {
    pub fn new(byte_budget: usize) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            total_bytes: Arc::new(AtomicUsize::new(0)),
            byte_budget,
        }
    }

    /// Bytes currently held across all incomplete groups.
    pub fn held_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Adds one fragment, creating its group on first sight.
    pub fn add_fragment(&self, fragment: Fragment) -> Result<Arc<FragmentGroup>, FragmentError> {
        if fragment.fragment_index >= fragment.total_fragments {
            return Err(FragmentError::IndexOutOfRange {
                index: fragment.fragment_index,
                total: fragment.total_fragments,
            });
        }

        let used = self.total_bytes.load(Ordering::Relaxed);
        if used + fragment.data.len() > self.byte_budget {
            return Err(FragmentError::ResourceExhausted {
                used,
                incoming: fragment.data.len(),
                budget: self.byte_budget,
            });
        }

        let group = {
            let mut groups = self.groups.lock().expect("group table poisoned");
            match groups.get(&fragment.group_id) {
                Some(group) => {
                    if !group.matches(
                        fragment.original_size,
                        fragment.fragment_size,
                        fragment.total_fragments,
                    ) {
                        return Err(FragmentError::FragmentConflict(fragment.group_id.clone()));
                    }
                    Arc::clone(group)
                }
                None => {
                    let group = Arc::new(FragmentGroup {
                        group_id: fragment.group_id.clone(),
                        original_size: fragment.original_size,
                        fragment_size: fragment.fragment_size,
                        total_fragments: fragment.total_fragments,
                        slots: Mutex::new(HashMap::new()),
                        reassembled: AtomicBool::new(false),
                        last_activity: Mutex::new(Instant::now()),
                        table_bytes: Arc::clone(&self.total_bytes),
                    });
                    groups.insert(fragment.group_id.clone(), Arc::clone(&group));
                    group
                }
            }
        };

        group.accept(fragment)?;
        Ok(group)
    }

    /// Drops a group and releases its bytes. Idempotent.
    pub fn remove_group(&self, group_id: &str) {
        let removed = self
            .groups
            .lock()
            .expect("group table poisoned")
            .remove(group_id);
        if let Some(group) = removed {
            self.total_bytes
                .fetch_sub(group.held_bytes(), Ordering::Relaxed);
        }
    }

    /// Removes every group idle for longer than `ttl`, returning their ids
    /// so the caller can log them.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<String> {
        let expired: Vec<String> = {
            let groups = self.groups.lock().expect("group table poisoned");
            groups
                .iter()
                .filter(|(_, g)| g.idle_for() > ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            self.remove_group(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments_of(payload: &[u8], size: usize) -> Vec<Fragment> {
        split(payload, size)
    }

    #[test]
    fn split_emits_a_trivial_group_for_small_payloads() {
        let frags = fragments_of(b"hello", 1024);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].fragment_index, 0);
        assert_eq!(frags[0].total_fragments, 1);
        assert_eq!(frags[0].original_size, 5);
    }

    #[test]
    fn sequence_numbers_are_monotonic_within_a_group() {
        let frags = fragments_of(&[7u8; 100], 30);
        assert_eq!(frags.len(), 4);
        for pair in frags.windows(2) {
            assert!(pair[0].sequence_number < pair[1].sequence_number);
        }
    }

    #[test]
    fn out_of_order_arrival_reassembles_exactly_once() {
        let reassembler = Reassembler::default();
        let payload = b"HELLO_THE_WORLD";
        let mut frags = fragments_of(payload, 5);
        assert_eq!(frags.len(), 3);
        // Deliver in reverse: 2, 1, 0.
        frags.swap(0, 2);

        let mut assembled = None;
        for frag in frags {
            let group = reassembler.add_fragment(frag).unwrap();
            match group.is_complete_and_reassemble() {
                ReassemblyOutcome::Reassembled(bytes) => {
                    assert!(assembled.replace(bytes).is_none());
                }
                ReassemblyOutcome::Incomplete => {}
                ReassemblyOutcome::AlreadyReassembled => panic!("won twice"),
            }
        }
        assert_eq!(assembled.as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn losers_observe_already_reassembled() {
        let reassembler = Reassembler::default();
        let frags = fragments_of(b"abcdef", 3);
        let mut group = None;
        for frag in frags {
            group = Some(reassembler.add_fragment(frag).unwrap());
        }
        let group = group.unwrap();
        assert!(matches!(
            group.is_complete_and_reassemble(),
            ReassemblyOutcome::Reassembled(_)
        ));
        assert_eq!(
            group.is_complete_and_reassemble(),
            ReassemblyOutcome::AlreadyReassembled
        );
    }

    #[test]
    fn concurrent_reassembly_has_one_winner() {
        let reassembler = Arc::new(Reassembler::default());
        let frags = fragments_of(&[9u8; 4096], 256);
        let mut group = None;
        for frag in frags {
            group = Some(reassembler.add_fragment(frag).unwrap());
        }
        let group = group.unwrap();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let group = Arc::clone(&group);
                    scope.spawn(move || {
                        matches!(
                            group.is_complete_and_reassemble(),
                            ReassemblyOutcome::Reassembled(_)
                        ) as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn byte_identical_duplicates_are_idempotent() {
        let reassembler = Reassembler::default();
        let frags = fragments_of(b"0123456789", 4);
        let first = frags[0].clone();
        reassembler.add_fragment(first.clone()).unwrap();
        reassembler.add_fragment(first.clone()).unwrap();

        let mut different = first;
        different.data = b"XXXX".to_vec();
        assert!(matches!(
            reassembler.add_fragment(different),
            Err(FragmentError::DuplicateFragment { .. })
        ));
    }

    #[test]
    fn parameter_disagreement_is_a_conflict() {
        let reassembler = Reassembler::default();
        let frags = fragments_of(b"0123456789", 4);
        reassembler.add_fragment(frags[0].clone()).unwrap();

        let mut conflicting = frags[1].clone();
        conflicting.total_fragments = 9;
        assert!(matches!(
            reassembler.add_fragment(conflicting),
            Err(FragmentError::FragmentConflict(_))
        ));
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        let reassembler = Reassembler::default();
        let mut frag = fragments_of(b"abc", 8).remove(0);
        frag.fragment_index = 5;
        assert!(matches!(
            reassembler.add_fragment(frag),
            Err(FragmentError::IndexOutOfRange { index: 5, total: 1 })
        ));
    }

    #[test]
    fn byte_budget_is_enforced() {
        let reassembler = Reassembler::new(8);
        let frags = fragments_of(&[1u8; 16], 6);
        reassembler.add_fragment(frags[0].clone()).unwrap();
        assert!(matches!(
            reassembler.add_fragment(frags[1].clone()),
            Err(FragmentError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn remove_group_is_idempotent_and_releases_bytes() {
        let reassembler = Reassembler::default();
        let frags = fragments_of(&[1u8; 64], 16);
        let id = frags[0].group_id.clone();
        for frag in frags.into_iter().take(2) {
            reassembler.add_fragment(frag).unwrap();
        }
        assert_eq!(reassembler.held_bytes(), 32);
        reassembler.remove_group(&id);
        reassembler.remove_group(&id);
        assert_eq!(reassembler.held_bytes(), 0);
    }

    #[test]
    fn sweep_drops_idle_groups() {
        let reassembler = Reassembler::default();
        let frags = fragments_of(&[1u8; 64], 16);
        let id = frags[0].group_id.clone();
        reassembler.add_fragment(frags[0].clone()).unwrap();

        assert!(reassembler.sweep_expired(Duration::from_secs(60)).is_empty());
        let swept = reassembler.sweep_expired(Duration::ZERO);
        assert_eq!(swept, vec![id]);
        assert_eq!(reassembler.held_bytes(), 0);
    }
}
