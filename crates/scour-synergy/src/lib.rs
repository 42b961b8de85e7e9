#![forbid(unsafe_code)]
//! Page-event observer consumed by the synergistic scrub filter.
//!
//! The foreground side publishes page-cache events (page added, page
//! modified) into per-task queues. The scrubber fetches events, resolves
//! them to device LBA ranges, and marks or unmarks those ranges in a
//! task-private bitmap. `check` answers "has the foreground already read and
//! validated this whole range". The bitmap is advisory: a lost unmark only
//! causes a false skip that a later pass catches.

use parking_lot::Mutex;
use scour_types::InodeNum;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Bits per bitmap node; one node covers `BITS_PER_NODE * granularity` bytes.
const BITS_PER_NODE: u64 = 32768 * 8;

/// Event kinds a task can subscribe to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(pub u8);

impl EventMask {
    pub const ADD: Self = Self(1 << 0);
    pub const MOD: Self = Self(1 << 1);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// What happened to a page in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Page read in from disk; cache now matches disk.
    Added,
    /// Page contents diverged from disk.
    Modified,
    /// Added and then dirtied before the event was fetched.
    AddedModified,
}

impl EventKind {
    #[must_use]
    fn mask(self) -> EventMask {
        match self {
            Self::Added => EventMask::ADD,
            Self::Modified => EventMask::MOD,
            Self::AddedModified => EventMask(EventMask::ADD.0 | EventMask::MOD.0),
        }
    }
}

/// One page-cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEvent {
    pub ino: InodeNum,
    pub page_index: u64,
    pub kind: EventKind,
}

/// Handle to a registered observer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u8);

// ── Range bitmap ────────────────────────────────────────────────────────────

/// Sparse bitmap over device LBAs at a fixed granularity.
///
/// Nodes cover fixed spans and are allocated on first touch; an absent node
/// reads as all-unset.
#[derive(Debug)]
struct RangeBitmap {
    granularity: u64,
    nodes: BTreeMap<u64, Vec<u64>>,
}

impl RangeBitmap {
    fn new(granularity: u64) -> Self {
        debug_assert!(granularity > 0);
        Self {
            granularity,
            nodes: BTreeMap::new(),
        }
    }

    fn node_span(&self) -> u64 {
        BITS_PER_NODE * self.granularity
    }

    /// Iterate `(node_start, first_bit, last_bit_exclusive)` for a byte range.
    fn node_ranges(&self, start: u64, len: u64) -> Vec<(u64, u64, u64)> {
        if len == 0 {
            return Vec::new();
        }
        let span = self.node_span();
        // Round the range out to whole bits.
        let first_bit_abs = start / self.granularity;
        let last_bit_abs = (start + len).div_ceil(self.granularity);

        let mut out = Vec::new();
        let mut bit = first_bit_abs;
        while bit < last_bit_abs {
            let node_start = (bit * self.granularity) / span * span;
            let node_first_bit = node_start / self.granularity;
            let lo = bit - node_first_bit;
            let hi = (last_bit_abs - node_first_bit).min(BITS_PER_NODE);
            out.push((node_start, lo, hi));
            bit = node_first_bit + hi;
        }
        out
    }

    fn set_range(&mut self, start: u64, len: u64, set: bool) {
        for (node_start, lo, hi) in self.node_ranges(start, len) {
            let words = self
                .nodes
                .entry(node_start)
                .or_insert_with(|| vec![0_u64; (BITS_PER_NODE / 64) as usize]);
            for bit in lo..hi {
                let word = (bit / 64) as usize;
                let mask = 1_u64 << (bit % 64);
                if set {
                    words[word] |= mask;
                } else {
                    words[word] &= !mask;
                }
            }
        }
    }

    fn all_set(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        for (node_start, lo, hi) in self.node_ranges(start, len) {
            let Some(words) = self.nodes.get(&node_start) else {
                return false;
            };
            for bit in lo..hi {
                if words[(bit / 64) as usize] & (1_u64 << (bit % 64)) == 0 {
                    return false;
                }
            }
        }
        true
    }
}

// ── Observer registry ───────────────────────────────────────────────────────

#[derive(Debug)]
struct TaskState {
    name: String,
    mask: EventMask,
    bitmap: RangeBitmap,
    queue: VecDeque<PageEvent>,
}

/// Registry of observer tasks. One instance is shared between the foreground
/// publisher and the scrubbers consuming it.
#[derive(Debug, Default)]
pub struct Observer {
    tasks: Mutex<BTreeMap<u8, TaskState>>,
}

/// Result of a `check` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every block in the range is marked.
    AllSet,
    /// At least one block is unmarked.
    AnyUnset,
}

impl Observer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; returns its id or `None` when the id space (u8) is
    /// exhausted.
    pub fn register(&self, name: &str, mask: EventMask, block_size: u64) -> Option<TaskId> {
        let mut tasks = self.tasks.lock();
        let id = (0..=u8::MAX).find(|id| !tasks.contains_key(id))?;
        tasks.insert(
            id,
            TaskState {
                name: name.to_owned(),
                mask,
                bitmap: RangeBitmap::new(block_size),
                queue: VecDeque::new(),
            },
        );
        debug!(event = "observer_register", task = id, name, mask = mask.0);
        Some(TaskId(id))
    }

    pub fn deregister(&self, task: TaskId) {
        if let Some(state) = self.tasks.lock().remove(&task.0) {
            debug!(event = "observer_deregister", task = task.0, name = %state.name);
        }
    }

    /// Publish one event to every task whose mask matches.
    pub fn publish(&self, event: PageEvent) {
        let mut tasks = self.tasks.lock();
        for state in tasks.values_mut() {
            if state.mask.contains(event.kind.mask()) {
                state.queue.push_back(event);
            }
        }
    }

    /// Fetch up to `max_items` pending events for a task.
    #[must_use]
    pub fn fetch(&self, task: TaskId, max_items: usize) -> Vec<PageEvent> {
        let mut tasks = self.tasks.lock();
        let Some(state) = tasks.get_mut(&task.0) else {
            return Vec::new();
        };
        let take = state.queue.len().min(max_items);
        state.queue.drain(..take).collect()
    }

    /// Pending events currently queued for a task.
    #[must_use]
    pub fn pending(&self, task: TaskId) -> usize {
        self.tasks
            .lock()
            .get(&task.0)
            .map_or(0, |state| state.queue.len())
    }

    /// Mark `[lba, lba + len)` as validated by the foreground.
    pub fn mark(&self, task: TaskId, lba: u64, len: u64) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(state) = tasks.get_mut(&task.0) else {
            return false;
        };
        state.bitmap.set_range(lba, len, true);
        true
    }

    /// Clear `[lba, lba + len)` after the cache diverged from disk.
    pub fn unmark(&self, task: TaskId, lba: u64, len: u64) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(state) = tasks.get_mut(&task.0) else {
            return false;
        };
        state.bitmap.set_range(lba, len, false);
        true
    }

    /// Is the whole range marked? `None` for an unknown task.
    #[must_use]
    pub fn check(&self, task: TaskId, lba: u64, len: u64) -> Option<CheckOutcome> {
        let tasks = self.tasks.lock();
        let state = tasks.get(&task.0)?;
        Some(if state.bitmap.all_set(lba, len) {
            CheckOutcome::AllSet
        } else {
            CheckOutcome::AnyUnset
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_marks_and_checks_ranges() {
        let mut bm = RangeBitmap::new(4096);
        bm.set_range(0, 64 * 1024, true);
        assert!(bm.all_set(0, 64 * 1024));
        assert!(bm.all_set(4096, 4096));
        assert!(!bm.all_set(0, 64 * 1024 + 4096));
        bm.set_range(8192, 4096, false);
        assert!(!bm.all_set(0, 64 * 1024));
        assert!(bm.all_set(0, 8192));
        assert!(bm.all_set(12288, 52 * 1024));
    }

    #[test]
    fn bitmap_rounds_partial_blocks_outward() {
        let mut bm = RangeBitmap::new(4096);
        // A sub-block mark covers the whole containing block.
        bm.set_range(100, 10, true);
        assert!(bm.all_set(0, 4096));
        // A range poking one byte into the next block requires that block.
        assert!(!bm.all_set(0, 4097));
    }

    #[test]
    fn bitmap_spans_node_boundaries() {
        let mut bm = RangeBitmap::new(4096);
        let span = BITS_PER_NODE * 4096;
        bm.set_range(span - 8192, 16384, true);
        assert!(bm.all_set(span - 8192, 16384));
        assert!(!bm.all_set(span - 12288, 16384));
        assert_eq!(bm.nodes.len(), 2);
    }

    #[test]
    fn empty_check_is_unset() {
        let bm = RangeBitmap::new(4096);
        assert!(!bm.all_set(0, 0));
        assert!(!bm.all_set(0, 4096));
    }

    #[test]
    fn register_fetch_respects_mask_and_bound() {
        let obs = Observer::new();
        let add_only = obs.register("scrub-a", EventMask::ADD, 4096).unwrap();
        let both = obs
            .register(
                "scrub-b",
                EventMask(EventMask::ADD.0 | EventMask::MOD.0),
                4096,
            )
            .unwrap();

        obs.publish(PageEvent {
            ino: InodeNum(1),
            page_index: 0,
            kind: EventKind::Added,
        });
        obs.publish(PageEvent {
            ino: InodeNum(1),
            page_index: 1,
            kind: EventKind::Modified,
        });

        assert_eq!(obs.pending(add_only), 1);
        assert_eq!(obs.pending(both), 2);

        let events = obs.fetch(both, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(obs.pending(both), 1);
        assert_eq!(obs.fetch(both, 16).len(), 1);
        assert!(obs.fetch(both, 16).is_empty());
    }

    #[test]
    fn mark_unmark_check_round_trip() {
        let obs = Observer::new();
        let task = obs.register("scrub", EventMask::ADD, 4096).unwrap();

        assert_eq!(obs.check(task, 0, 4096), Some(CheckOutcome::AnyUnset));
        assert!(obs.mark(task, 1024 * 1024, 1024 * 1024));
        assert_eq!(
            obs.check(task, 1024 * 1024, 1024 * 1024),
            Some(CheckOutcome::AllSet)
        );
        assert!(obs.unmark(task, 1024 * 1024 + 65536, 4096));
        assert_eq!(
            obs.check(task, 1024 * 1024, 1024 * 1024),
            Some(CheckOutcome::AnyUnset)
        );
        // The untouched prefix still reads set.
        assert_eq!(
            obs.check(task, 1024 * 1024, 65536),
            Some(CheckOutcome::AllSet)
        );
    }

    #[test]
    fn deregister_invalidates_task() {
        let obs = Observer::new();
        let task = obs.register("scrub", EventMask::ADD, 4096).unwrap();
        obs.deregister(task);
        assert!(!obs.mark(task, 0, 4096));
        assert_eq!(obs.check(task, 0, 4096), None);
        assert!(obs.fetch(task, 8).is_empty());
    }

    #[test]
    fn task_bitmaps_are_independent() {
        let obs = Observer::new();
        let a = obs.register("a", EventMask::ADD, 4096).unwrap();
        let b = obs.register("b", EventMask::ADD, 4096).unwrap();
        obs.mark(a, 0, 4096);
        assert_eq!(obs.check(a, 0, 4096), Some(CheckOutcome::AllSet));
        assert_eq!(obs.check(b, 0, 4096), Some(CheckOutcome::AnyUnset));
    }
}
