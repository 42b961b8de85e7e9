//! Read-batch pool.
//!
//! Batches are slots in a dense array threaded by an intrusive free list.
//! A batch is in exactly one of three places: parked on the free list, the
//! single "current" batch being appended to, or in flight through the
//! pipeline. Each batch shares an index token with its slot entry so that
//! shrink can backfill the freed slot from the tail and relocate a batch
//! that is currently in flight without reaching into it.

use crate::page::{ScrubBlock, ScrubPage};
use scour_block::ByteDevice;
use scour_types::{DevId, Logical, PAGE_SIZE, Physical};
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::{Duration, Instant};

/// Direction of a batch through the device seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// One page entry of a batch. Read batches keep the owning block alive and
/// latched; replace-target write batches carry bare pages.
#[derive(Debug)]
pub struct BatchPage {
    pub page: Arc<ScrubPage>,
    pub block: Option<Arc<ScrubBlock>>,
}

/// A contiguous run of pages submitted as one I/O.
pub struct Batch {
    /// Slot index shared with the pool entry; -1 for write batches, which
    /// live outside the pool.
    pub index: Arc<AtomicIsize>,
    pub dir: IoDir,
    pub dev_id: DevId,
    /// Explicit device handle for write batches (the replace target is not
    /// part of the volume registry).
    pub target: Option<Arc<dyn ByteDevice>>,
    pub physical: Physical,
    pub logical: Logical,
    pub pages: Vec<BatchPage>,
    pub io_failed: bool,
    pub issued_at: Instant,
    /// Pacing credit carried from the previous lap through the pool.
    pub wasted: Duration,
    next_free: isize,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("index", &self.index.load(Ordering::Relaxed))
            .field("dir", &self.dir)
            .field("dev", &self.dev_id)
            .field("physical", &self.physical)
            .field("logical", &self.logical)
            .field("page_count", &self.pages.len())
            .field("io_failed", &self.io_failed)
            .finish_non_exhaustive()
    }
}

impl Batch {
    fn new_slot(index: Arc<AtomicIsize>, capacity: usize) -> Box<Self> {
        Box::new(Self {
            index,
            dir: IoDir::Read,
            dev_id: DevId(0),
            target: None,
            physical: Physical(0),
            logical: Logical(0),
            pages: Vec::with_capacity(capacity),
            io_failed: false,
            issued_at: Instant::now(),
            wasted: Duration::ZERO,
            next_free: -1,
        })
    }

    /// A free-standing write batch for the replace target.
    #[must_use]
    pub fn new_write(target: Arc<dyn ByteDevice>, capacity: usize) -> Box<Self> {
        let mut batch = Self::new_slot(Arc::new(AtomicIsize::new(-1)), capacity);
        batch.dir = IoDir::Write;
        batch.target = Some(target);
        batch
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Physical offset one past the last page.
    #[must_use]
    pub fn phys_tail(&self) -> u64 {
        self.physical.0 + self.pages.len() as u64 * u64::from(PAGE_SIZE)
    }

    /// Logical offset one past the last page.
    #[must_use]
    pub fn log_tail(&self) -> u64 {
        self.logical.0 + self.pages.len() as u64 * u64::from(PAGE_SIZE)
    }

    /// Reset identity for a fresh first page.
    pub fn reset_for(&mut self, dev_id: DevId, physical: Physical, logical: Logical) {
        self.dev_id = dev_id;
        self.physical = physical;
        self.logical = logical;
        self.io_failed = false;
        self.issued_at = Instant::now();
        debug_assert!(self.pages.is_empty());
    }
}

struct SlotEntry {
    token: Arc<AtomicIsize>,
    /// The batch when it is parked on the free list; `None` while it is the
    /// current batch or in flight.
    resident: Option<Box<Batch>>,
}

impl std::fmt::Debug for SlotEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotEntry")
            .field("token", &self.token.load(Ordering::Relaxed))
            .field("resident", &self.resident.is_some())
            .finish()
    }
}

/// The batch pool: dense slot array, free-list head, current-slot holder.
#[derive(Debug)]
pub struct PoolState {
    slots: Vec<SlotEntry>,
    first_free: isize,
    curr: Option<Box<Batch>>,
    pages_per_batch: usize,
}

impl PoolState {
    #[must_use]
    pub fn new(pool_size: u16, pages_per_batch: usize) -> Self {
        let mut state = Self {
            slots: Vec::new(),
            first_free: -1,
            curr: None,
            pages_per_batch,
        };
        state.grow(pool_size);
        state
    }

    #[must_use]
    pub fn pool_size(&self) -> u16 {
        u16::try_from(self.slots.len()).unwrap_or(u16::MAX)
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        self.first_free != -1
    }

    #[must_use]
    pub fn pages_per_batch(&self) -> usize {
        self.pages_per_batch
    }

    /// Grow the pool to `new_size`, daisy-chaining the new slots onto the
    /// front of the free list.
    pub fn grow(&mut self, new_size: u16) {
        let old_size = self.slots.len();
        let new_size = usize::from(new_size);
        if new_size <= old_size {
            return;
        }
        for i in old_size..new_size {
            let token = Arc::new(AtomicIsize::new(
                isize::try_from(i).expect("pool size fits isize"),
            ));
            let mut batch = Batch::new_slot(Arc::clone(&token), self.pages_per_batch);
            batch.next_free = if i == new_size - 1 {
                self.first_free
            } else {
                isize::try_from(i + 1).expect("pool size fits isize")
            };
            self.slots.push(SlotEntry {
                token,
                resident: Some(batch),
            });
        }
        self.first_free = isize::try_from(old_size).expect("pool size fits isize");
    }

    /// Pop the free-list head, if any.
    #[must_use]
    pub fn acquire(&mut self) -> Option<Box<Batch>> {
        if self.first_free == -1 {
            return None;
        }
        let idx = usize::try_from(self.first_free).expect("free index valid");
        let mut batch = self.slots[idx].resident.take().expect("free slot resident");
        self.first_free = batch.next_free;
        batch.next_free = -1;
        batch.pages.clear();
        batch.io_failed = false;
        Some(batch)
    }

    /// Push a batch back onto the free list.
    pub fn release(&mut self, mut batch: Box<Batch>) {
        let idx = usize::try_from(batch.index.load(Ordering::Acquire)).expect("batch has slot");
        batch.next_free = self.first_free;
        self.first_free = isize::try_from(idx).expect("pool size fits isize");
        debug_assert!(self.slots[idx].resident.is_none());
        self.slots[idx].resident = Some(batch);
    }

    /// Free a completed batch's slot and keep the array dense by moving the
    /// tail entry into the hole. The relocated entry's shared token is
    /// updated, so a batch of that slot currently in flight (or held as the
    /// current batch) observes its new index on return.
    pub fn remove(&mut self, batch: Box<Batch>) {
        let idx = usize::try_from(batch.index.load(Ordering::Acquire)).expect("batch has slot");
        drop(batch);
        let last = self.slots.len() - 1;
        let last_isize = isize::try_from(last).expect("pool size fits isize");
        let idx_isize = isize::try_from(idx).expect("pool size fits isize");

        if idx != last {
            // If the tail entry is parked on the free list, repoint the link
            // that references it.
            if self.slots[last].resident.is_some() {
                if self.first_free == last_isize {
                    self.first_free = idx_isize;
                } else {
                    let mut cur = self.first_free;
                    while cur != -1 {
                        let cur_idx = usize::try_from(cur).expect("free index valid");
                        let next = self.slots[cur_idx]
                            .resident
                            .as_ref()
                            .expect("free chain resident")
                            .next_free;
                        if next == last_isize {
                            self.slots[cur_idx]
                                .resident
                                .as_mut()
                                .expect("free chain resident")
                                .next_free = idx_isize;
                            break;
                        }
                        cur = next;
                    }
                }
            }
            let tail = self.slots.pop().expect("tail exists");
            tail.token.store(idx_isize, Ordering::Release);
            self.slots[idx] = tail;
        } else {
            self.slots.pop();
        }
    }

    /// Take the current batch for submission.
    #[must_use]
    pub fn take_curr(&mut self) -> Option<Box<Batch>> {
        self.curr.take()
    }

    pub fn set_curr(&mut self, batch: Box<Batch>) {
        debug_assert!(self.curr.is_none());
        self.curr = Some(batch);
    }

    #[must_use]
    pub fn curr_mut(&mut self) -> Option<&mut Batch> {
        self.curr.as_deref_mut()
    }

    #[must_use]
    pub fn has_curr(&self) -> bool {
        self.curr.is_some()
    }

    /// Free batches currently parked (test introspection).
    #[must_use]
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.first_free;
        while cur != -1 {
            count += 1;
            cur = self.slots[usize::try_from(cur).expect("free index valid")]
                .resident
                .as_ref()
                .expect("free chain resident")
                .next_free;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_fully_free_and_chained() {
        let pool = PoolState::new(4, 8);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.free_count(), 4);
        assert!(pool.has_free());
    }

    #[test]
    fn acquire_release_cycles_the_list() {
        let mut pool = PoolState::new(2, 8);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert!(!pool.has_free());

        pool.release(a);
        assert_eq!(pool.free_count(), 1);
        let a2 = pool.acquire().unwrap();
        pool.release(a2);
        pool.release(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn grow_prepends_new_slots() {
        let mut pool = PoolState::new(2, 8);
        let _held = pool.acquire().unwrap();
        pool.grow(5);
        assert_eq!(pool.pool_size(), 5);
        // 1 original free + 3 new.
        assert_eq!(pool.free_count(), 4);
        // New slots sit at the front of the free list.
        let first = pool.acquire().unwrap();
        assert_eq!(first.index.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn remove_tail_slot_shrinks_pool() {
        let mut pool = PoolState::new(3, 8);
        // Acquire the head of the free list until we hold slot 2 (the tail).
        let mut held = Vec::new();
        loop {
            let b = pool.acquire().unwrap();
            if b.index.load(Ordering::Relaxed) == 2 {
                pool.remove(b);
                break;
            }
            held.push(b);
        }
        assert_eq!(pool.pool_size(), 2);
        for b in held {
            pool.release(b);
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn remove_middle_slot_backfills_from_tail() {
        let mut pool = PoolState::new(4, 8);
        // Hold slot 0 (free-list head), remove it; tail (slot 3) backfills.
        let head = pool.acquire().unwrap();
        assert_eq!(head.index.load(Ordering::Relaxed), 0);
        pool.remove(head);

        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.free_count(), 3);
        // Every free batch token agrees with its slot position.
        let mut seen = Vec::new();
        while let Some(b) = pool.acquire() {
            seen.push(b.index.load(Ordering::Relaxed));
            // Do not release; draining validates the whole chain.
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn remove_updates_token_of_relocated_inflight_batch() {
        let mut pool = PoolState::new(3, 8);
        // Slot 2 is "in flight": acquire until we hold it.
        let mut inflight = None;
        let mut others = Vec::new();
        while let Some(b) = pool.acquire() {
            if b.index.load(Ordering::Relaxed) == 2 {
                inflight = Some(b);
            } else {
                others.push(b);
            }
        }
        let inflight = inflight.unwrap();
        // Release the others, then remove slot 0.
        let mut victim = None;
        for b in others {
            if b.index.load(Ordering::Relaxed) == 0 {
                victim = Some(b);
            } else {
                pool.release(b);
            }
        }
        pool.remove(victim.unwrap());

        // The in-flight batch was relocated from slot 2 to slot 0.
        assert_eq!(inflight.index.load(Ordering::Relaxed), 0);
        assert_eq!(pool.pool_size(), 2);
        pool.release(inflight);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn tail_contiguity_math() {
        let mut pool = PoolState::new(1, 8);
        let mut batch = pool.acquire().unwrap();
        batch.reset_for(DevId(1), Physical(8192), Logical(1 << 20));
        assert_eq!(batch.phys_tail(), 8192);
        assert_eq!(batch.log_tail(), 1 << 20);
    }

    #[test]
    fn curr_slot_holds_one_batch() {
        let mut pool = PoolState::new(2, 8);
        assert!(pool.take_curr().is_none());
        let b = pool.acquire().unwrap();
        pool.set_curr(b);
        assert!(pool.has_curr());
        let taken = pool.take_curr().unwrap();
        assert!(!pool.has_curr());
        pool.release(taken);
    }
}
