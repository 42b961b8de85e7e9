//! Block and page entities.
//!
//! A [`ScrubBlock`] groups the pages of one logical block on one mirror.
//! Pages and blocks are shared between the walker, the batch pool, and the
//! completion workers via `Arc`; the block additionally carries an explicit
//! outstanding-page latch so that verification runs exactly once, on the
//! thread that drives the last page completion to zero.

use parking_lot::Mutex;
use scour_block::AlignedBuf;
use scour_types::{
    CSUM_SIZE, DevId, ExtentFlags, Generation, Logical, MAX_PAGES_PER_BLOCK, MirrorNum, PAGE_SIZE,
    Physical,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One page of a scrub block. The buffer is filled by I/O dispatchers while
/// the walker may still hold a reference, hence the lock.
#[derive(Debug)]
pub struct ScrubPage {
    pub dev: DevId,
    pub flags: ExtentFlags,
    pub generation: Generation,
    pub logical: Logical,
    pub physical: Physical,
    pub physical_for_replace: Physical,
    pub mirror_num: MirrorNum,
    pub csum: Option<[u8; CSUM_SIZE]>,
    io_error: AtomicBool,
    data: Mutex<AlignedBuf>,
}

impl ScrubPage {
    #[must_use]
    pub fn new(
        dev: DevId,
        flags: ExtentFlags,
        generation: Generation,
        logical: Logical,
        physical: Physical,
        physical_for_replace: Physical,
        mirror_num: MirrorNum,
        csum: Option<[u8; CSUM_SIZE]>,
    ) -> Self {
        Self {
            dev,
            flags,
            generation,
            logical,
            physical,
            physical_for_replace,
            mirror_num,
            csum,
            io_error: AtomicBool::new(false),
            data: Mutex::new(AlignedBuf::page()),
        }
    }

    #[must_use]
    pub fn io_error(&self) -> bool {
        self.io_error.load(Ordering::Acquire)
    }

    pub fn set_io_error(&self, err: bool) {
        self.io_error.store(err, Ordering::Release);
    }

    /// Copy bytes into the page buffer.
    pub fn fill(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), PAGE_SIZE as usize);
        self.data.lock().as_mut_slice().copy_from_slice(bytes);
    }

    /// Snapshot of the page contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().as_slice().to_vec()
    }

    /// Run `f` over the page contents without copying.
    pub fn with_contents<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.data.lock().as_slice())
    }

    /// Zero the page buffer (replace mode writes zeros for unsourced pages).
    pub fn zero(&self) {
        self.data.lock().zero();
    }
}

/// Sticky per-block error flags. `no_io_error_seen` starts true and is only
/// ever cleared; the others are only ever set.
#[derive(Debug)]
pub struct BlockFlags {
    header_error: AtomicBool,
    checksum_error: AtomicBool,
    generation_error: AtomicBool,
    no_io_error_seen: AtomicBool,
}

impl Default for BlockFlags {
    fn default() -> Self {
        Self {
            header_error: AtomicBool::new(false),
            checksum_error: AtomicBool::new(false),
            generation_error: AtomicBool::new(false),
            no_io_error_seen: AtomicBool::new(true),
        }
    }
}

/// One mirror of a logical block: 1..=MAX_PAGES_PER_BLOCK pages plus the
/// completion latch and sticky verification flags.
#[derive(Debug)]
pub struct ScrubBlock {
    pages: Vec<Arc<ScrubPage>>,
    outstanding_pages: AtomicUsize,
    flags: BlockFlags,
}

impl ScrubBlock {
    #[must_use]
    pub fn new(pages: Vec<Arc<ScrubPage>>) -> Self {
        debug_assert!(!pages.is_empty());
        debug_assert!(pages.len() <= MAX_PAGES_PER_BLOCK);
        Self {
            pages,
            outstanding_pages: AtomicUsize::new(0),
            flags: BlockFlags::default(),
        }
    }

    #[must_use]
    pub fn pages(&self) -> &[Arc<ScrubPage>] {
        &self.pages
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.pages.len() as u64 * u64::from(PAGE_SIZE)
    }

    /// First page; carries the block's identity (flags, csum, addresses).
    #[must_use]
    pub fn head(&self) -> &Arc<ScrubPage> {
        &self.pages[0]
    }

    /// Arm the completion latch for every page before any batch carrying
    /// them can complete; a partially armed latch could fire early when the
    /// block's pages straddle two batches.
    pub fn arm_outstanding(&self) {
        self.outstanding_pages
            .store(self.pages.len(), Ordering::Release);
    }

    /// Decrement the latch; true when this was the last outstanding page.
    #[must_use]
    pub fn dec_outstanding(&self) -> bool {
        let prev = self.outstanding_pages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
        prev == 1
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding_pages.load(Ordering::Acquire)
    }

    pub fn set_header_error(&self) {
        self.flags.header_error.store(true, Ordering::Release);
    }

    pub fn set_checksum_error(&self) {
        self.flags.checksum_error.store(true, Ordering::Release);
    }

    pub fn set_generation_error(&self) {
        self.flags.generation_error.store(true, Ordering::Release);
        self.flags.header_error.store(true, Ordering::Release);
    }

    pub fn clear_no_io_error_seen(&self) {
        self.flags.no_io_error_seen.store(false, Ordering::Release);
    }

    /// Reset verification state before a recheck pass re-reads the pages.
    pub fn reset_for_recheck(&self) {
        self.flags.header_error.store(false, Ordering::Release);
        self.flags.checksum_error.store(false, Ordering::Release);
        self.flags.generation_error.store(false, Ordering::Release);
        self.flags.no_io_error_seen.store(true, Ordering::Release);
        for page in &self.pages {
            page.set_io_error(false);
        }
    }

    #[must_use]
    pub fn header_error(&self) -> bool {
        self.flags.header_error.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn checksum_error(&self) -> bool {
        self.flags.checksum_error.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn generation_error(&self) -> bool {
        self.flags.generation_error.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn no_io_error_seen(&self) -> bool {
        self.flags.no_io_error_seen.load(Ordering::Acquire)
    }

    /// Verification verdict: clean means no sticky flag fired and no page
    /// reported an I/O error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.no_io_error_seen()
            && !self.header_error()
            && !self.checksum_error()
            && !self.generation_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(logical: u64) -> Arc<ScrubPage> {
        Arc::new(ScrubPage::new(
            DevId(1),
            ExtentFlags::DATA,
            Generation(1),
            Logical(logical),
            Physical(logical),
            Physical(logical),
            MirrorNum(1),
            None,
        ))
    }

    #[test]
    fn outstanding_latch_fires_once() {
        let block = ScrubBlock::new(vec![page(0), page(4096)]);
        block.arm_outstanding();
        assert_eq!(block.outstanding(), 2);
        assert!(!block.dec_outstanding());
        assert!(block.dec_outstanding());
    }

    #[test]
    fn flags_are_sticky_and_reset_for_recheck() {
        let block = ScrubBlock::new(vec![page(0)]);
        assert!(block.is_clean());
        block.set_generation_error();
        assert!(block.header_error());
        assert!(block.generation_error());
        block.clear_no_io_error_seen();
        block.head().set_io_error(true);
        assert!(!block.is_clean());

        block.reset_for_recheck();
        assert!(block.is_clean());
        assert!(!block.head().io_error());
    }

    #[test]
    fn page_buffer_fill_and_zero() {
        let p = page(0);
        p.fill(&[0x77_u8; PAGE_SIZE as usize]);
        assert!(p.with_contents(|c| c.iter().all(|&b| b == 0x77)));
        p.zero();
        assert!(p.with_contents(|c| c.iter().all(|&b| b == 0)));
    }
}
