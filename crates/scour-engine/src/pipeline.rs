//! Submission and completion pipeline.
//!
//! Batches flow: walker → submit queue → I/O dispatchers → completion queue
//! → completion workers. Completion decrements each block's outstanding-page
//! latch and runs block-complete on the last decrement. Under a deadline the
//! controller is consulted on every completion; a batch that finished ahead
//! of its pacing interval is parked on a single-shot timer before returning
//! to the free list.

use crate::ScrubCtx;
use crate::batch::{Batch, BatchPage, IoDir};
use crate::page::{ScrubBlock, ScrubPage};
use crate::rate::{BoostAction, adjust_rate, pacing_owed};
use crate::{recover, verify};
use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use scour_block::cx_checkpoint;
use scour_error::{Result, ScrubError};
use scour_types::{
    CSUM_SIZE, DevId, ExtentFlags, Generation, Logical, PAGE_SIZE, Physical,
};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Bounded wait before re-checking pool growth while starved for batches.
const FREE_BATCH_WAIT: Duration = Duration::from_millis(5);

// ── Work queue ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO handoff between pipeline stages.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        self.cv.notify_one();
    }

    /// Blocking pop; `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.cv.wait(&mut inner);
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cv.notify_all();
    }
}

// ── Pacing timer ────────────────────────────────────────────────────────────

struct TimerEntry {
    due: Instant,
    seq: u64,
    batch: Box<Batch>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerInner {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
    closed: bool,
}

/// Single-shot pacing timers for parked batches.
#[derive(Default)]
pub struct PacingTimer {
    inner: Mutex<TimerInner>,
    cv: Condvar,
}

impl std::fmt::Debug for PacingTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacingTimer")
            .field("parked", &self.inner.lock().heap.len())
            .finish()
    }
}

impl PacingTimer {
    pub fn park(&self, due: Instant, batch: Box<Batch>) {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(TimerEntry { due, seq, batch });
        self.cv.notify_one();
    }

    /// Drain every parked batch, crediting the interval it no longer serves.
    pub fn flush(&self) -> Vec<Box<Batch>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while let Some(mut entry) = inner.heap.pop() {
            entry.batch.wasted = entry.due.saturating_duration_since(now);
            out.push(entry.batch);
        }
        out
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cv.notify_all();
    }

    #[must_use]
    pub fn parked(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Wait for the next due entry. `None` when closed and empty.
    fn pop_due(&self) -> Option<Box<Batch>> {
        let mut inner = self.inner.lock();
        loop {
            let now = Instant::now();
            if let Some(next) = inner.heap.peek() {
                if next.due <= now {
                    let mut entry = inner.heap.pop().expect("peeked entry");
                    // Queue latency past the deadline counts as wasted time
                    // credited to the batch's next lap.
                    entry.batch.wasted = now.saturating_duration_since(entry.due);
                    return Some(entry.batch);
                }
                let due = next.due;
                if inner.closed {
                    // Closing delivers wake-ups immediately.
                    let mut entry = inner.heap.pop().expect("peeked entry");
                    entry.batch.wasted = due.saturating_duration_since(now);
                    return Some(entry.batch);
                }
                let _ = self.cv.wait_until(&mut inner, due);
            } else {
                if inner.closed {
                    return None;
                }
                self.cv.wait(&mut inner);
            }
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Queues, timer, and worker threads of one scrub context.
#[derive(Debug)]
pub struct Pipeline {
    pub submit_q: Arc<WorkQueue<Box<Batch>>>,
    pub complete_q: Arc<WorkQueue<Box<Batch>>>,
    pub fixup_q: Arc<WorkQueue<recover::FixupJob>>,
    pub timer: Arc<PacingTimer>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            submit_q: Arc::new(WorkQueue::default()),
            complete_q: Arc::new(WorkQueue::default()),
            fixup_q: Arc::new(WorkQueue::default()),
            timer: Arc::new(PacingTimer::default()),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

const IO_DISPATCHERS: usize = 2;
const COMPLETION_WORKERS: usize = 2;

/// Spawn dispatcher, completion, timer, and fixup threads for `ctx`.
pub fn start_workers(ctx: &Arc<ScrubCtx>) {
    if ctx.pipeline.started.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut handles = ctx.pipeline.handles.lock();

    for i in 0..IO_DISPATCHERS {
        let ctx = Arc::clone(ctx);
        handles.push(
            thread::Builder::new()
                .name(format!("scour-io-{i}"))
                .spawn(move || {
                    // Long-lived context for background I/O.
                    let cx = Cx::for_testing();
                    while let Some(batch) = ctx.pipeline.submit_q.pop() {
                        let batch = dispatch_io(&ctx, &cx, batch);
                        ctx.pipeline.complete_q.push(batch);
                    }
                })
                .expect("spawn io dispatcher"),
        );
    }

    for i in 0..COMPLETION_WORKERS {
        let ctx = Arc::clone(ctx);
        handles.push(
            thread::Builder::new()
                .name(format!("scour-complete-{i}"))
                .spawn(move || {
                    let cx = Cx::for_testing();
                    while let Some(batch) = ctx.pipeline.complete_q.pop() {
                        end_io_worker(&ctx, &cx, batch);
                    }
                })
                .expect("spawn completion worker"),
        );
    }

    {
        let ctx = Arc::clone(ctx);
        handles.push(
            thread::Builder::new()
                .name("scour-timer".to_owned())
                .spawn(move || {
                    while let Some(batch) = ctx.pipeline.timer.pop_due() {
                        wrapup(&ctx, batch);
                    }
                })
                .expect("spawn pacing timer"),
        );
    }

    {
        let ctx = Arc::clone(ctx);
        handles.push(
            thread::Builder::new()
                .name("scour-fixup".to_owned())
                .spawn(move || {
                    let cx = Cx::for_testing();
                    while let Some(job) = ctx.pipeline.fixup_q.pop() {
                        recover::run_fixup(&ctx, &cx, job);
                    }
                })
                .expect("spawn fixup worker"),
        );
    }
}

/// Stop all workers. Parked batches are wrapped up immediately.
pub fn shutdown(ctx: &Arc<ScrubCtx>) {
    ctx.pipeline.submit_q.close();
    ctx.pipeline.complete_q.close();
    ctx.pipeline.fixup_q.close();
    ctx.pipeline.timer.close();
    let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *ctx.pipeline.handles.lock());
    for handle in handles {
        let _ = handle.join();
    }
    ctx.pipeline.started.store(false, Ordering::Release);
}

/// Force every parked batch through wrapup now (cancel or final drain).
pub fn flush_pacing(ctx: &Arc<ScrubCtx>) {
    for batch in ctx.pipeline.timer.flush() {
        wrapup(ctx, batch);
    }
}

// ── I/O dispatch ────────────────────────────────────────────────────────────

fn dispatch_io(ctx: &ScrubCtx, cx: &Cx, mut batch: Box<Batch>) -> Box<Batch> {
    let handle = match (&batch.target, ctx.volume.device(batch.dev_id)) {
        (Some(target), _) => Arc::clone(target),
        (None, Some(dev)) => Arc::clone(&dev.handle),
        (None, None) => {
            batch.io_failed = true;
            return batch;
        }
    };
    let len = batch.page_count() * PAGE_SIZE as usize;
    match batch.dir {
        IoDir::Read => {
            let mut scratch = vec![0_u8; len];
            match handle.read_exact_at(cx, batch.physical, &mut scratch) {
                Ok(()) => {
                    for (i, bp) in batch.pages.iter().enumerate() {
                        let start = i * PAGE_SIZE as usize;
                        bp.page.fill(&scratch[start..start + PAGE_SIZE as usize]);
                    }
                }
                Err(err) => {
                    trace!(event = "batch_read_failed", physical = batch.physical.0, len, error = %err);
                    batch.io_failed = true;
                }
            }
        }
        IoDir::Write => {
            let mut scratch = Vec::with_capacity(len);
            for bp in &batch.pages {
                bp.page.with_contents(|c| scratch.extend_from_slice(c));
            }
            if let Err(err) = handle.write_all_at(cx, batch.physical, &scratch) {
                trace!(event = "batch_write_failed", physical = batch.physical.0, len, error = %err);
                batch.io_failed = true;
            }
        }
    }
    batch
}

// ── Completion ──────────────────────────────────────────────────────────────

fn end_io_worker(ctx: &Arc<ScrubCtx>, cx: &Cx, mut batch: Box<Batch>) {
    if batch.dir == IoDir::Write {
        wr_end_io(ctx, batch);
        return;
    }

    if batch.io_failed {
        for bp in &batch.pages {
            bp.page.set_io_error(true);
            if let Some(block) = &bp.block {
                block.clear_no_io_error_seen();
            }
        }
    }

    let page_count = batch.page_count();
    let pages = std::mem::take(&mut batch.pages);
    for bp in pages {
        if let Some(block) = bp.block {
            if block.dec_outstanding() {
                block_complete(ctx, cx, &block);
            }
        }
    }

    if let Some(replace) = &ctx.replace {
        if replace.flush_all_writes.load(Ordering::Acquire) {
            wr_submit(ctx);
        }
    }

    if ctx.rate.paced() {
        // Waiters on the drain condition are woken at wrapup; decrement
        // quietly here so pacing does not hold the in-flight count up.
        ctx.dec_in_flight_quiet();
        if ctx.fleet.pause_requested() || ctx.cancelled() {
            // Never delay while a pauser is draining; the lost interval is
            // credited so later laps do not over-delay.
            wrapup(ctx, batch);
        } else {
            let in_flight = batch.issued_at.elapsed();
            let owed = pacing_owed(ctx.rate.delay(), page_count, in_flight, batch.wasted);
            if owed > Duration::ZERO {
                batch.wasted = Duration::ZERO;
                ctx.pipeline.timer.park(Instant::now() + owed, batch);
            } else {
                batch.wasted = Duration::ZERO;
                wrapup(ctx, batch);
            }
        }
    } else {
        wrapup(ctx, batch);
    }
}

/// Return a completed batch to the pool, consulting the controller first.
fn wrapup(ctx: &Arc<ScrubCtx>, batch: Box<Batch>) {
    if ctx.rate.paced() {
        let elapsed = ctx.rate.elapsed();
        let progress = ctx.stats.lock().bytes_scrubbed();
        if ctx.rate.needs_adjustment(elapsed, progress) {
            if ctx.bgflags.contains(scour_types::BgFlags::BOOST) {
                match ctx.rate.boost_action(elapsed, progress) {
                    BoostAction::Boost => ctx.ioprio.boost(),
                    BoostAction::Restore => ctx.ioprio.restore(),
                    BoostAction::Keep => {}
                }
            }
            let target = adjust_rate(
                ctx.rate.used_bytes(),
                progress,
                ctx.rate.deadline_secs(),
                elapsed,
            );
            {
                let mut pool = ctx.pool.lock();
                let cur = pool.pool_size();
                if target.pool_size > cur {
                    info!(event = "pool_grow", from = cur, to = target.pool_size);
                    pool.grow(target.pool_size);
                } else if target.pool_size < cur {
                    info!(event = "pool_shrink", from = cur, to = target.pool_size);
                    ctx.pending_removals
                        .store(usize::from(cur - target.pool_size), Ordering::Release);
                }
            }
            ctx.rate.set_delay(target.delay);
        }

        let removing = ctx
            .pending_removals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let mut pool = ctx.pool.lock();
        if removing {
            debug!(event = "pool_slot_removed", index = batch.index.load(Ordering::Relaxed));
            pool.remove(batch);
        } else {
            pool.release(batch);
        }
        drop(pool);
    } else {
        ctx.pool.lock().release(batch);
        ctx.dec_in_flight_quiet();
    }
    ctx.dec_allocated_and_notify();
}

fn wr_end_io(ctx: &Arc<ScrubCtx>, mut batch: Box<Batch>) {
    if batch.io_failed {
        if let Some(replace) = &ctx.replace {
            for bp in &batch.pages {
                bp.page.set_io_error(true);
                replace.note_write_error();
            }
        }
    }
    batch.pages.clear();
    drop(batch);
    ctx.dec_in_flight_quiet();
    ctx.dec_allocated_and_notify();
}

/// Run verification once the last page of a block has landed; route
/// failures into recovery, and in replace mode forward clean blocks to the
/// target device.
fn block_complete(ctx: &Arc<ScrubCtx>, cx: &Cx, block: &Arc<ScrubBlock>) {
    if !block.no_io_error_seen() {
        recover::handle_errored_block(ctx, cx, block);
        return;
    }
    if verify::verify_block(ctx, block) {
        if ctx.replace.is_some() && !block.head().flags.is_super() {
            recover::write_block_to_replace(ctx, block);
        }
    } else {
        recover::handle_errored_block(ctx, cx, block);
    }
}

// ── Read-side submission ────────────────────────────────────────────────────

/// Take the current batch and hand it to the dispatchers. A batch whose
/// device has vanished completes synchronously with an I/O error instead of
/// crashing the run.
pub fn submit_reads(ctx: &Arc<ScrubCtx>) {
    let batch = ctx.pool.lock().take_curr();
    let Some(mut batch) = batch else {
        return;
    };
    ctx.inc_in_flight();
    ctx.inc_allocated();
    batch.issued_at = Instant::now();
    if batch.target.is_none() && ctx.volume.device(batch.dev_id).is_none() {
        warn!(event = "submit_missing_device", dev = batch.dev_id.0);
        batch.io_failed = true;
        ctx.pipeline.complete_q.push(batch);
    } else {
        ctx.pipeline.submit_q.push(batch);
    }
}

/// Append one page to the current read batch, submitting and retrying when
/// the page is not contiguous with the batch tail or the batch fills.
/// Blocks when the pool is exhausted; under a deadline the wait is bounded
/// and the pool grows by one slot while a pauser is waiting on us.
pub fn add_page_to_rd_batch(
    ctx: &Arc<ScrubCtx>,
    page: &Arc<ScrubPage>,
    block: &Arc<ScrubBlock>,
) -> Result<()> {
    loop {
        let mut full = false;
        {
            let mut pool = ctx.pool.lock();
            while !pool.has_curr() {
                if let Some(batch) = pool.acquire() {
                    pool.set_curr(batch);
                    break;
                }
                if ctx.cancelled() {
                    return Err(ScrubError::Cancelled);
                }
                if ctx.rate.paced() {
                    if ctx.fleet.pause_requested() {
                        let new_size = pool.pool_size().saturating_add(1);
                        debug!(event = "pool_grow_for_pause", to = new_size);
                        pool.grow(new_size);
                        continue;
                    }
                    let _ = ctx
                        .list_wait
                        .wait_for(&mut pool, FREE_BATCH_WAIT);
                } else {
                    ctx.list_wait.wait(&mut pool);
                }
            }

            let pages_per_batch = pool.pages_per_batch();
            let curr = pool.curr_mut().expect("current batch present");
            if curr.page_count() == 0 {
                curr.reset_for(page.dev, page.physical, page.logical);
                curr.dir = IoDir::Read;
                curr.target = None;
            } else if curr.phys_tail() != page.physical.0
                || curr.log_tail() != page.logical.0
                || curr.dev_id != page.dev
            {
                drop(pool);
                submit_reads(ctx);
                continue;
            }

            curr.pages.push(BatchPage {
                page: Arc::clone(page),
                block: Some(Arc::clone(block)),
            });
            full = curr.page_count() == pages_per_batch;
        }
        if full {
            submit_reads(ctx);
        }
        return Ok(());
    }
}

/// Create the block and pages for one logical block and feed them into the
/// read pipeline. `force` submits the current batch immediately (supers).
#[allow(clippy::too_many_arguments)]
pub fn scrub_pages(
    ctx: &Arc<ScrubCtx>,
    logical: Logical,
    len: u64,
    physical: Physical,
    dev: DevId,
    flags: ExtentFlags,
    generation: Generation,
    mirror_num: scour_types::MirrorNum,
    csum: Option<[u8; CSUM_SIZE]>,
    force: bool,
    physical_for_replace: Physical,
) -> Result<()> {
    let mut pages = Vec::new();
    let mut off = 0_u64;
    while off < len {
        pages.push(Arc::new(ScrubPage::new(
            dev,
            flags,
            generation,
            Logical(logical.0 + off),
            Physical(physical.0 + off),
            Physical(physical_for_replace.0 + off),
            mirror_num,
            csum,
        )));
        off += u64::from(PAGE_SIZE);
    }
    let block = Arc::new(ScrubBlock::new(pages));
    block.arm_outstanding();

    for page in block.pages() {
        add_page_to_rd_batch(ctx, page, &block)?;
    }
    if force {
        submit_reads(ctx);
    }
    Ok(())
}

// ── Replace-target write pipeline ───────────────────────────────────────────

/// Append one page to the replace write batch, submitting on discontinuity
/// or when full. The write batch is a singleton guarded by the write lock.
pub fn add_page_to_wr_batch(ctx: &Arc<ScrubCtx>, page: &Arc<ScrubPage>) -> Result<()> {
    let Some(replace) = &ctx.replace else {
        return Err(ScrubError::InvalidArgument(
            "write pipeline requires replace mode".to_owned(),
        ));
    };
    loop {
        let mut full = false;
        {
            let mut wr = replace.wr.lock();
            let batch = wr.get_or_insert_with(|| {
                Batch::new_write(Arc::clone(&replace.target), replace.pages_per_wr_batch)
            });
            if batch.page_count() == 0 {
                batch.reset_for(page.dev, page.physical_for_replace, page.logical);
            } else if batch.phys_tail() != page.physical_for_replace.0
                || batch.log_tail() != page.logical.0
            {
                drop(wr);
                wr_submit(ctx);
                continue;
            }
            batch.pages.push(BatchPage {
                page: Arc::clone(page),
                block: None,
            });
            full = batch.page_count() == replace.pages_per_wr_batch;
        }
        if full {
            wr_submit(ctx);
        }
        return Ok(());
    }
}

/// Submit the pending write batch, if any.
pub fn wr_submit(ctx: &Arc<ScrubCtx>) {
    let Some(replace) = &ctx.replace else {
        return;
    };
    let batch = replace.wr.lock().take();
    let Some(mut batch) = batch else {
        return;
    };
    if batch.page_count() == 0 {
        replace.wr.lock().get_or_insert(batch);
        return;
    }
    ctx.inc_in_flight();
    ctx.inc_allocated();
    batch.issued_at = Instant::now();
    ctx.pipeline.submit_q.push(batch);
}

/// Cooperative checkpoint against the walker's capability context.
pub fn checkpoint(cx: &Cx) -> Result<()> {
    cx_checkpoint(cx)
}
