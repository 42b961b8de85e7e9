#![forbid(unsafe_code)]
//! Scrub engine.
//!
//! Walks every allocated extent of a device, reads each mirror through an
//! aligned, paced read pipeline, verifies checksums and headers, and
//! repairs damaged pages from surviving mirrors. An operator deadline
//! drives an adaptive controller that trades batch-pool depth against
//! inter-batch delay; an optional observer feed lets the scrubber skip
//! regions the foreground workload has already validated. A second mode
//! copies data onto a replacement device instead of repairing in place.

pub mod batch;
pub mod filter;
pub mod page;
pub mod pipeline;
pub mod rate;
pub mod recover;
pub mod verify;
pub mod walker;

pub use filter::SynergyCtx;
pub use rate::{IoPriorityHook, LogOnlyPriority, RateState};
pub use recover::{CacheRetryFixup, FixupOutcome, NocowFixup};

use asupersync::Cx;
use batch::PoolState;
use parking_lot::{Condvar, Mutex};
use scour_block::{ByteDevice, DeviceErrorStats};
use scour_error::{Result, ScrubError};
use scour_layout::Volume;
use scour_synergy::{EventMask, Observer};
use scour_types::{
    BgFlags, DEFAULT_BATCH_POOL, DevId, PAGE_SIZE, PAGES_PER_RD_BATCH, PAGES_PER_WR_BATCH,
    ScrubProgress, VolumeGeometry,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

// ── Fleet-wide pause / cancel state ─────────────────────────────────────────

#[derive(Debug, Default)]
struct FleetInner {
    pause_req: u32,
    paused: u32,
    running: u32,
    cancel_req: u32,
    running_devs: BTreeSet<u64>,
    cancel_devs: BTreeSet<u64>,
    replace_running: bool,
}

/// Shared pause/cancel broadcast state for every scrub on one volume.
///
/// Pause is a counter paired with a wait queue: a pauser blocks until every
/// running scrub has drained its in-flight I/O and parked.
#[derive(Debug, Default)]
pub struct FleetState {
    inner: Mutex<FleetInner>,
    cv: Condvar,
}

impl FleetState {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request a fleet-wide pause and wait until every running scrub parks.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        inner.pause_req += 1;
        while inner.paused != inner.running {
            self.cv.wait(&mut inner);
        }
    }

    /// Clear one pause request and wake the parked walkers.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.pause_req = inner.pause_req.saturating_sub(1);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.inner.lock().pause_req > 0
    }

    /// Cancel every running scrub and wait for them to terminate.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        if inner.running == 0 {
            return;
        }
        inner.cancel_req += 1;
        while inner.running > 0 {
            self.cv.wait(&mut inner);
        }
        inner.cancel_req -= 1;
    }

    /// Cancel the scrub on one device, without waiting.
    pub fn cancel_device(&self, dev: DevId) {
        let mut inner = self.inner.lock();
        inner.cancel_devs.insert(dev.0);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn cancelled(&self, dev: DevId) -> bool {
        let inner = self.inner.lock();
        inner.cancel_req > 0 || inner.cancel_devs.contains(&dev.0)
    }

    pub(crate) fn enter_paused(&self) {
        let mut inner = self.inner.lock();
        inner.paused += 1;
        self.cv.notify_all();
    }

    pub(crate) fn exit_paused(&self) {
        let mut inner = self.inner.lock();
        inner.paused = inner.paused.saturating_sub(1);
        self.cv.notify_all();
    }

    pub(crate) fn wait_while_paused(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.pause_req > 0 {
            let _ = self.cv.wait_for(&mut inner, timeout);
        }
    }

    /// Reserve a run slot: one scrub per device, and a device replace
    /// excludes plain scrubs fleet-wide.
    fn register(&self, dev: DevId, is_replace: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.running_devs.contains(&dev.0) {
            return Err(ScrubError::InProgress(dev.0));
        }
        if inner.replace_running && !is_replace {
            return Err(ScrubError::InProgress(dev.0));
        }
        inner.running_devs.insert(dev.0);
        if is_replace {
            inner.replace_running = true;
        }
        inner.running += 1;
        Ok(())
    }

    fn unregister(&self, dev: DevId, is_replace: bool) {
        let mut inner = self.inner.lock();
        inner.running_devs.remove(&dev.0);
        inner.cancel_devs.remove(&dev.0);
        if is_replace {
            inner.replace_running = false;
        }
        inner.running = inner.running.saturating_sub(1);
        self.cv.notify_all();
    }
}

// ── Replace-mode write context ──────────────────────────────────────────────

/// Write pipeline onto the replacement target. Holds at most one batch
/// under construction behind the write lock.
pub struct ReplaceCtx {
    pub target: Arc<dyn ByteDevice>,
    pub wr: Mutex<Option<Box<batch::Batch>>>,
    pub pages_per_wr_batch: usize,
    pub flush_all_writes: AtomicBool,
    write_errors: AtomicU64,
}

impl std::fmt::Debug for ReplaceCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaceCtx")
            .field("write_errors", &self.write_errors())
            .finish_non_exhaustive()
    }
}

impl ReplaceCtx {
    fn new(target: Arc<dyn ByteDevice>) -> Self {
        Self {
            target,
            wr: Mutex::new(None),
            pages_per_wr_batch: PAGES_PER_WR_BATCH,
            flush_all_writes: AtomicBool::new(false),
            write_errors: AtomicU64::new(0),
        }
    }

    pub fn note_write_error(&self) {
        let total = self.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(event = "replace_write_error", total);
    }

    #[must_use]
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

// ── Options and hooks ───────────────────────────────────────────────────────

/// Operator parameters for one scrub run.
#[derive(Clone)]
pub struct ScrubOptions {
    /// Physical device range `[start, end)` to cover; device extents are
    /// selected at extent granularity like the cursor they feed.
    pub start: u64,
    pub end: u64,
    pub readonly: bool,
    /// Wall-clock completion target in seconds; 0 disables pacing.
    pub deadline_secs: u64,
    pub bg_flags: BgFlags,
    /// Replacement device: scrub writes good data here instead of
    /// repairing the source.
    pub replace_target: Option<Arc<dyn ByteDevice>>,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
            readonly: false,
            deadline_secs: 0,
            bg_flags: BgFlags::default(),
            replace_target: None,
        }
    }
}

impl std::fmt::Debug for ScrubOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrubOptions")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("readonly", &self.readonly)
            .field("deadline_secs", &self.deadline_secs)
            .field("replace", &self.replace_target.is_some())
            .finish()
    }
}

/// Synergistic-mode wiring.
#[derive(Clone)]
pub struct SynergyConfig {
    pub observer: Arc<Observer>,
    /// Absolute LBA of the device's first byte (partition base).
    pub dev_start: u64,
    /// Adopt an already-registered observer task (kept across runs) instead
    /// of registering a fresh one for this run.
    pub task: Option<scour_synergy::TaskId>,
}

/// Pluggable collaborators with portable defaults.
pub struct ScrubHooks {
    pub fixup: Arc<dyn NocowFixup>,
    pub ioprio: Arc<dyn IoPriorityHook>,
    pub synergy: Option<SynergyConfig>,
}

impl Default for ScrubHooks {
    fn default() -> Self {
        Self {
            fixup: Arc::new(CacheRetryFixup::new()),
            ioprio: Arc::new(LogOnlyPriority),
            synergy: None,
        }
    }
}

// ── Scrub context ───────────────────────────────────────────────────────────

/// Warning rate limiter: a burst budget per fixed window.
#[derive(Debug)]
struct WarnWindow {
    start: Instant,
    emitted: u32,
}

const WARN_WINDOW: Duration = Duration::from_secs(5);
const WARN_BURST: u32 = 10;

/// Per-device scrub state: the batch pool, the pipeline, live counters,
/// rate parameters, and statistics. Created at scrub start; torn down only
/// after every in-flight batch and pending worker has drained.
pub struct ScrubCtx {
    pub volume: Arc<Volume>,
    pub dev: DevId,
    pub dev_handle: Arc<dyn ByteDevice>,
    pub dev_stats: Arc<DeviceErrorStats>,
    pub geometry: VolumeGeometry,
    pub readonly: bool,
    pub bgflags: BgFlags,
    pub replace: Option<ReplaceCtx>,
    pub fleet: Arc<FleetState>,

    pub pool: Mutex<PoolState>,
    pub list_wait: Condvar,
    bios_in_flight: AtomicUsize,
    bios_allocated: AtomicUsize,
    workers_pending: AtomicUsize,
    pub pending_removals: AtomicUsize,
    cancel_req: AtomicBool,

    pub rate: RateState,
    pub stats: Mutex<ScrubProgress>,
    pub csum_list: Mutex<VecDeque<scour_layout::CsumRun>>,
    synergy_skips: AtomicU64,

    pub synergy: Option<SynergyCtx>,
    pub fixup: Arc<dyn NocowFixup>,
    pub ioprio: Arc<dyn IoPriorityHook>,
    pub pipeline: pipeline::Pipeline,

    warn_window: Mutex<WarnWindow>,
}

impl std::fmt::Debug for ScrubCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrubCtx")
            .field("dev", &self.dev)
            .field("in_flight", &self.in_flight())
            .field("allocated", &self.allocated())
            .finish_non_exhaustive()
    }
}

impl ScrubCtx {
    pub(crate) fn inc_in_flight(&self) {
        self.bios_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement without waking drain waiters; they poll on a short bound.
    pub(crate) fn dec_in_flight_quiet(&self) {
        self.bios_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn inc_allocated(&self) {
        self.bios_allocated.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_allocated_and_notify(&self) {
        self.bios_allocated.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.pool.lock();
        self.list_wait.notify_all();
    }

    pub(crate) fn inc_workers_pending(&self) {
        self.workers_pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_workers_pending(&self) {
        self.workers_pending.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.pool.lock();
        self.list_wait.notify_all();
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.bios_in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.bios_allocated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn workers_pending(&self) -> usize {
        self.workers_pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancel_req.load(Ordering::Acquire) || self.fleet.cancelled(self.dev)
    }

    pub fn request_cancel(&self) {
        self.cancel_req.store(true, Ordering::Release);
    }

    pub(crate) fn note_synergy_skip(&self, len: u64) {
        self.synergy_skips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(event = "synergy_skip", dev = self.dev.0, len);
    }

    /// Regions skipped thanks to the synergistic filter.
    #[must_use]
    pub fn synergy_skips(&self) -> u64 {
        self.synergy_skips.load(Ordering::Relaxed)
    }

    fn wait_counter_zero(&self, read: impl Fn(&Self) -> usize) {
        let mut guard = self.pool.lock();
        while read(self) > 0 {
            let _ = self
                .list_wait
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    pub(crate) fn wait_in_flight_zero(&self) {
        self.wait_counter_zero(Self::in_flight);
    }

    pub(crate) fn wait_allocated_zero(&self) {
        self.wait_counter_zero(Self::allocated);
    }

    pub(crate) fn wait_workers_pending_zero(&self) {
        self.wait_counter_zero(Self::workers_pending);
    }

    /// Rate-limited per-block warning with file path resolution for data.
    pub(crate) fn print_warning(&self, errstr: &str, block: &page::ScrubBlock) {
        {
            let mut window = self.warn_window.lock();
            if window.start.elapsed() > WARN_WINDOW {
                window.start = Instant::now();
                window.emitted = 0;
            }
            if window.emitted >= WARN_BURST {
                return;
            }
            window.emitted += 1;
        }

        let head = block.head();
        let sector = head.physical.0 >> 9;
        if head.flags.is_data() {
            let files = self.volume.file_extents.read().files_for_logical(head.logical);
            if files.is_empty() {
                warn!(
                    event = "scrub_warning",
                    error = errstr,
                    logical = head.logical.0,
                    dev = self.dev.0,
                    physical = head.physical.0,
                    sector
                );
            }
            for (ino, file_offset, path) in files {
                warn!(
                    event = "scrub_warning",
                    error = errstr,
                    logical = head.logical.0,
                    dev = self.dev.0,
                    physical = head.physical.0,
                    sector,
                    ino = ino.0,
                    file_offset,
                    path = %path
                );
            }
        } else {
            warn!(
                event = "scrub_warning",
                error = errstr,
                logical = head.logical.0,
                dev = self.dev.0,
                physical = head.physical.0,
                sector
            );
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

fn setup_ctx(
    volume: Arc<Volume>,
    fleet: Arc<FleetState>,
    dev: DevId,
    opts: &ScrubOptions,
    hooks: ScrubHooks,
) -> Result<Arc<ScrubCtx>> {
    let device = volume.device(dev).ok_or(ScrubError::NoDevice(dev.0))?;
    let dev_handle = Arc::clone(&device.handle);
    let dev_stats = Arc::clone(&device.stats);
    let geometry = volume.geometry;

    if opts.readonly && opts.replace_target.is_some() {
        return Err(ScrubError::InvalidArgument(
            "replace mode cannot be read-only".to_owned(),
        ));
    }

    let rate = RateState::new(opts.deadline_secs);
    let pool_size = if opts.deadline_secs == 0 {
        DEFAULT_BATCH_POOL
    } else {
        if opts.bg_flags.contains(BgFlags::ENUM) {
            info!(event = "devext_enum_begin", dev = dev.0);
            let used = volume.used_bytes_on_device(dev)?;
            rate.set_used_bytes(used);
            rate.restart_clock_after_enumeration();
        } else {
            rate.set_used_bytes(volume.used_bytes_fallback(dev));
        }
        let target = rate.initial_target();
        rate.set_delay(target.delay);
        target.pool_size
    };
    info!(
        event = "scrub_setup",
        dev = dev.0,
        deadline_secs = opts.deadline_secs,
        used_bytes = rate.used_bytes(),
        pool_size,
        delay_us = rate.delay().as_micros() as u64
    );

    let synergy = match hooks.synergy {
        Some(config) => {
            let (task, owned_task) = match config.task {
                Some(task) => (task, false),
                None => {
                    let task = config
                        .observer
                        .register(
                            "scour-scrub",
                            EventMask(EventMask::ADD.0 | EventMask::MOD.0),
                            u64::from(PAGE_SIZE),
                        )
                        .ok_or_else(|| {
                            ScrubError::AllocFailed("observer task ids exhausted".to_owned())
                        })?;
                    (task, true)
                }
            };
            Some(SynergyCtx {
                observer: config.observer,
                task,
                dev_start: config.dev_start,
                owned_task,
            })
        }
        None => None,
    };

    Ok(Arc::new(ScrubCtx {
        volume,
        dev,
        dev_handle,
        dev_stats,
        geometry,
        readonly: opts.readonly,
        bgflags: opts.bg_flags,
        replace: opts.replace_target.as_ref().map(|t| ReplaceCtx::new(Arc::clone(t))),
        fleet,
        pool: Mutex::new(PoolState::new(pool_size, PAGES_PER_RD_BATCH)),
        list_wait: Condvar::new(),
        bios_in_flight: AtomicUsize::new(0),
        bios_allocated: AtomicUsize::new(0),
        workers_pending: AtomicUsize::new(0),
        pending_removals: AtomicUsize::new(0),
        cancel_req: AtomicBool::new(false),
        rate,
        stats: Mutex::new(ScrubProgress::default()),
        csum_list: Mutex::new(VecDeque::new()),
        synergy_skips: AtomicU64::new(0),
        synergy,
        fixup: hooks.fixup,
        ioprio: hooks.ioprio,
        pipeline: pipeline::Pipeline::default(),
        warn_window: Mutex::new(WarnWindow {
            start: Instant::now(),
            emitted: 0,
        }),
    }))
}

/// Drive one prepared context to completion: supers, chunk walk, final
/// drain, observer teardown, pipeline shutdown, fleet release.
fn run_scrub(
    ctx: &Arc<ScrubCtx>,
    cx: &Cx,
    start: u64,
    end: u64,
    is_replace: bool,
) -> Result<ScrubProgress> {
    let walk = (|| -> Result<()> {
        if ctx.replace.is_none() {
            walker::scrub_supers(ctx, cx)?;
        }
        walker::scrub_enumerate_chunks(ctx, cx, start, end)
    })();

    // Final drain: push queued work, cancel residual pacing, then wait for
    // the pipeline to empty before touching the stats. Read completions in
    // replace mode spawn writes, so write flushing stays forced until the
    // reads are gone.
    if let Some(replace) = &ctx.replace {
        replace.flush_all_writes.store(true, Ordering::Release);
    }
    pipeline::submit_reads(ctx);
    pipeline::wr_submit(ctx);
    pipeline::flush_pacing(ctx);
    ctx.wait_allocated_zero();
    ctx.wait_in_flight_zero();
    if let Some(replace) = &ctx.replace {
        replace.flush_all_writes.store(false, Ordering::Release);
    }
    ctx.wait_workers_pending_zero();

    if let Some(synergy) = &ctx.synergy {
        if synergy.owned_task {
            synergy.observer.deregister(synergy.task);
        }
    }
    let progress = *ctx.stats.lock();
    pipeline::shutdown(ctx);
    ctx.fleet.unregister(ctx.dev, is_replace);

    info!(
        event = "scrub_done",
        dev = ctx.dev.0,
        synergy_skips = ctx.synergy_skips(),
        %progress
    );
    walk.map(|()| progress)
}

/// Run a full scrub (or replace copy) of one device, blocking until done.
///
/// Returns the statistics snapshot; `Err(Cancelled)` when cancellation won.
pub fn scrub_device(
    cx: &Cx,
    volume: Arc<Volume>,
    fleet: Arc<FleetState>,
    dev: DevId,
    opts: &ScrubOptions,
    hooks: ScrubHooks,
) -> Result<ScrubProgress> {
    let is_replace = opts.replace_target.is_some();
    fleet.register(dev, is_replace)?;
    let ctx = match setup_ctx(volume, Arc::clone(&fleet), dev, opts, hooks) {
        Ok(ctx) => ctx,
        Err(err) => {
            fleet.unregister(dev, is_replace);
            return Err(err);
        }
    };
    pipeline::start_workers(&ctx);
    run_scrub(&ctx, cx, opts.start, opts.end, is_replace)
}

/// Handle to a background scrub started with [`scrub_start`].
pub struct ScrubHandle {
    ctx: Arc<ScrubCtx>,
    join: JoinHandle<Result<ScrubProgress>>,
}

impl ScrubHandle {
    /// Live statistics snapshot.
    #[must_use]
    pub fn progress(&self) -> ScrubProgress {
        *self.ctx.stats.lock()
    }

    /// Request cancellation; observed at the next walker iteration.
    pub fn cancel(&self) {
        self.ctx.request_cancel();
    }

    /// Batches currently in flight (zero once a pause has drained).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ctx.in_flight()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish.
    pub fn wait(self) -> Result<ScrubProgress> {
        self.join.join().map_err(|_| {
            ScrubError::Io(std::io::Error::other("scrub thread panicked"))
        })?
    }
}

/// Start a scrub on its own thread and return a progress handle.
pub fn scrub_start(
    volume: Arc<Volume>,
    fleet: Arc<FleetState>,
    dev: DevId,
    opts: ScrubOptions,
    hooks: ScrubHooks,
) -> Result<ScrubHandle> {
    let is_replace = opts.replace_target.is_some();
    fleet.register(dev, is_replace)?;
    let ctx = match setup_ctx(Arc::clone(&volume), Arc::clone(&fleet), dev, &opts, hooks) {
        Ok(ctx) => ctx,
        Err(err) => {
            fleet.unregister(dev, is_replace);
            return Err(err);
        }
    };
    pipeline::start_workers(&ctx);

    let thread_ctx = Arc::clone(&ctx);
    let join = thread::Builder::new()
        .name(format!("scour-scrub-{}", dev.0))
        .spawn(move || {
            let cx = Cx::for_request();
            run_scrub(&thread_ctx, &cx, opts.start, opts.end, is_replace)
        })
        .map_err(ScrubError::Io)?;

    Ok(ScrubHandle { ctx, join })
}
