//! Error-recovery state machine.
//!
//! Called when verification of a block failed or its batch read failed. The
//! recovery path re-reads every mirror page by page, defeating request
//! merging so the exact bad pages are known, then repairs the failed
//! mirror from a clean one, falls back to page-level repair across mirrors,
//! or declares the block uncorrectable. Data without checksums takes a
//! deferred cache-path fixup instead, and super blocks are only counted.

use crate::ScrubCtx;
use crate::page::{ScrubBlock, ScrubPage};
use crate::{pipeline, verify};
use asupersync::Cx;
use parking_lot::Mutex;
use scour_error::{Result, ScrubError};
use scour_layout::Volume;
use scour_types::{
    Generation, Logical, MAX_MIRRORS, MirrorNum, PAGE_SIZE, Physical,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Deferred work handed to the fixup worker pool.
#[derive(Debug)]
pub enum FixupJob {
    /// No-csum data fault: retry through the cache path so the foreground
    /// correction machinery gets a chance at it.
    Nodatasum {
        logical: Logical,
        length: u64,
        failed_mirror: MirrorNum,
    },
    /// Replace-mode copy of no-csum data onto the target device.
    NocowCopy {
        logical: Logical,
        length: u64,
        physical_for_replace: Physical,
    },
}

/// Outcome of the cache-path fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    Corrected,
    Uncorrectable,
}

/// Cache-path retry hook for no-csum data. Embedders wire the surrounding
/// filesystem's readpage machinery here; the default retries other mirrors
/// directly and honors the dirty-page race by giving up.
pub trait NocowFixup: Send + Sync {
    fn fixup(
        &self,
        cx: &Cx,
        volume: &Volume,
        logical: Logical,
        length: u64,
        failed_mirror: MirrorNum,
    ) -> FixupOutcome;
}

/// Default fixup: re-read the failed mirror page by page; for pages that
/// stay unreadable, copy any readable mirror's page over them. A page that
/// sits dirty in the cache is left alone and the block is declared
/// uncorrectable for this pass.
#[derive(Debug, Default)]
pub struct CacheRetryFixup {
    dirty_pages: Mutex<BTreeSet<u64>>,
}

impl CacheRetryFixup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a logical page as dirty in the cache (test hook for the
    /// documented dirty-page race).
    pub fn mark_dirty(&self, logical: Logical) {
        self.dirty_pages.lock().insert(logical.0);
    }
}

impl NocowFixup for CacheRetryFixup {
    fn fixup(
        &self,
        cx: &Cx,
        volume: &Volume,
        logical: Logical,
        length: u64,
        failed_mirror: MirrorNum,
    ) -> FixupOutcome {
        let mut off = 0_u64;
        while off < length {
            let page_logical = Logical(logical.0 + off);
            if self.dirty_pages.lock().contains(&page_logical.0) {
                // The cache holds newer content than disk; writing either
                // would be wrong. Treat as uncorrectable for now.
                return FixupOutcome::Uncorrectable;
            }
            let Ok(mapping) = volume.map_block(page_logical, u64::from(PAGE_SIZE)) else {
                return FixupOutcome::Uncorrectable;
            };
            let mut buf = vec![0_u8; PAGE_SIZE as usize];
            let failed = mapping.mirror(failed_mirror);
            let readable_on_failed = failed.is_some_and(|m| {
                volume.device(m.dev).is_some_and(|dev| {
                    dev.handle.read_exact_at(cx, m.physical, &mut buf).is_ok()
                })
            });
            if !readable_on_failed {
                let mut repaired = false;
                for other in &mapping.mirrors {
                    if other.mirror_num == failed_mirror {
                        continue;
                    }
                    let Some(dev) = volume.device(other.dev) else {
                        continue;
                    };
                    if dev.handle.read_exact_at(cx, other.physical, &mut buf).is_ok() {
                        if let (Some(bad), Some(bad_dev)) =
                            (failed, failed.and_then(|m| volume.device(m.dev)))
                        {
                            if bad_dev.handle.write_all_at(cx, bad.physical, &buf).is_ok() {
                                repaired = true;
                                break;
                            }
                        }
                    }
                }
                if !repaired {
                    return FixupOutcome::Uncorrectable;
                }
            }
            off += u64::from(PAGE_SIZE);
        }
        FixupOutcome::Corrected
    }
}

// ── Recheck machinery ───────────────────────────────────────────────────────

/// Materialize one recheck block per existing mirror, with fresh buffers.
/// The outstanding-page latch of these blocks is never armed; they are read
/// synchronously.
fn setup_recheck_blocks(ctx: &ScrubCtx, block: &ScrubBlock) -> Result<Vec<ScrubBlock>> {
    let head = block.head();
    let mut per_mirror: Vec<Vec<Arc<ScrubPage>>> = Vec::new();

    let mut off = 0_u64;
    for original in block.pages() {
        let logical = Logical(head.logical.0 + off);
        let mapping = ctx.volume.map_block(logical, u64::from(PAGE_SIZE))?;
        if mapping.mapped_length < u64::from(PAGE_SIZE) {
            return Err(ScrubError::MapFailed {
                logical: logical.0,
                detail: "mapping shorter than a page".to_owned(),
            });
        }
        for (m, mirror) in mapping.mirrors.iter().enumerate().take(MAX_MIRRORS) {
            if per_mirror.len() <= m {
                per_mirror.push(Vec::new());
            }
            per_mirror[m].push(Arc::new(ScrubPage::new(
                mirror.dev,
                head.flags,
                head.generation,
                logical,
                mirror.physical,
                original.physical_for_replace,
                mirror.mirror_num,
                head.csum,
            )));
        }
        off += u64::from(PAGE_SIZE);
    }

    Ok(per_mirror.into_iter().map(ScrubBlock::new).collect())
}

/// Re-read a recheck block page by page, marking exactly which pages fail,
/// then re-run verification if everything was readable.
fn recheck_block(
    ctx: &ScrubCtx,
    cx: &Cx,
    block: &ScrubBlock,
    is_metadata: bool,
    data_csum: Option<[u8; scour_types::CSUM_SIZE]>,
    generation: Generation,
) {
    block.reset_for_recheck();
    for page in block.pages() {
        let Some(dev) = ctx.volume.device(page.dev) else {
            page.set_io_error(true);
            block.clear_no_io_error_seen();
            continue;
        };
        let mut buf = vec![0_u8; PAGE_SIZE as usize];
        match dev.handle.read_exact_at(cx, page.physical, &mut buf) {
            Ok(()) => page.fill(&buf),
            Err(_) => {
                page.set_io_error(true);
                block.clear_no_io_error_seen();
            }
        }
    }
    if block.no_io_error_seen() {
        verify::recheck_checksum(ctx, block, is_metadata, data_csum, generation);
    }
}

/// Overwrite one page of the bad mirror with the good mirror's copy.
/// Writes only when forced or the page/block actually carries an error, so
/// a good copy is never clobbered.
fn repair_page_from_good(
    ctx: &ScrubCtx,
    cx: &Cx,
    bad: &ScrubBlock,
    good: &ScrubBlock,
    page_num: usize,
    force_write: bool,
) -> Result<()> {
    let page_bad = &bad.pages()[page_num];
    let page_good = &good.pages()[page_num];

    if force_write || bad.header_error() || bad.checksum_error() || page_bad.io_error() {
        let Some(dev) = ctx.volume.device(page_bad.dev) else {
            warn!(event = "repair_missing_device", dev = page_bad.dev.0);
            return Err(ScrubError::NoDevice(page_bad.dev.0));
        };
        let bytes = page_good.contents();
        if let Err(err) = dev.handle.write_all_at(cx, page_bad.physical, &bytes) {
            ctx.dev_stats.inc_write(page_bad.dev.0);
            if let Some(replace) = &ctx.replace {
                replace.note_write_error();
            }
            return Err(err);
        }
    }
    Ok(())
}

fn repair_block_from_good(
    ctx: &ScrubCtx,
    cx: &Cx,
    bad: &ScrubBlock,
    good: &ScrubBlock,
    force_write: bool,
) -> Result<()> {
    let mut result = Ok(());
    for page_num in 0..bad.page_count() {
        if let Err(err) = repair_page_from_good(ctx, cx, bad, good, page_num, force_write) {
            result = Err(err);
        }
    }
    result
}

/// Queue one page for the replace target, zero-filled when it has no good
/// source.
fn write_page_to_replace(ctx: &Arc<ScrubCtx>, block: &ScrubBlock, page_num: usize) -> Result<()> {
    let page = &block.pages()[page_num];
    if page.io_error() {
        page.zero();
    }
    pipeline::add_page_to_wr_batch(ctx, page)
}

/// Queue a whole block for the replace target.
pub fn write_block_to_replace(ctx: &Arc<ScrubCtx>, block: &ScrubBlock) {
    for page_num in 0..block.page_count() {
        if write_page_to_replace(ctx, block, page_num).is_err() {
            if let Some(replace) = &ctx.replace {
                replace.note_write_error();
            }
        }
    }
}

// ── The state machine ───────────────────────────────────────────────────────

/// Entry point: a block whose read or verification failed.
pub fn handle_errored_block(ctx: &Arc<ScrubCtx>, cx: &Cx, block: &Arc<ScrubBlock>) {
    let head = block.head();

    // Super block faults are reported only; the next commit rewrites them.
    if head.flags.is_super() {
        ctx.stats.lock().super_errors += 1;
        return;
    }

    let logical = head.logical;
    let generation = head.generation;
    let is_metadata = head.flags.is_tree_block();
    let have_csum = head.csum;
    let failed_idx = head.mirror_num.index();

    if ctx.replace.is_some() && !is_metadata && have_csum.is_none() {
        // No-csum data in replace mode goes through the nocow copy worker;
        // the page cache, not the commit root, owns its stability.
        ctx.inc_workers_pending();
        ctx.pipeline.fixup_q.push(FixupJob::NocowCopy {
            logical,
            length: block.len_bytes(),
            physical_for_replace: head.physical_for_replace,
        });
        return;
    }

    let mirrors = match setup_recheck_blocks(ctx, block) {
        Ok(mirrors) if failed_idx < mirrors.len() => mirrors,
        _ => {
            let mut stats = ctx.stats.lock();
            stats.read_errors += 1;
            stats.uncorrectable_errors += 1;
            drop(stats);
            ctx.dev_stats.inc_read(ctx.dev.0);
            return;
        }
    };
    let bad = &mirrors[failed_idx];

    // Re-read the failed mirror page by page. Unbatched reads defeat
    // request merging, so each page's verdict is its own.
    recheck_block(ctx, cx, bad, is_metadata, have_csum, generation);

    if bad.is_clean() {
        // The fault vanished on the page-by-page re-read: a merged request
        // failed on someone else's pages, or the error was transient.
        ctx.stats.lock().unverified_errors += 1;
        if ctx.replace.is_some() {
            write_block_to_replace(ctx, bad);
        }
        return;
    }

    if !bad.no_io_error_seen() {
        ctx.stats.lock().read_errors += 1;
        ctx.print_warning("i/o error", block);
        ctx.dev_stats.inc_read(ctx.dev.0);
    } else if bad.checksum_error() {
        ctx.stats.lock().csum_errors += 1;
        ctx.print_warning("checksum error", block);
        ctx.dev_stats.inc_corruption(ctx.dev.0);
    } else if bad.header_error() {
        ctx.stats.lock().verify_errors += 1;
        ctx.print_warning("checksum/header error", block);
        if bad.generation_error() {
            ctx.dev_stats.inc_generation(ctx.dev.0);
        } else {
            ctx.dev_stats.inc_corruption(ctx.dev.0);
        }
    }

    if ctx.readonly {
        debug_assert!(ctx.replace.is_none());
        return;
    }

    if !is_metadata && have_csum.is_none() {
        // Possibly not COW'ed: the commit-root stability argument does not
        // hold, so repair must go through the cache path.
        ctx.inc_workers_pending();
        ctx.pipeline.fixup_q.push(FixupJob::Nodatasum {
            logical,
            length: block.len_bytes(),
            failed_mirror: head.mirror_num,
        });
        return;
    }

    // Look for a mirror that is completely clean: no I/O error and a good
    // checksum. With a checksum (or metadata) the whole block is rewritten;
    // without one, only pages that actually erred, so a good copy is never
    // overwritten by a guess.
    for (m, other) in mirrors.iter().enumerate() {
        if m == failed_idx {
            continue;
        }
        recheck_block(ctx, cx, other, is_metadata, have_csum, generation);
        if other.is_clean() {
            let repaired = if ctx.replace.is_some() {
                write_block_to_replace(ctx, other);
                true
            } else {
                let force = is_metadata || have_csum.is_some();
                repair_block_from_good(ctx, cx, bad, other, force).is_ok()
            };
            if repaired {
                ctx.stats.lock().corrected_errors += 1;
                info!(
                    event = "fixed_up",
                    logical = logical.0,
                    dev = ctx.dev.0,
                    from_mirror = m + 1
                );
                return;
            }
        }
    }

    // No fully clean mirror. Replace mode: assemble the target block page
    // by page from whatever mirror has each page; zeros where none does.
    if ctx.replace.is_some() {
        let mut success = true;
        for page_num in 0..bad.page_count() {
            let source = mirrors
                .iter()
                .find(|mirror| !mirror.pages()[page_num].io_error());
            match source {
                Some(mirror) => {
                    if write_page_to_replace(ctx, mirror, page_num).is_err() {
                        if let Some(replace) = &ctx.replace {
                            replace.note_write_error();
                        }
                    }
                }
                None => {
                    success = false;
                    if write_page_to_replace(ctx, bad, page_num).is_err() {
                        if let Some(replace) = &ctx.replace {
                            replace.note_write_error();
                        }
                    }
                }
            }
        }
        if !success {
            ctx.stats.lock().uncorrectable_errors += 1;
        }
        return;
    }

    // Regular scrub, page-level repair. Only I/O errors can be fixed here:
    // a checksum failure without I/O errors gives no way to tell which page
    // is the liar.
    if bad.no_io_error_seen() {
        ctx.stats.lock().uncorrectable_errors += 1;
        ctx.print_warning("unable to fixup (regular)", block);
        return;
    }

    let mut success = true;
    for page_num in 0..bad.page_count() {
        let page_bad = &bad.pages()[page_num];
        if !page_bad.io_error() {
            continue;
        }
        for (m, other) in mirrors.iter().enumerate() {
            if m == failed_idx {
                continue;
            }
            if !other.pages()[page_num].io_error()
                && repair_page_from_good(ctx, cx, bad, other, page_num, false).is_ok()
            {
                page_bad.set_io_error(false);
                break;
            }
        }
        if page_bad.io_error() {
            success = false;
        }
    }

    if success && (is_metadata || have_csum.is_some()) {
        // All bad sectors rewritten; verify the assembled result before
        // counting it corrected.
        recheck_block(ctx, cx, bad, is_metadata, have_csum, generation);
        success = bad.is_clean();
    }

    if success {
        ctx.stats.lock().corrected_errors += 1;
        info!(event = "fixed_up", logical = logical.0, dev = ctx.dev.0, path = "pages");
    } else {
        ctx.stats.lock().uncorrectable_errors += 1;
        ctx.print_warning("unable to fixup (regular)", block);
    }
}

// ── Deferred fixups ─────────────────────────────────────────────────────────

/// Run one deferred fixup job on the fixup worker.
pub fn run_fixup(ctx: &Arc<ScrubCtx>, cx: &Cx, job: FixupJob) {
    match job {
        FixupJob::Nodatasum {
            logical,
            length,
            failed_mirror,
        } => {
            match ctx.fixup.fixup(cx, &ctx.volume, logical, length, failed_mirror) {
                FixupOutcome::Corrected => {
                    ctx.stats.lock().corrected_errors += 1;
                }
                FixupOutcome::Uncorrectable => {
                    ctx.stats.lock().uncorrectable_errors += 1;
                    warn!(
                        event = "nodatasum_uncorrectable",
                        logical = logical.0,
                        dev = ctx.dev.0
                    );
                }
            }
        }
        FixupJob::NocowCopy {
            logical,
            length,
            physical_for_replace,
        } => {
            copy_nocow_pages(ctx, cx, logical, length, physical_for_replace);
        }
    }
    ctx.dec_workers_pending();
}

/// Replace-mode copy of no-csum data: read each page from any readable
/// mirror and write it to the target; unreadable pages become zeros and
/// count against the run.
fn copy_nocow_pages(
    ctx: &Arc<ScrubCtx>,
    cx: &Cx,
    logical: Logical,
    length: u64,
    physical_for_replace: Physical,
) {
    let Some(replace) = &ctx.replace else {
        return;
    };
    let mut off = 0_u64;
    while off < length {
        let page_logical = Logical(logical.0 + off);
        let mut buf = vec![0_u8; PAGE_SIZE as usize];
        let mut have = false;
        if let Ok(mapping) = ctx.volume.map_block(page_logical, u64::from(PAGE_SIZE)) {
            for mirror in &mapping.mirrors {
                let Some(dev) = ctx.volume.device(mirror.dev) else {
                    continue;
                };
                if dev.handle.read_exact_at(cx, mirror.physical, &mut buf).is_ok() {
                    have = true;
                    break;
                }
            }
        }
        if !have {
            buf.fill(0);
            replace.note_write_error();
            ctx.stats.lock().uncorrectable_errors += 1;
        }
        if replace
            .target
            .write_all_at(cx, Physical(physical_for_replace.0 + off), &buf)
            .is_err()
        {
            replace.note_write_error();
        }
        off += u64::from(PAGE_SIZE);
    }
}
