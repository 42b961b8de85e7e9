//! Extent walker.
//!
//! Walks every device extent of the scrubbed device, stripe by stripe,
//! against the commit-root snapshot: finds the extents inside each stripe,
//! trims them to the stripe, prefetches their checksums, and feeds
//! sub-blocks into the read pipeline. Drives the pause/cancel protocol and
//! the super-block pass.

use crate::ScrubCtx;
use crate::{filter, pipeline, verify};
use asupersync::Cx;
use scour_error::{Result, ScrubError};
use scour_layout::{Chunk, DevExtent, ExtentRecord};
use scour_types::{
    ExtentFlags, Generation, Logical, MirrorNum, Physical, STRIPE_LEN, SUPER_INFO_SIZE,
    SUPER_OFFSETS,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval for drain waits and the parked state.
const PAUSE_POLL: Duration = Duration::from_millis(20);

/// Cooperative pause point: when a pause is requested, push queued work,
/// cancel pacing, drain in-flight I/O, park until the request clears, and
/// return with the cursor untouched so the caller resumes at the exact
/// logical offset it left off.
fn pause_point(ctx: &Arc<ScrubCtx>, cx: &Cx) -> Result<()> {
    if !ctx.fleet.pause_requested() {
        return Ok(());
    }
    debug!(event = "pause_enter", dev = ctx.dev.0);

    if let Some(replace) = &ctx.replace {
        replace
            .flush_all_writes
            .store(true, std::sync::atomic::Ordering::Release);
    }
    pipeline::submit_reads(ctx);
    pipeline::wr_submit(ctx);
    // A pending pause cancels pacing: parked batches are released now
    // rather than after their interval.
    pipeline::flush_pacing(ctx);
    ctx.wait_in_flight_zero();
    if let Some(replace) = &ctx.replace {
        replace
            .flush_all_writes
            .store(false, std::sync::atomic::Ordering::Release);
    }

    ctx.fleet.enter_paused();
    while ctx.fleet.pause_requested() {
        if ctx.cancelled() {
            break;
        }
        // Parked time is a good moment to drain observer events.
        if !filter::process_events(ctx) {
            ctx.fleet.wait_while_paused(PAUSE_POLL);
        }
    }
    ctx.fleet.exit_paused();
    debug!(event = "pause_exit", dev = ctx.dev.0);

    pipeline::checkpoint(cx)?;
    if ctx.cancelled() {
        return Err(ScrubError::Cancelled);
    }
    Ok(())
}

/// Scrub all super-block copies that fit the device. Forced single-block
/// submissions with the volume's committed generation; errors are reported
/// only.
pub fn scrub_supers(ctx: &Arc<ScrubCtx>, cx: &Cx) -> Result<()> {
    let generation = ctx.volume.generation;
    for (i, offset) in SUPER_OFFSETS.iter().enumerate() {
        if offset + u64::from(SUPER_INFO_SIZE) > ctx.dev_handle.len_bytes() {
            break;
        }
        pipeline::scrub_pages(
            ctx,
            Logical(*offset),
            u64::from(SUPER_INFO_SIZE),
            Physical(*offset),
            ctx.dev,
            ExtentFlags::SUPER,
            generation,
            MirrorNum(i as u8 + 1),
            None,
            true,
            Physical(*offset),
        )?;
    }
    ctx.wait_in_flight_zero();
    pipeline::checkpoint(cx)
}

/// Walk the device extents of the scrubbed device overlapping
/// `[start, end)` and scrub each one, draining between chunks.
pub fn scrub_enumerate_chunks(ctx: &Arc<ScrubCtx>, cx: &Cx, start: u64, end: u64) -> Result<()> {
    let dev_extents: Vec<DevExtent> = ctx.volume.dev_extents.read().for_device(ctx.dev, start, end);

    for dext in dev_extents {
        if ctx.cancelled() {
            return Err(ScrubError::Cancelled);
        }
        let Some(chunk) = ctx.volume.chunk_by_start(dext.chunk_logical) else {
            warn!(
                event = "dangling_dev_extent",
                dev = ctx.dev.0,
                chunk = dext.chunk_logical.0
            );
            continue;
        };
        let Some(num) = chunk.find_stripe(ctx.dev, dext.dev_offset) else {
            warn!(
                event = "dev_extent_stripe_mismatch",
                dev = ctx.dev.0,
                dev_offset = dext.dev_offset.0
            );
            continue;
        };
        info!(
            event = "scrub_chunk",
            chunk = chunk.logical.0,
            dev_offset = dext.dev_offset.0,
            length = dext.length
        );
        scrub_stripes(ctx, cx, chunk, num, &dext)?;

        // Drain everything before moving on. In replace mode read
        // completions spawn writes, so writes are flushed as part of the
        // same drain.
        if let Some(replace) = &ctx.replace {
            replace
                .flush_all_writes
                .store(true, std::sync::atomic::Ordering::Release);
        }
        pipeline::submit_reads(ctx);
        pipeline::wr_submit(ctx);
        ctx.wait_in_flight_zero();
        if let Some(replace) = &ctx.replace {
            replace
                .flush_all_writes
                .store(false, std::sync::atomic::Ordering::Release);
        }
        ctx.wait_workers_pending_zero();

        pause_point(ctx, cx)?;

        let stats = *ctx.stats.lock();
        if stats.malloc_errors > 0 {
            return Err(ScrubError::AllocFailed("recovery allocations failed".to_owned()));
        }
        if let Some(replace) = &ctx.replace {
            if replace.write_errors() > 0 {
                return Err(ScrubError::Io(std::io::Error::other(
                    "replace target write errors",
                )));
            }
        }
    }
    Ok(())
}

/// Walk every stripe of one device extent.
fn scrub_stripes(
    ctx: &Arc<ScrubCtx>,
    cx: &Cx,
    chunk: &Chunk,
    num: usize,
    dext: &DevExtent,
) -> Result<()> {
    let Some(walk) = chunk.stripe_walk(num) else {
        // RAID5/6 parity stripe: data stripes only.
        return Ok(());
    };

    let nstripes = dext.length / STRIPE_LEN;
    let logic_end = chunk.logical.0 + walk.offset + walk.increment * nstripes;
    let mut logical = chunk.logical.0 + walk.offset;
    let mut physical = dext.dev_offset.0;

    // Readahead hint over the ranges this pass will actually touch; with
    // the filter active, already-validated stripes are left cold.
    hint_readahead(ctx, nstripes, physical);

    while logical < logic_end {
        if ctx.cancelled() {
            return Err(ScrubError::Cancelled);
        }
        pause_point(ctx, cx)?;

        // Keep the bitmap current; if the observer still has a backlog,
        // the foreground gets the next slice of time anyway.
        let _ = filter::process_events(ctx);

        let stripe_end = logical + STRIPE_LEN;
        let extents: Vec<ExtentRecord> = {
            let index = ctx.volume.extents.read();
            index.overlapping(logical, stripe_end).copied().collect()
        };

        for ext in extents {
            // A pause may arrive mid-stripe; honoring it here is safe
            // because the cursor math below restarts from `logical`.
            pause_point(ctx, cx)?;

            // Tree blocks must lie entirely inside one stripe; the
            // allocator guarantees it, so a straddler is a layout
            // violation, not work.
            if ext.flags.is_tree_block() && (ext.logical.0 < logical || ext.end() > stripe_end) {
                warn!(
                    event = "tree_block_spans_stripes",
                    extent = ext.logical.0,
                    stripe = logical,
                    "ignored"
                );
                continue;
            }

            let mut extent_logical = ext.logical.0;
            let mut extent_len = ext.length;
            if extent_logical < logical {
                extent_len -= logical - extent_logical;
                extent_logical = logical;
            }
            if extent_logical + extent_len > stripe_end {
                extent_len = stripe_end - extent_logical;
            }
            let extent_physical = extent_logical - logical + physical;

            // Whole-portion skip: the foreground already validated it, so
            // only the accounting moves.
            if filter::range_validated(ctx, Physical(extent_physical), extent_len) {
                let mut stats = ctx.stats.lock();
                if ext.flags.is_data() {
                    stats.data_bytes_scrubbed += extent_len;
                } else if ext.flags.is_tree_block() {
                    stats.tree_bytes_scrubbed += extent_len;
                }
                drop(stats);
                ctx.note_synergy_skip(extent_len);
                continue;
            }

            // Prefetch the stripe's checksums so block submission does not
            // seek into the csum index per sector.
            {
                let runs = ctx.volume.csums.read().runs_in(logical, stripe_end);
                *ctx.csum_list.lock() = VecDeque::from(runs);
            }

            scrub_extent(
                ctx,
                cx,
                Logical(extent_logical),
                extent_len,
                Physical(extent_physical),
                ext.flags,
                ext.generation,
                walk.mirror_num,
            )?;

            ctx.csum_list.lock().clear();
        }

        logical += walk.increment;
        physical += STRIPE_LEN;
        ctx.stats.lock().last_physical = physical;
    }

    ctx.stats.lock().last_physical = dext.dev_offset.0 + dext.length;
    Ok(())
}

fn hint_readahead(ctx: &ScrubCtx, nstripes: u64, mut physical: u64) {
    for _ in 0..nstripes {
        if !filter::range_validated(ctx, Physical(physical), STRIPE_LEN) {
            ctx.dev_handle.readahead(Physical(physical), STRIPE_LEN);
        }
        physical += STRIPE_LEN;
    }
}

/// Split one trimmed extent into blocks and feed them to the pipeline.
#[allow(clippy::too_many_arguments)]
fn scrub_extent(
    ctx: &Arc<ScrubCtx>,
    cx: &Cx,
    logical: Logical,
    len: u64,
    physical: Physical,
    flags: ExtentFlags,
    generation: Generation,
    mirror_num: MirrorNum,
) -> Result<()> {
    pipeline::checkpoint(cx)?;

    let blocksize = u64::from(ctx.geometry.block_size_for(flags));
    {
        let mut stats = ctx.stats.lock();
        if flags.is_data() {
            stats.data_extents_scrubbed += 1;
            stats.data_bytes_scrubbed += len;
        } else if flags.is_tree_block() {
            stats.tree_extents_scrubbed += 1;
            stats.tree_bytes_scrubbed += len;
        }
    }

    let mut logical = logical.0;
    let mut physical = physical.0;
    let mut remaining = len;
    while remaining > 0 {
        let l = remaining.min(blocksize);

        // Per-block skip: the foreground validated this block after the
        // extent-level check ran.
        if filter::range_validated(ctx, Physical(physical), l) {
            ctx.note_synergy_skip(l);
        } else {
            {
                let mut stats = ctx.stats.lock();
                if flags.is_data() {
                    stats.data_bytes_verified += l;
                } else if flags.is_tree_block() {
                    stats.tree_bytes_verified += l;
                }
            }

            let mut csum = None;
            if flags.is_data() {
                let mut discards = 0_u64;
                csum = verify::find_csum(
                    &mut ctx.csum_list.lock(),
                    &mut discards,
                    Logical(logical),
                    ctx.geometry.sectorsize(),
                );
                if discards > 0 {
                    ctx.stats.lock().csum_discards += discards;
                }
                if csum.is_none() {
                    ctx.stats.lock().no_csum += 1;
                    if ctx.replace.is_some() {
                        // No stable csum means possibly no COW either; copy
                        // through the nocow worker instead of the scrub
                        // read path.
                        ctx.inc_workers_pending();
                        ctx.pipeline.fixup_q.push(crate::recover::FixupJob::NocowCopy {
                            logical: Logical(logical),
                            length: l,
                            physical_for_replace: Physical(physical),
                        });
                        remaining -= l;
                        logical += l;
                        physical += l;
                        continue;
                    }
                }
            }

            pipeline::scrub_pages(
                ctx,
                Logical(logical),
                l,
                Physical(physical),
                ctx.dev,
                flags,
                generation,
                mirror_num,
                csum,
                false,
                Physical(physical),
            )?;
        }

        remaining -= l;
        logical += l;
        physical += l;
    }
    Ok(())
}

