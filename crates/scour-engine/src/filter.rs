//! Synergistic filter.
//!
//! Consumes page-cache events from the external observer and maintains the
//! task's LBA bitmap: an ADD marks the range as validated by the foreground,
//! a MODIFY unmarks it. The walker consults [`range_validated`] before
//! issuing reads; a hit means the foreground already read and verified the
//! region, so scrub can skip the I/O. The bitmap is advisory: a lost
//! unmark causes at worst a false skip that a later pass catches.

use crate::ScrubCtx;
use scour_synergy::{CheckOutcome, EventKind, Observer, TaskId};
use scour_types::{PAGE_SIZE, Physical};
use std::sync::Arc;
use tracing::{debug, trace};

/// Events processed per round before yielding back to the walker.
pub const MAX_EVENTS_PER_ROUND: usize = 256;

/// Observer wiring for one scrub context.
#[derive(Debug)]
pub struct SynergyCtx {
    pub observer: Arc<Observer>,
    pub task: TaskId,
    /// Absolute LBA of the scrubbed device's first byte (partition base).
    pub dev_start: u64,
    /// Whether the scrub registered the task itself (and must deregister
    /// it at teardown) or adopted a caller-owned one.
    pub owned_task: bool,
}

/// Drain up to [`MAX_EVENTS_PER_ROUND`] pending events, resolving each to a
/// device LBA range and updating the bitmap. Returns true when more events
/// remain, meaning the walker should give the foreground another chance
/// before queueing reads.
pub fn process_events(ctx: &ScrubCtx) -> bool {
    let Some(syn) = &ctx.synergy else {
        return false;
    };

    let mut processed = 0;
    while processed < MAX_EVENTS_PER_ROUND {
        let budget = (MAX_EVENTS_PER_ROUND - processed).min(64);
        let events = syn.observer.fetch(syn.task, budget);
        if events.is_empty() {
            return false;
        }
        for event in events {
            processed += 1;

            // Resolve inode + page index to a logical address, then to the
            // physical location on this device.
            let logical = {
                let file_extents = ctx.volume.file_extents.read();
                file_extents.logical_for_page(event.ino, event.page_index)
            };
            let Some(logical) = logical else {
                trace!(event = "synergy_unmapped", ino = event.ino.0, page = event.page_index);
                continue;
            };
            let Ok(mapping) = ctx.volume.map_block(logical, u64::from(PAGE_SIZE)) else {
                continue;
            };
            if mapping.mapped_length < u64::from(PAGE_SIZE) {
                continue;
            }
            let first = &mapping.mirrors[0];
            if first.dev != ctx.dev {
                debug!(event = "synergy_wrong_device", dev = first.dev.0);
                continue;
            }

            let lba = syn.dev_start + first.physical.0;
            let len = u64::from(PAGE_SIZE);
            match event.kind {
                EventKind::Modified | EventKind::AddedModified => {
                    if !syn.observer.unmark(syn.task, lba, len) {
                        debug!(event = "synergy_unmark_failed", lba, len);
                    }
                }
                EventKind::Added => {
                    if !syn.observer.mark(syn.task, lba, len) {
                        debug!(event = "synergy_mark_failed", lba, len);
                    }
                }
            }
        }
    }

    syn.observer.pending(syn.task) > 0
}

/// Has the foreground already validated `[physical, physical + len)` on the
/// scrubbed device? Never true in replace mode, where the target still
/// needs the bytes copied.
#[must_use]
pub fn range_validated(ctx: &ScrubCtx, physical: Physical, len: u64) -> bool {
    if ctx.replace.is_some() {
        return false;
    }
    let Some(syn) = &ctx.synergy else {
        return false;
    };
    syn.observer.check(syn.task, syn.dev_start + physical.0, len) == Some(CheckOutcome::AllSet)
}
