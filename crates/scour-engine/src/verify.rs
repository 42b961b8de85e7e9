//! Checksum and header verification.
//!
//! Three flavors selected by the block's extent flags: data sectors against
//! the csum index, tree blocks against their embedded header, super blocks
//! against the super layout. Super failures are reported only; they are
//! rewritten by the next commit out of band.

use crate::ScrubCtx;
use crate::page::ScrubBlock;
use scour_layout::{SuperHeader, TreeHeader, compute_data_csum, stored_csum};
use scour_types::{CSUM_SIZE, CSUM_SLOT_SIZE, Generation, Logical, SUPER_INFO_SIZE};
use std::collections::VecDeque;
use tracing::debug;

/// Concatenated content of all pages of a block.
#[must_use]
pub fn block_bytes(block: &ScrubBlock) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(block.len_bytes() as usize);
    for page in block.pages() {
        page.with_contents(|c| bytes.extend_from_slice(c));
    }
    bytes
}

/// First-pass verification at block-complete time. Sets the block's sticky
/// flags; returns true when the block is good (super blocks always return
/// true; their failures are counted, not repaired).
#[must_use]
pub fn verify_block(ctx: &ScrubCtx, block: &ScrubBlock) -> bool {
    let flags = block.head().flags;
    if flags.is_super() {
        verify_super(ctx, block);
        true
    } else if flags.is_tree_block() {
        verify_tree_block(ctx, block)
    } else {
        verify_data(ctx, block)
    }
}

fn verify_data(ctx: &ScrubCtx, block: &ScrubBlock) -> bool {
    let Some(on_disk) = block.head().csum else {
        return true;
    };
    let sectorsize = ctx.geometry.sectorsize() as usize;
    let bytes = block_bytes(block);
    let computed = compute_data_csum(&bytes[..sectorsize.min(bytes.len())]);

    if computed == on_disk {
        return true;
    }

    // The csum captured during the walk may be stale. Re-read it from the
    // csum index before declaring failure; a match means the block is fine
    // and only our cached csum lagged.
    let fresh = ctx.volume.csums.read().lookup(block.head().logical);
    if fresh == Some(computed) {
        debug!(
            event = "stale_csum",
            logical = block.head().logical.0,
            "re-read csum agrees with data"
        );
        ctx.stats.lock().sync_errors += 1;
        return true;
    }

    block.set_checksum_error();
    false
}

fn verify_tree_block(ctx: &ScrubCtx, block: &ScrubBlock) -> bool {
    let bytes = block_bytes(block);
    let head = block.head();
    match TreeHeader::parse(&bytes) {
        Ok(header) => {
            if header.bytenr != head.logical
                || header.fsid != ctx.volume.fsid
                || header.chunk_tree_uuid != ctx.volume.chunk_tree_uuid
            {
                block.set_header_error();
            } else if header.generation != head.generation {
                block.set_generation_error();
            }
        }
        Err(_) => block.set_header_error(),
    }

    let nodesize = ctx.geometry.nodesize() as usize;
    let Some(region) = bytes.get(CSUM_SLOT_SIZE..nodesize) else {
        block.set_checksum_error();
        return block.is_clean();
    };
    let computed: [u8; CSUM_SIZE] = crc32c::crc32c(region).to_le_bytes();
    if computed != stored_csum(&bytes) {
        block.set_checksum_error();
    }

    block.is_clean()
}

fn verify_super(ctx: &ScrubCtx, block: &ScrubBlock) {
    let bytes = block_bytes(block);
    let head = block.head();
    let mut fail_cor = 0_u32;
    let mut fail_gen = 0_u32;

    match SuperHeader::parse(&bytes) {
        Ok(header) => {
            if header.bytenr != head.logical || header.fsid != ctx.volume.fsid {
                fail_cor += 1;
            }
            if header.generation != head.generation {
                fail_gen += 1;
            }
        }
        Err(_) => fail_cor += 1,
    }

    let computed: [u8; CSUM_SIZE] =
        crc32c::crc32c(&bytes[CSUM_SLOT_SIZE..SUPER_INFO_SIZE as usize]).to_le_bytes();
    if computed != stored_csum(&bytes) {
        fail_cor += 1;
    }

    if fail_cor + fail_gen > 0 {
        ctx.stats.lock().super_errors += 1;
        if fail_cor > 0 {
            ctx.dev_stats.inc_corruption(ctx.dev.0);
        } else {
            ctx.dev_stats.inc_generation(ctx.dev.0);
        }
    }
}

/// Re-verify a recheck block after its pages were re-read page by page.
/// Expected csum and generation come from the original block; sticky flags
/// land on the recheck block.
pub fn recheck_checksum(
    ctx: &ScrubCtx,
    block: &ScrubBlock,
    is_metadata: bool,
    data_csum: Option<[u8; CSUM_SIZE]>,
    generation: Generation,
) {
    let bytes = block_bytes(block);
    let expected: [u8; CSUM_SIZE];
    let region: &[u8];

    if is_metadata {
        let Ok(header) = TreeHeader::parse(&bytes) else {
            block.set_header_error();
            return;
        };
        if block.head().logical != header.bytenr
            || header.fsid != ctx.volume.fsid
            || header.chunk_tree_uuid != ctx.volume.chunk_tree_uuid
        {
            block.set_header_error();
        } else if generation != header.generation {
            block.set_generation_error();
        }
        expected = stored_csum(&bytes);
        let Some(body) = bytes.get(CSUM_SLOT_SIZE..ctx.geometry.nodesize() as usize) else {
            block.set_checksum_error();
            return;
        };
        region = body;
    } else {
        let Some(csum) = data_csum else {
            return;
        };
        expected = csum;
        region = &bytes[..ctx.geometry.sectorsize() as usize];
    }

    let computed: [u8; CSUM_SIZE] = crc32c::crc32c(region).to_le_bytes();
    if computed != expected {
        block.set_checksum_error();
    }
}

/// Pop the checksum for `logical` from the walker's prefetched csum list.
///
/// Runs that fall entirely behind the cursor are discarded and counted; a
/// run is released once its last sector has been consumed.
#[must_use]
pub fn find_csum(
    list: &mut VecDeque<scour_layout::CsumRun>,
    discards: &mut u64,
    logical: Logical,
    sectorsize: u32,
) -> Option<[u8; CSUM_SIZE]> {
    loop {
        let front = list.front()?;
        if front.bytenr > logical {
            return None;
        }
        if front.end() > logical.0 {
            break;
        }
        *discards += 1;
        list.pop_front();
    }

    let front = list.front()?;
    let index = ((logical.0 - front.bytenr.0) / u64::from(sectorsize)) as usize;
    let csum = front.sums[index];
    if index == front.sums.len() - 1 {
        list.pop_front();
    }
    Some(csum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scour_layout::CsumRun;

    fn run(bytenr: u64, sectors: usize) -> CsumRun {
        CsumRun {
            bytenr: Logical(bytenr),
            sums: (0..sectors).map(|i| [i as u8, 0, 0, 0]).collect(),
        }
    }

    #[test]
    fn find_csum_hits_within_run() {
        let mut list = VecDeque::from([run(0, 4)]);
        let mut discards = 0;
        assert_eq!(
            find_csum(&mut list, &mut discards, Logical(8192), 4096),
            Some([2, 0, 0, 0])
        );
        // Mid-run hit keeps the run alive.
        assert_eq!(list.len(), 1);
        assert_eq!(discards, 0);
    }

    #[test]
    fn find_csum_releases_run_on_last_sector() {
        let mut list = VecDeque::from([run(0, 2)]);
        let mut discards = 0;
        assert!(find_csum(&mut list, &mut discards, Logical(4096), 4096).is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn find_csum_discards_stale_runs() {
        let mut list = VecDeque::from([run(0, 2), run(65536, 2)]);
        let mut discards = 0;
        assert_eq!(
            find_csum(&mut list, &mut discards, Logical(65536), 4096),
            Some([0, 0, 0, 0])
        );
        assert_eq!(discards, 1);
    }

    #[test]
    fn find_csum_misses_ahead_of_list() {
        let mut list = VecDeque::from([run(65536, 2)]);
        let mut discards = 0;
        assert_eq!(find_csum(&mut list, &mut discards, Logical(0), 4096), None);
        assert_eq!(list.len(), 1);
        assert_eq!(discards, 0);
    }

    #[test]
    fn find_csum_empty_list() {
        let mut list = VecDeque::new();
        let mut discards = 0;
        assert_eq!(find_csum(&mut list, &mut discards, Logical(0), 4096), None);
    }
}
