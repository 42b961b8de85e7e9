//! Replace-mode copies and synergistic skipping, end to end.

use asupersync::Cx;
use scour_block::{ByteDevice, FaultKind, MemDevice};
use scour_engine::{FleetState, ScrubHooks, ScrubOptions, SynergyConfig, scrub_device};
use scour_layout::{Chunk, ChunkStripe, FileExtent, RaidProfile, Volume};
use scour_synergy::{EventKind, EventMask, Observer, PageEvent};
use scour_types::{
    DevId, Generation, InodeNum, Logical, PAGE_SIZE, Physical, ScrubProgress, VolumeGeometry,
};
use std::sync::Arc;

const DEV_BYTES: u64 = 16 * 1024 * 1024;
const CHUNK_LOGICAL: u64 = 16 * 1024 * 1024;
const DEV1_OFFSET: u64 = 1024 * 1024;
const DEV2_OFFSET: u64 = 2 * 1024 * 1024;

struct TestVolume {
    volume: Arc<Volume>,
    dev1: Arc<MemDevice>,
    dev2: Arc<MemDevice>,
}

fn raid1(chunk_len: u64) -> TestVolume {
    let cx = Cx::for_testing();
    let dev1 = Arc::new(MemDevice::new(DEV_BYTES));
    let dev2 = Arc::new(MemDevice::new(DEV_BYTES));
    let mut volume = Volume::new(
        VolumeGeometry::new(4096, 16384).unwrap(),
        [0xAA; 16],
        [0xBB; 16],
    );
    volume.add_device(DevId(1), Arc::<MemDevice>::clone(&dev1));
    volume.add_device(DevId(2), Arc::<MemDevice>::clone(&dev2));
    volume.add_chunk(Chunk {
        logical: Logical(CHUNK_LOGICAL),
        length: chunk_len,
        profile: RaidProfile::Raid1,
        sub_stripes: 1,
        stripes: vec![
            ChunkStripe {
                dev: DevId(1),
                physical: Physical(DEV1_OFFSET),
            },
            ChunkStripe {
                dev: DevId(2),
                physical: Physical(DEV2_OFFSET),
            },
        ],
    });
    volume.commit_supers(&cx, Generation(1)).unwrap();
    TestVolume {
        volume: Arc::new(volume),
        dev1,
        dev2,
    }
}

fn commit_data(tv: &TestVolume, logical: u64, payload: &[u8], with_csums: bool) {
    let cx = Cx::for_testing();
    tv.volume
        .commit_data_extent(&cx, Logical(logical), payload, Generation(1), with_csums)
        .unwrap();
}

fn phys1(logical: u64) -> u64 {
    DEV1_OFFSET + (logical - CHUNK_LOGICAL)
}

fn run(
    tv: &TestVolume,
    dev: u64,
    opts: ScrubOptions,
    hooks: ScrubHooks,
) -> scour_error::Result<ScrubProgress> {
    let cx = Cx::for_testing();
    scrub_device(
        &cx,
        Arc::clone(&tv.volume),
        FleetState::new(),
        DevId(dev),
        &opts,
        hooks,
    )
}

// ── Replace mode ────────────────────────────────────────────────────────────

#[test]
fn replace_copies_clean_data_to_target() {
    let tv = raid1(1024 * 1024);
    let logical = CHUNK_LOGICAL;
    let payload = vec![0x9D_u8; 256 * 1024];
    commit_data(&tv, logical, &payload, true);

    let target = Arc::new(MemDevice::new(DEV_BYTES));
    let opts = ScrubOptions {
        replace_target: Some(Arc::<MemDevice>::clone(&target) as Arc<dyn ByteDevice>),
        ..ScrubOptions::default()
    };
    let progress = run(&tv, 1, opts, ScrubHooks::default()).unwrap();

    assert_eq!(progress.data_bytes_scrubbed, 256 * 1024);
    assert!(progress.is_clean());
    // The target carries the data at the source's physical layout.
    assert_eq!(target.snapshot(phys1(logical), 256 * 1024), payload);
    // Supers are not part of the copy; the region stays zeroed.
    assert_eq!(target.snapshot(64 * 1024, 4096), vec![0_u8; 4096]);
}

#[test]
fn replace_sources_corrupt_pages_from_the_good_mirror() {
    let tv = raid1(1024 * 1024);
    let logical = CHUNK_LOGICAL + 64 * 1024;
    let payload = vec![0x6E_u8; 16 * 1024];
    commit_data(&tv, logical, &payload, true);
    tv.dev1.flip_bit(phys1(logical) + 4096);

    let target = Arc::new(MemDevice::new(DEV_BYTES));
    let opts = ScrubOptions {
        replace_target: Some(Arc::<MemDevice>::clone(&target) as Arc<dyn ByteDevice>),
        ..ScrubOptions::default()
    };
    let progress = run(&tv, 1, opts, ScrubHooks::default()).unwrap();

    assert_eq!(progress.csum_errors, 1);
    assert_eq!(progress.corrected_errors, 1);
    assert_eq!(progress.uncorrectable_errors, 0);
    // Target got the good copy; the source mirror is left as-is.
    assert_eq!(target.snapshot(phys1(logical), 16 * 1024), payload);
    assert_ne!(tv.dev1.snapshot(phys1(logical), 16 * 1024), payload);
}

#[test]
fn replace_copies_nocsum_data_through_the_nocow_worker() {
    let tv = raid1(1024 * 1024);
    let logical = CHUNK_LOGICAL + 128 * 1024;
    let payload = vec![0x4B_u8; 32 * 1024];
    commit_data(&tv, logical, &payload, false);

    let target = Arc::new(MemDevice::new(DEV_BYTES));
    let opts = ScrubOptions {
        replace_target: Some(Arc::<MemDevice>::clone(&target) as Arc<dyn ByteDevice>),
        ..ScrubOptions::default()
    };
    let progress = run(&tv, 1, opts, ScrubHooks::default()).unwrap();

    assert!(progress.no_csum >= 1);
    assert_eq!(progress.uncorrectable_errors, 0);
    assert_eq!(target.snapshot(phys1(logical), 32 * 1024), payload);
}

#[test]
fn replace_writes_zeros_when_no_mirror_has_the_page() {
    let tv = raid1(1024 * 1024);
    let logical = CHUNK_LOGICAL;
    commit_data(&tv, logical, &vec![0x13_u8; 4096], true);
    tv.dev1.inject_fault(phys1(logical), 4096, FaultKind::Read);
    tv.dev2
        .inject_fault(DEV2_OFFSET + (logical - CHUNK_LOGICAL), 4096, FaultKind::Read);

    let target = Arc::new(MemDevice::new(DEV_BYTES));
    let opts = ScrubOptions {
        replace_target: Some(Arc::<MemDevice>::clone(&target) as Arc<dyn ByteDevice>),
        ..ScrubOptions::default()
    };
    let progress = run(&tv, 1, opts, ScrubHooks::default()).unwrap();

    assert_eq!(progress.uncorrectable_errors, 1);
    assert_eq!(target.snapshot(phys1(logical), 4096), vec![0_u8; 4096]);
}

// ── Synergistic mode ────────────────────────────────────────────────────────

struct SynergySetup {
    observer: Arc<Observer>,
    task: scour_synergy::TaskId,
}

fn synergy_setup() -> SynergySetup {
    let observer = Arc::new(Observer::new());
    let task = observer
        .register(
            "scour-scrub",
            EventMask(EventMask::ADD.0 | EventMask::MOD.0),
            u64::from(PAGE_SIZE),
        )
        .unwrap();
    SynergySetup { observer, task }
}

fn synergy_hooks(setup: &SynergySetup) -> ScrubHooks {
    ScrubHooks {
        synergy: Some(SynergyConfig {
            observer: Arc::clone(&setup.observer),
            dev_start: 0,
            task: Some(setup.task),
        }),
        ..ScrubHooks::default()
    }
}

/// Map `[logical, logical + len)` to a file so observer events resolve.
fn map_file(tv: &TestVolume, ino: u64, logical: u64, len: u64) {
    tv.volume.file_extents.write().insert(
        FileExtent {
            ino: InodeNum(ino),
            file_offset: 0,
            logical: Logical(logical),
            length: len,
        },
        "/data/hot.bin",
    );
}

fn publish_pages(setup: &SynergySetup, ino: u64, pages: std::ops::Range<u64>, kind: EventKind) {
    for page_index in pages {
        setup.observer.publish(PageEvent {
            ino: InodeNum(ino),
            page_index,
            kind,
        });
    }
}

#[test]
fn foreground_validated_range_is_skipped() {
    let tv = raid1(2 * 1024 * 1024);
    let hot = CHUNK_LOGICAL;
    let cold = CHUNK_LOGICAL + 1024 * 1024;
    commit_data(&tv, hot, &vec![0x70_u8; 1024 * 1024], true);
    commit_data(&tv, cold, &vec![0x71_u8; 1024 * 1024], true);
    map_file(&tv, 300, hot, 1024 * 1024);

    let setup = synergy_setup();
    // The foreground read the hot file in: every page validated.
    publish_pages(&setup, 300, 0..256, EventKind::Added);

    let progress = run(&tv, 1, ScrubOptions::default(), synergy_hooks(&setup)).unwrap();
    // Both extents count as scrubbed, but only the cold one was read.
    assert_eq!(progress.data_bytes_scrubbed, 2 * 1024 * 1024);
    assert_eq!(progress.data_bytes_verified, 1024 * 1024);
    assert!(progress.is_clean());
}

#[test]
fn modified_range_is_read_again() {
    let tv = raid1(2 * 1024 * 1024);
    let hot = CHUNK_LOGICAL;
    commit_data(&tv, hot, &vec![0x72_u8; 1024 * 1024], true);
    map_file(&tv, 301, hot, 1024 * 1024);

    let setup = synergy_setup();
    publish_pages(&setup, 301, 0..256, EventKind::Added);

    let first = run(&tv, 1, ScrubOptions::default(), synergy_hooks(&setup)).unwrap();
    assert_eq!(first.data_bytes_verified, 0);
    assert_eq!(first.data_bytes_scrubbed, 1024 * 1024);

    // The cache diverged from disk: every page modified. The next pass
    // must read the range again.
    publish_pages(&setup, 301, 0..256, EventKind::Modified);

    let second = run(&tv, 1, ScrubOptions::default(), synergy_hooks(&setup)).unwrap();
    assert_eq!(second.data_bytes_verified, 1024 * 1024);
    assert!(second.is_clean());
}

#[test]
fn partial_modification_re_reads_only_that_extent_portion() {
    let tv = raid1(1024 * 1024);
    let hot = CHUNK_LOGICAL;
    commit_data(&tv, hot, &vec![0x73_u8; 1024 * 1024], true);
    map_file(&tv, 302, hot, 1024 * 1024);

    let setup = synergy_setup();
    publish_pages(&setup, 302, 0..256, EventKind::Added);
    // One page in the middle diverges.
    publish_pages(&setup, 302, 100..101, EventKind::Modified);

    let progress = run(&tv, 1, ScrubOptions::default(), synergy_hooks(&setup)).unwrap();
    // The stripe holding page 100 fails the whole-range check; block-level
    // checks still skip its untouched blocks, so exactly one block is read.
    assert_eq!(progress.data_bytes_verified, 4096);
    assert_eq!(progress.data_bytes_scrubbed, 1024 * 1024);
    assert!(progress.is_clean());
}

#[test]
fn replace_mode_ignores_the_filter() {
    let tv = raid1(1024 * 1024);
    let hot = CHUNK_LOGICAL;
    let payload = vec![0x74_u8; 256 * 1024];
    commit_data(&tv, hot, &payload, true);
    map_file(&tv, 303, hot, 256 * 1024);

    let setup = synergy_setup();
    publish_pages(&setup, 303, 0..64, EventKind::Added);

    let target = Arc::new(MemDevice::new(DEV_BYTES));
    let opts = ScrubOptions {
        replace_target: Some(Arc::<MemDevice>::clone(&target) as Arc<dyn ByteDevice>),
        ..ScrubOptions::default()
    };
    let progress = run(&tv, 1, opts, synergy_hooks(&setup)).unwrap();

    // Every byte still lands on the target: skipping would leave holes.
    assert_eq!(progress.data_bytes_verified, 256 * 1024);
    assert_eq!(target.snapshot(phys1(hot), 256 * 1024), payload);
}
