#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use clap::{Parser, Subcommand};
use scour_block::{ByteDevice, FileDevice};
use scour_engine::{FleetState, ScrubHooks, ScrubOptions, scrub_start};
use scour_layout::{Chunk, ExtentRecord, FileExtent, Volume};
use scour_types::{BgFlags, DevId, Generation, Logical, ScrubProgress, VolumeGeometry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ── Production Cx acquisition ───────────────────────────────────────────────

fn cli_cx() -> Cx {
    Cx::for_request()
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "scour", about = "Scour: adaptive data scrubber for mirrored volumes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a demo RAID1 volume: two image files plus a metadata manifest.
    Mkvol {
        /// Directory for the images and manifest.
        dir: PathBuf,
        /// Total data payload to commit, in MiB.
        #[arg(long, default_value_t = 4)]
        data_mib: u64,
    },
    /// Flip one byte in a device image (fault injection for demos).
    Corrupt {
        /// Path to the image file.
        image: PathBuf,
        /// Byte offset to corrupt.
        #[arg(long)]
        offset: u64,
    },
    /// Scrub one device of a volume.
    Scrub {
        /// Path to the volume manifest.
        manifest: PathBuf,
        /// Device id to scrub.
        #[arg(long, default_value_t = 1)]
        dev: u64,
        /// Wall-clock completion target in seconds (0 = no pacing).
        #[arg(long, default_value_t = 0)]
        deadline: u64,
        /// Pre-enumerate device extents to refine the byte target.
        #[arg(long)]
        enumerate: bool,
        /// Allow an I/O-priority boost when progress falls behind.
        #[arg(long)]
        boost: bool,
        /// Detect only, never repair.
        #[arg(long)]
        readonly: bool,
        /// Copy onto this replacement image instead of repairing in place.
        #[arg(long)]
        replace_target: Option<PathBuf>,
        /// Output the final statistics as JSON.
        #[arg(long)]
        json: bool,
    },
}

// ── Volume manifest ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDevice {
    id: u64,
    image: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestCsum {
    logical: u64,
    crc32c: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    path: String,
    extent: FileExtent,
}

/// Serialized commit-root snapshot accompanying the image files.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    sectorsize: u32,
    nodesize: u32,
    fsid: [u8; 16],
    chunk_tree_uuid: [u8; 16],
    generation: u64,
    devices: Vec<ManifestDevice>,
    chunks: Vec<Chunk>,
    extents: Vec<ExtentRecord>,
    csums: Vec<ManifestCsum>,
    files: Vec<ManifestFile>,
}

impl Manifest {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        serde_json::from_str(&text).context("parse manifest")
    }

    fn store(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize manifest")?;
        std::fs::write(path, text).with_context(|| format!("write manifest {}", path.display()))
    }

    /// Open the images and rebuild the in-memory volume snapshot.
    fn open_volume(&self, base: &Path) -> Result<Arc<Volume>> {
        let geometry = VolumeGeometry::new(self.sectorsize, self.nodesize)
            .map_err(|err| anyhow::anyhow!("bad geometry: {err}"))?;
        let mut volume = Volume::new(geometry, self.fsid, self.chunk_tree_uuid);
        volume.generation = Generation(self.generation);

        for dev in &self.devices {
            let path = if dev.image.is_absolute() {
                dev.image.clone()
            } else {
                base.join(&dev.image)
            };
            let handle = FileDevice::open(&path)
                .map_err(|err| anyhow::anyhow!("open image {}: {err}", path.display()))?;
            volume.add_device(DevId(dev.id), Arc::new(handle));
        }
        for chunk in &self.chunks {
            volume.add_chunk(chunk.clone());
        }
        {
            let mut extents = volume.extents.write();
            for ext in &self.extents {
                extents.insert(*ext);
            }
        }
        {
            let mut csums = volume.csums.write();
            for sum in &self.csums {
                csums.insert(Logical(sum.logical), sum.crc32c.to_le_bytes());
            }
        }
        {
            let mut files = volume.file_extents.write();
            for file in &self.files {
                files.insert(file.extent.clone(), &file.path);
            }
        }
        Ok(Arc::new(volume))
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkvol { dir, data_mib } => mkvol(&dir, data_mib),
        Command::Corrupt { image, offset } => corrupt(&image, offset),
        Command::Scrub {
            manifest,
            dev,
            deadline,
            enumerate,
            boost,
            readonly,
            replace_target,
            json,
        } => scrub_cmd(
            &manifest,
            dev,
            deadline,
            enumerate,
            boost,
            readonly,
            replace_target.as_deref(),
            json,
        ),
    }
}

const DEMO_DEV_BYTES: u64 = 32 * 1024 * 1024;
const DEMO_CHUNK_LOGICAL: u64 = 16 * 1024 * 1024;
const DEMO_DEV_OFFSET: u64 = 1024 * 1024;

fn mkvol(dir: &Path, data_mib: u64) -> Result<()> {
    use scour_layout::{ChunkStripe, RaidProfile, compute_data_csum};
    use scour_types::{PAGE_SIZE, Physical};

    if data_mib == 0 || data_mib > 8 {
        bail!("data size must be in 1..=8 MiB for the demo chunk");
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let cx = cli_cx();
    let geometry = VolumeGeometry::new(4096, 16384).expect("demo geometry");
    let fsid = *b"scour-demo-fsid!";
    let chunk_uuid = *b"scour-demo-chunk";
    let mut volume = Volume::new(geometry, fsid, chunk_uuid);
    volume.generation = Generation(1);

    let mut devices = Vec::new();
    for id in [1_u64, 2] {
        let path = dir.join(format!("dev{id}.img"));
        let file = std::fs::File::create(&path)?;
        file.set_len(DEMO_DEV_BYTES)?;
        drop(file);
        volume.add_device(DevId(id), Arc::new(FileDevice::open(&path)?));
        devices.push(ManifestDevice {
            id,
            image: PathBuf::from(format!("dev{id}.img")),
        });
    }

    let chunk = Chunk {
        logical: Logical(DEMO_CHUNK_LOGICAL),
        length: 8 * 1024 * 1024,
        profile: RaidProfile::Raid1,
        sub_stripes: 1,
        stripes: vec![
            ChunkStripe {
                dev: DevId(1),
                physical: Physical(DEMO_DEV_OFFSET),
            },
            ChunkStripe {
                dev: DevId(2),
                physical: Physical(DEMO_DEV_OFFSET),
            },
        ],
    };
    volume.add_chunk(chunk.clone());
    volume.commit_supers(&cx, Generation(1)).map_err(io_err)?;

    // Commit one data extent per MiB, each with a distinct fill byte, and
    // map them all to one demo file.
    let mut extents = Vec::new();
    let mut csums = Vec::new();
    let mut files = Vec::new();
    for i in 0..data_mib {
        let logical = DEMO_CHUNK_LOGICAL + i * 1024 * 1024;
        let payload = vec![0x40 + i as u8; 1024 * 1024];
        volume
            .commit_data_extent(&cx, Logical(logical), &payload, Generation(1), true)
            .map_err(io_err)?;
        extents.push(ExtentRecord {
            logical: Logical(logical),
            length: payload.len() as u64,
            flags: scour_types::ExtentFlags::DATA,
            generation: Generation(1),
        });
        for (s, sector) in payload.chunks(PAGE_SIZE as usize).enumerate() {
            csums.push(ManifestCsum {
                logical: logical + s as u64 * u64::from(PAGE_SIZE),
                crc32c: u32::from_le_bytes(compute_data_csum(sector)),
            });
        }
        files.push(ManifestFile {
            path: "/demo/payload.bin".to_owned(),
            extent: FileExtent {
                ino: scour_types::InodeNum(257),
                file_offset: i * 1024 * 1024,
                logical: Logical(logical),
                length: 1024 * 1024,
            },
        });
    }

    let manifest = Manifest {
        sectorsize: 4096,
        nodesize: 16384,
        fsid,
        chunk_tree_uuid: chunk_uuid,
        generation: 1,
        devices,
        chunks: vec![chunk],
        extents,
        csums,
        files,
    };
    manifest.store(&dir.join("volume.json"))?;
    println!(
        "created demo volume in {} ({} MiB data, RAID1 x2)",
        dir.display(),
        data_mib
    );
    Ok(())
}

fn corrupt(image: &Path, offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .with_context(|| format!("open {}", image.display()))?;
    let mut byte = [0_u8; 1];
    file.read_exact_at(&mut byte, offset)?;
    byte[0] ^= 0x01;
    file.write_all_at(&byte, offset)?;
    println!("flipped bit at {} in {}", offset, image.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn scrub_cmd(
    manifest_path: &Path,
    dev: u64,
    deadline: u64,
    enumerate: bool,
    boost: bool,
    readonly: bool,
    replace_target: Option<&Path>,
    json: bool,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let volume = manifest.open_volume(base)?;

    let mut bg_flags = BgFlags::default();
    if enumerate {
        bg_flags.0 |= BgFlags::ENUM.0;
    }
    if boost {
        bg_flags.0 |= BgFlags::BOOST.0;
    }

    let replace = replace_target
        .map(|path| -> Result<Arc<dyn ByteDevice>> {
            Ok(Arc::new(FileDevice::open(path).map_err(io_err)?))
        })
        .transpose()?;

    let opts = ScrubOptions {
        readonly,
        deadline_secs: deadline,
        bg_flags,
        replace_target: replace,
        ..ScrubOptions::default()
    };

    let fleet = FleetState::new();
    let handle = scrub_start(volume, fleet, DevId(dev), opts, ScrubHooks::default())
        .map_err(io_err)?;

    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(500));
        if !json {
            let p = handle.progress();
            eprintln!(
                "  ... {} bytes scrubbed, {} corrected, {} uncorrectable",
                p.bytes_scrubbed(),
                p.corrected_errors,
                p.uncorrectable_errors
            );
        }
    }
    let progress = handle.wait().map_err(io_err)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
    } else {
        print_progress(&progress);
    }
    if progress.uncorrectable_errors > 0 {
        bail!("{} uncorrectable errors remain", progress.uncorrectable_errors);
    }
    Ok(())
}

fn print_progress(p: &ScrubProgress) {
    println!("scrub finished");
    println!("  data:   {} extents, {} bytes ({} verified)", p.data_extents_scrubbed, p.data_bytes_scrubbed, p.data_bytes_verified);
    println!("  tree:   {} extents, {} bytes ({} verified)", p.tree_extents_scrubbed, p.tree_bytes_scrubbed, p.tree_bytes_verified);
    println!("  errors: {} read, {} csum, {} verify, {} super, {} sync", p.read_errors, p.csum_errors, p.verify_errors, p.super_errors, p.sync_errors);
    println!("  repair: {} corrected, {} uncorrectable, {} unverified", p.corrected_errors, p.uncorrectable_errors, p.unverified_errors);
    println!("  csums:  {} missing, {} discarded", p.no_csum, p.csum_discards);
    println!("  cursor: last physical {}", p.last_physical);
}

fn io_err(err: scour_error::ScrubError) -> anyhow::Error {
    anyhow::anyhow!("{err} (errno {})", err.to_errno())
}
