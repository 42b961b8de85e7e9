#![forbid(unsafe_code)]
//! Device seam for the scrubber.
//!
//! Provides the [`ByteDevice`] trait with `&Cx` capability context for
//! cooperative cancellation, a file-backed implementation, an in-memory
//! implementation with fault injection for tests, aligned page buffers, and
//! per-device error counters.

use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use scour_error::{Result, ScrubError};
use scour_types::{PAGE_SIZE, Physical};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

#[inline]
pub fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ScrubError::Cancelled)
}

// ── Aligned buffers ─────────────────────────────────────────────────────────

/// Owned byte buffer whose exposed slice starts at page alignment.
///
/// Stays fully safe by over-allocating and exposing an aligned subslice of
/// the backing storage.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `size` bytes aligned to the page size.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let alignment = PAGE_SIZE as usize;
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let storage = vec![0_u8; size + alignment - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    /// Allocate one page.
    #[must_use]
    pub fn page() -> Self {
        Self::new(PAGE_SIZE as usize)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.start + self.len);
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the whole buffer with zeros.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedBuf {}

// ── Device trait ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: Physical, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: Physical, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;

    /// Best-effort hint that `[offset, offset + len)` will be read soon.
    /// Default is a no-op.
    fn readahead(&self, _offset: Physical, _len: u64) {}
}

fn check_bounds(op: &str, offset: Physical, len: usize, total: u64) -> Result<()> {
    let end = offset
        .0
        .checked_add(len as u64)
        .ok_or_else(|| ScrubError::Format(format!("{op} range overflows u64")))?;
    if end > total {
        return Err(ScrubError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={total}"
        )));
    }
    Ok(())
}

// ── File device ─────────────────────────────────────────────────────────────

/// File-backed device using `pread`/`pwrite` style positional I/O.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileDevice {
    /// Open read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: Physical, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_bounds("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: Physical, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(ScrubError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        check_bounds("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Memory device with fault injection ──────────────────────────────────────

/// Direction a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct Fault {
    start: u64,
    len: u64,
    kind: FaultKind,
    /// Remaining trips; `None` means the fault is sticky.
    remaining: Option<u32>,
}

impl Fault {
    fn overlaps(&self, offset: u64, len: u64, kind: FaultKind) -> bool {
        self.kind == kind && offset < self.start + self.len && self.start < offset + len
    }
}

/// In-memory device with injectable per-range I/O faults.
///
/// Every read or write that touches a faulted range fails with an I/O error;
/// n-shot faults decrement and disappear, sticky faults persist. A
/// successful write heals read faults over the written range, the way a
/// rewrite remaps a bad sector.
#[derive(Debug)]
pub struct MemDevice {
    bytes: RwLock<Vec<u8>>,
    faults: Mutex<Vec<Fault>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            bytes: RwLock::new(vec![0_u8; usize::try_from(len).expect("device fits memory")]),
            faults: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Install a sticky fault over `[start, start + len)`.
    pub fn inject_fault(&self, start: u64, len: u64, kind: FaultKind) {
        self.faults.lock().push(Fault {
            start,
            len,
            kind,
            remaining: None,
        });
    }

    /// Install a fault that trips at most `shots` times.
    pub fn inject_fault_n(&self, start: u64, len: u64, kind: FaultKind, shots: u32) {
        self.faults.lock().push(Fault {
            start,
            len,
            kind,
            remaining: Some(shots),
        });
    }

    /// Remove all faults overlapping `[start, start + len)`.
    pub fn clear_faults(&self, start: u64, len: u64) {
        self.faults
            .lock()
            .retain(|f| !(start < f.start + f.len && f.start < start + len));
    }

    /// Overwrite raw content, bypassing fault checks. Test setup only.
    pub fn patch(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.write();
        let offset = usize::try_from(offset).expect("offset fits usize");
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Flip one bit, bypassing fault checks. Test setup only.
    pub fn flip_bit(&self, offset: u64) {
        let mut bytes = self.bytes.write();
        let offset = usize::try_from(offset).expect("offset fits usize");
        bytes[offset] ^= 0x01;
    }

    /// Raw snapshot of `[offset, offset + len)`, bypassing fault checks.
    #[must_use]
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.read();
        let offset = usize::try_from(offset).expect("offset fits usize");
        bytes[offset..offset + len].to_vec()
    }

    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn trip_fault(&self, offset: u64, len: u64, kind: FaultKind) -> bool {
        let mut faults = self.faults.lock();
        let mut tripped = false;
        for fault in faults.iter_mut() {
            if fault.overlaps(offset, len, kind) {
                match &mut fault.remaining {
                    Some(0) => continue,
                    Some(n) => {
                        *n -= 1;
                        tripped = true;
                    }
                    None => tripped = true,
                }
                break;
            }
        }
        faults.retain(|f| f.remaining != Some(0));
        tripped
    }
}

impl ByteDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read_exact_at(&self, cx: &Cx, offset: Physical, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_bounds("read", offset, buf.len(), self.len_bytes())?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.trip_fault(offset.0, buf.len() as u64, FaultKind::Read) {
            trace!(event = "injected_read_fault", offset = offset.0, len = buf.len());
            return Err(ScrubError::Io(std::io::Error::other(format!(
                "injected read fault at {offset}"
            ))));
        }
        let bytes = self.bytes.read();
        let start = usize::try_from(offset.0).expect("offset fits usize");
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: Physical, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_bounds("write", offset, buf.len(), self.len_bytes())?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.trip_fault(offset.0, buf.len() as u64, FaultKind::Write) {
            trace!(event = "injected_write_fault", offset = offset.0, len = buf.len());
            return Err(ScrubError::Io(std::io::Error::other(format!(
                "injected write fault at {offset}"
            ))));
        }
        let mut bytes = self.bytes.write();
        let start = usize::try_from(offset.0).expect("offset fits usize");
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        // Rewriting a range remaps it: pending read faults there are gone.
        let end = offset.0 + buf.len() as u64;
        self.faults
            .lock()
            .retain(|f| !(f.kind == FaultKind::Read && offset.0 < f.start + f.len && f.start < end));
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

// ── Per-device error counters ───────────────────────────────────────────────

/// Monotonic per-device error counters, bumped alongside the scrub progress
/// record and logged on every bump.
#[derive(Debug, Default)]
pub struct DeviceErrorStats {
    read_errs: AtomicU64,
    corruption_errs: AtomicU64,
    generation_errs: AtomicU64,
    write_errs: AtomicU64,
}

impl DeviceErrorStats {
    pub fn inc_read(&self, dev: u64) {
        let n = self.read_errs.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(event = "dev_stat", dev, kind = "read", total = n);
    }

    pub fn inc_corruption(&self, dev: u64) {
        let n = self.corruption_errs.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(event = "dev_stat", dev, kind = "corruption", total = n);
    }

    pub fn inc_generation(&self, dev: u64) {
        let n = self.generation_errs.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(event = "dev_stat", dev, kind = "generation", total = n);
    }

    pub fn inc_write(&self, dev: u64) {
        let n = self.write_errs.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(event = "dev_stat", dev, kind = "write", total = n);
    }

    #[must_use]
    pub fn read_errs(&self) -> u64 {
        self.read_errs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn corruption_errs(&self) -> u64 {
        self.corruption_errs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn generation_errs(&self) -> u64 {
        self.generation_errs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_errs(&self) -> u64 {
        self.write_errs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    #[test]
    fn aligned_buf_is_page_aligned() {
        let buf = AlignedBuf::page();
        assert_eq!(buf.len(), PAGE_SIZE as usize);
        assert_eq!(buf.as_slice().as_ptr() as usize % PAGE_SIZE as usize, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_buf_zero_clears_content() {
        let mut buf = AlignedBuf::new(128);
        buf.as_mut_slice().fill(0xAB);
        buf.zero();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn mem_device_round_trips() {
        let cx = test_cx();
        let dev = MemDevice::new(64 * 1024);
        let payload = vec![0x5A_u8; 4096];
        dev.write_all_at(&cx, Physical(8192), &payload).unwrap();

        let mut out = vec![0_u8; 4096];
        dev.read_exact_at(&cx, Physical(8192), &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let cx = test_cx();
        let dev = MemDevice::new(4096);
        let mut buf = vec![0_u8; 4096];
        assert!(dev.read_exact_at(&cx, Physical(1), &mut buf).is_err());
        assert!(dev.write_all_at(&cx, Physical(4096), &buf[..1]).is_err());
    }

    #[test]
    fn sticky_fault_trips_every_time() {
        let cx = test_cx();
        let dev = MemDevice::new(64 * 1024);
        dev.inject_fault(4096, 4096, FaultKind::Read);

        let mut buf = vec![0_u8; 4096];
        assert!(dev.read_exact_at(&cx, Physical(4096), &mut buf).is_err());
        assert!(dev.read_exact_at(&cx, Physical(4096), &mut buf).is_err());
        // Adjacent range is unaffected.
        assert!(dev.read_exact_at(&cx, Physical(8192), &mut buf).is_ok());
        // Overlapping multi-page read also trips.
        let mut big = vec![0_u8; 8192];
        assert!(dev.read_exact_at(&cx, Physical(0), &mut big).is_err());
    }

    #[test]
    fn n_shot_fault_expires() {
        let cx = test_cx();
        let dev = MemDevice::new(16 * 1024);
        dev.inject_fault_n(0, 4096, FaultKind::Read, 2);

        let mut buf = vec![0_u8; 4096];
        assert!(dev.read_exact_at(&cx, Physical(0), &mut buf).is_err());
        assert!(dev.read_exact_at(&cx, Physical(0), &mut buf).is_err());
        assert!(dev.read_exact_at(&cx, Physical(0), &mut buf).is_ok());
    }

    #[test]
    fn successful_write_heals_read_fault() {
        let cx = test_cx();
        let dev = MemDevice::new(16 * 1024);
        dev.inject_fault(0, 4096, FaultKind::Read);

        let mut buf = vec![0_u8; 4096];
        assert!(dev.read_exact_at(&cx, Physical(0), &mut buf).is_err());
        dev.write_all_at(&cx, Physical(0), &[9_u8; 4096]).unwrap();
        assert!(dev.read_exact_at(&cx, Physical(0), &mut buf).is_ok());
        assert_eq!(buf, vec![9_u8; 4096]);
    }

    #[test]
    fn clear_faults_restores_range() {
        let cx = test_cx();
        let dev = MemDevice::new(16 * 1024);
        dev.inject_fault(0, 4096, FaultKind::Write);

        assert!(dev.write_all_at(&cx, Physical(0), &[1_u8; 4096]).is_err());
        dev.clear_faults(0, 4096);
        assert!(dev.write_all_at(&cx, Physical(0), &[1_u8; 4096]).is_ok());
    }

    #[test]
    fn patch_and_flip_bypass_faults() {
        let dev = MemDevice::new(8192);
        dev.inject_fault(0, 8192, FaultKind::Write);
        dev.patch(100, &[0xFF, 0xFE]);
        dev.flip_bit(100);
        assert_eq!(dev.snapshot(100, 2), vec![0xFE, 0xFE]);
    }

    #[test]
    fn file_device_round_trips() {
        let cx = test_cx();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(64 * 1024).unwrap();

        let dev = FileDevice::open(tmp.path()).unwrap();
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 64 * 1024);

        dev.write_all_at(&cx, Physical(4096), &[0x7E_u8; 4096]).unwrap();
        let mut out = vec![0_u8; 4096];
        dev.read_exact_at(&cx, Physical(4096), &mut out).unwrap();
        assert_eq!(out, vec![0x7E_u8; 4096]);
    }

    #[test]
    fn device_error_stats_count() {
        let stats = DeviceErrorStats::default();
        stats.inc_read(1);
        stats.inc_read(1);
        stats.inc_corruption(1);
        stats.inc_generation(1);
        stats.inc_write(1);
        assert_eq!(stats.read_errs(), 2);
        assert_eq!(stats.corruption_errs(), 1);
        assert_eq!(stats.generation_errs(), 1);
        assert_eq!(stats.write_errs(), 1);
    }
}
