use std::fmt::Debug;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, warn};

/// Backing memory of a log buffer: three terms followed by the metadata.
///
/// Both in-process and file-backed logs implement this trait. The memory
/// must stay valid, at the same address, for the lifetime of the value and
/// must be aligned to at least 8 bytes so the tail counters can be accessed
/// atomically.
pub trait RawLog: Send + Sync + Debug {
    /// Start of the region.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Length of the region in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A heap-allocated log for single-process use.
///
/// The memory is owned by a boxed slice of `u64`, which gives the 8-byte
/// alignment the atomic counters need. It starts zeroed.
#[derive(Debug)]
pub struct HeapRawLog {
    /// Owns the memory; freed when the log is dropped.
    _boxed: Box<[u64]>,
    /// Points at the first byte of `_boxed`.
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HeapRawLog {}
unsafe impl Sync for HeapRawLog {}

impl HeapRawLog {
    /// Allocates a zeroed log of `len` bytes, rounded up to a multiple of 8.
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(8);
        let mut boxed = vec![0u64; words].into_boxed_slice();
        let ptr = unsafe { NonNull::new_unchecked(boxed.as_mut_ptr() as *mut u8) };
        Self {
            _boxed: boxed,
            ptr,
            len: words * 8,
        }
    }
}

impl RawLog for HeapRawLog {
    #[inline(always)]
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }
}

/// A log backed by a memory-mapped file, shared with other processes.
///
/// The mapping is released when the value is dropped, or earlier with
/// [`MappedRawLog::close`]. Placing the file under `/dev/shm` keeps it in
/// memory on Linux.
#[derive(Debug)]
pub struct MappedRawLog {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    mapped: bool,
}

unsafe impl Send for MappedRawLog {}
unsafe impl Sync for MappedRawLog {}

impl MappedRawLog {
    /// Creates (or truncates) the file at `path`, sizes it to `len` bytes and
    /// maps it. The new file reads as zeros.
    pub fn create(path: impl AsRef<Path>, len: usize) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let ptr = map_shared(file.as_raw_fd(), len)?;
        debug!(path = %path.display(), len, "created raw log");
        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
            mapped: true,
        })
    }

    /// Maps an existing log file in full.
    ///
    /// With `pre_touch`, every page is touched once so page faults happen
    /// here rather than on the first appends.
    pub fn map_existing(path: impl AsRef<Path>, pre_touch: bool) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "log file too large")
        })?;
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("log file is empty: {}", path.display()),
            ));
        }
        let ptr = map_shared(file.as_raw_fd(), len)?;
        let log = Self {
            ptr,
            len,
            path: path.to_path_buf(),
            mapped: true,
        };
        if pre_touch {
            log.pre_touch();
        }
        debug!(path = %path.display(), len, pre_touch, "mapped existing raw log");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmaps the log, reporting any failure instead of logging it.
    pub fn close(mut self) -> std::io::Result<()> {
        self.mapped = false;
        unsafe { unmap_shared(self.ptr, self.len) }
    }

    /// Touches each page with a CAS of 0 to 0, which faults the page in
    /// without altering data already present.
    fn pre_touch(&self) {
        let page_size = page_size();
        let mut offset = 0;
        while offset < self.len {
            let word = unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicI32) };
            let _ = word.compare_exchange(0, 0, Ordering::AcqRel, Ordering::Relaxed);
            offset += page_size;
        }
    }
}

impl RawLog for MappedRawLog {
    #[inline(always)]
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedRawLog {
    /// Unmaps the file if [`MappedRawLog::close`] has not already done so.
    ///
    /// Failure is logged rather than panicking: the mapping may be shared with
    /// other processes and a panic in drop would abort the producer.
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        match unsafe { unmap_shared(self.ptr, self.len) } {
            Ok(()) => debug!(path = %self.path.display(), "unmapped raw log"),
            Err(err) => warn!(path = %self.path.display(), %err, "failed to unmap raw log"),
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn map_shared(fd: libc::c_int, len: usize) -> std::io::Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    // The mapping stays valid after the file descriptor is closed.
    NonNull::new(addr as *mut u8)
        .ok_or_else(|| std::io::Error::other("mmap returned a null address"))
}

unsafe fn unmap_shared(ptr: NonNull<u8>, len: usize) -> std::io::Result<()> {
    unsafe {
        if libc::munmap(ptr.as_ptr().cast(), len) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
