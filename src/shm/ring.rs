// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A lock-free SPSC byte ring in named POSIX shared memory, with the data
//! region mapped twice at adjacent virtual addresses.
//!
//! Layout of the shm object:
//!
//! ```text
//! [ header page: magic, sizes, atomic indices, pshared mutex+condvar ]
//! [ data region: ring_window bytes, page-aligned start               ]
//! ```
//!
//! The data region is mapped twice in a row over one reserved virtual
//! range, so for any index `i < ring_window` the bytes
//! `[base+i, base+i+ring_window)` are contiguous — records never split,
//! every read and write is a single `memcpy` (or none at all on the
//! zero-copy path).
//!
//! Record format: `[u32 size][size bytes payload]`. One byte of the ring
//! stays unused so `write_idx == read_idx` always means "empty".
//!
//! Atomic discipline: the producer publishes `write_idx` with release and
//! the consumer `read_idx` with release; counterpart loads are acquire.
//! The process-shared pthread mutex/condvar in the header exists solely for
//! the blocking wait in [`RingBuffer::wait_readable`] — the fast path never
//! touches it.

use std::{
    num::NonZeroUsize,
    os::fd::OwnedFd,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use nix::{
    fcntl::OFlag,
    sys::{
        mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap, shm_open, shm_unlink},
        stat::Mode,
    },
    unistd::ftruncate,
};
use tracing::{debug, error, warn};

const RING_MAGIC: u32 = 0x6e70_7262; // "nprb"

/// Upper bound for one record's payload, mirroring the frame cap.
pub const MAX_RECORD_SIZE: u32 = crate::wire::header::MAX_MESSAGE_SIZE;

#[repr(C)]
struct RingHeader {
    magic: AtomicU32,
    _pad0: u32,
    ring_window: u64,
    max_record_size: u32,
    _pad1: u32,
    write_idx: AtomicU64,
    read_idx: AtomicU64,
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

/// An uncommitted claim on a contiguous window of the send side.
///
/// Dropping it without [`RingBuffer::commit_write`] abandons the claim:
/// `write_idx` was never advanced, so the space stays logically free.
#[derive(Debug)]
pub struct WriteReservation {
    pub data: *mut u8,
    /// Full contiguous space available, not just what was asked for.
    pub max_size: usize,
    pub write_idx: u64,
}

/// An in-place view of the next unread record.
#[derive(Debug)]
pub struct ReadView {
    pub data: *const u8,
    pub size: usize,
    /// Read index to publish once the record has been consumed.
    pub read_idx: u64,
}

pub struct RingBuffer {
    name: String,
    header: NonNull<RingHeader>,
    header_len: usize,
    data: NonNull<u8>,
    ring_window: usize,
    is_creator: bool,
}

// The ring is shared between one producer and one consumer; all cross-side
// publication goes through the atomics in the header.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

fn page_size() -> usize {
    // Always 4096 on the targets we care about; ask the OS anyway.
    unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl RingBuffer {
    /// Creates a named ring with at least `capacity` usable bytes. The
    /// creator removes the shm object on drop.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let page = page_size();
        let ring_window = round_up(capacity.max(page), page);
        let total = page + ring_window;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .with_context(|| format!("shm_open(create) failed for {name}"))?;

        if let Err(e) = ftruncate(&fd, total as libc::off_t) {
            let _ = shm_unlink(name);
            bail!("ftruncate failed for {name}: {e}");
        }

        let ring = match Self::map(name, &fd, ring_window, true) {
            Ok(ring) => ring,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            },
        };

        unsafe {
            let hdr = ring.header.as_ptr();
            (*hdr).ring_window = ring_window as u64;
            (*hdr).max_record_size = MAX_RECORD_SIZE;
            (*hdr).write_idx = AtomicU64::new(0);
            (*hdr).read_idx = AtomicU64::new(0);
            init_pshared_sync(hdr)?;
            // Publish the fully initialized header.
            (*hdr).magic.store(RING_MAGIC, Ordering::Release);
        }

        debug!(name, ring_window, "ring buffer created");
        Ok(ring)
    }

    /// Opens an existing ring by name. The opener unmaps on drop but never
    /// removes the object.
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .with_context(|| format!("shm_open failed for {name}"))?;

        // Map one page to learn the geometry, then the real thing.
        let page = page_size();
        let probe = unsafe {
            mmap(
                None,
                NonZeroUsize::new(page).expect("page size is non-zero"),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .with_context(|| format!("header probe mmap failed for {name}"))?
        };
        let (magic, ring_window) = unsafe {
            let hdr = probe.as_ptr() as *const RingHeader;
            (
                (*hdr).magic.load(Ordering::Acquire),
                (*hdr).ring_window as usize,
            )
        };
        unsafe {
            let _ = munmap(probe, page);
        }

        if magic != RING_MAGIC {
            bail!("ring {name} is not initialized");
        }

        let ring = Self::map(name, &fd, ring_window, false)?;
        debug!(name, ring_window, "ring buffer opened");
        Ok(ring)
    }

    /// Removes a possibly stale shm object, e.g. one left by a crashed
    /// server.
    pub fn remove(name: &str) {
        let _ = shm_unlink(name);
    }

    /// Maps the header page and the double-mapped data region.
    fn map(name: &str, fd: &OwnedFd, ring_window: usize, is_creator: bool) -> Result<Self> {
        let page = page_size();

        let header = unsafe {
            mmap(
                None,
                NonZeroUsize::new(page).expect("page size is non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .with_context(|| format!("header mmap failed for {name}"))?
        };

        // Reserve 2× the window, then pin both mirrors over it.
        let reserved = unsafe {
            match mmap_anonymous(
                None,
                NonZeroUsize::new(2 * ring_window).expect("window is non-zero"),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            ) {
                Ok(p) => p,
                Err(e) => {
                    let _ = munmap(header, page);
                    bail!("failed to reserve mirror space for {name}: {e}");
                },
            }
        };

        let mut cleanup = || unsafe {
            let _ = munmap(reserved, 2 * ring_window);
            let _ = munmap(header, page);
        };

        for half in 0..2usize {
            let addr = reserved.as_ptr() as usize + half * ring_window;
            let mapped = unsafe {
                mmap(
                    NonZeroUsize::new(addr),
                    NonZeroUsize::new(ring_window).expect("window is non-zero"),
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                    fd,
                    page as libc::off_t,
                )
            };
            match mapped {
                Ok(p) if p.as_ptr() as usize == addr => {},
                Ok(_) | Err(_) => {
                    cleanup();
                    bail!("mirror mapping failed for {name}");
                },
            }
        }

        Ok(Self {
            name: name.to_string(),
            header: header.cast(),
            header_len: page,
            data: reserved.cast(),
            ring_window,
            is_creator,
        })
    }

    #[inline]
    fn hdr(&self) -> &RingHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn ring_window(&self) -> usize {
        self.ring_window
    }

    pub fn used_bytes(&self) -> usize {
        let write = self.hdr().write_idx.load(Ordering::Acquire) as usize;
        let read = self.hdr().read_idx.load(Ordering::Acquire) as usize;
        if write >= read {
            write - read
        } else {
            self.ring_window - read + write
        }
    }

    /// Bytes writable right now; one byte stays reserved so a full ring is
    /// distinguishable from an empty one.
    pub fn available_bytes(&self) -> usize {
        self.ring_window - self.used_bytes() - 1
    }

    pub fn is_empty(&self) -> bool {
        let write = self.hdr().write_idx.load(Ordering::Acquire);
        let read = self.hdr().read_idx.load(Ordering::Acquire);
        write == read
    }

    // ── copy API ─────────────────────────────────────────────────────────

    /// Appends one record; `false` when the ring lacks space.
    pub fn try_write(&self, data: &[u8]) -> bool {
        let size = data.len();
        if size as u64 > self.hdr().max_record_size as u64 {
            warn!(size, "record exceeds ring maximum");
            return false;
        }
        if size_of::<u32>() + size > self.available_bytes() {
            return false;
        }

        let mut idx = self.hdr().write_idx.load(Ordering::Acquire) as usize;
        unsafe {
            let size32 = size as u32;
            std::ptr::copy_nonoverlapping(
                size32.to_le_bytes().as_ptr(),
                self.data_ptr().add(idx),
                4,
            );
            idx = (idx + 4) % self.ring_window;
            // Mirrored mapping: one copy regardless of wrap.
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr().add(idx), size);
        }

        let new_idx = ((idx + size) % self.ring_window) as u64;
        self.hdr().write_idx.store(new_idx, Ordering::Release);
        self.notify_reader();
        true
    }

    /// Copies the next record into `buf`; 0 when empty or `buf` is too
    /// small.
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        let Some(view) = self.try_read_view() else {
            return 0;
        };
        if view.size > buf.len() {
            warn!(
                record = view.size,
                buffer = buf.len(),
                "read buffer too small for record"
            );
            return 0;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(view.data, buf.as_mut_ptr(), view.size);
        }
        let size = view.size;
        self.commit_read(&view);
        size
    }

    /// Blocking read with a timeout, used by the accept ring.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let n = self.try_read(buf);
        if n > 0 {
            return n;
        }
        if !self.wait_readable(timeout) {
            return 0;
        }
        self.try_read(buf)
    }

    // ── zero-copy API ────────────────────────────────────────────────────

    /// Claims the full contiguous window available for writing, at least
    /// `min_size` bytes. Nothing is published until
    /// [`RingBuffer::commit_write`]; a placeholder size header marks the
    /// record start.
    pub fn try_reserve_write(&self, min_size: usize) -> Option<WriteReservation> {
        let avail = self.available_bytes();
        if avail <= size_of::<u32>() {
            return None;
        }

        let mut max_data = avail - size_of::<u32>();
        max_data = max_data.min(self.hdr().max_record_size as usize);
        if max_data < min_size {
            return None;
        }

        let write_idx = self.hdr().write_idx.load(Ordering::Acquire) as usize;
        unsafe {
            let placeholder = 0u32;
            std::ptr::copy_nonoverlapping(
                placeholder.to_le_bytes().as_ptr(),
                self.data_ptr().add(write_idx),
                4,
            );
        }
        let data_idx = (write_idx + 4) % self.ring_window;

        Some(WriteReservation {
            data: unsafe { self.data_ptr().add(data_idx) },
            max_size: max_data,
            write_idx: write_idx as u64,
        })
    }

    /// Publishes a reserved record with its actual size.
    pub fn commit_write(&self, reservation: &WriteReservation, actual_size: usize) {
        self.commit_write_at(reservation.write_idx, reservation.max_size, actual_size);
    }

    /// Same as [`RingBuffer::commit_write`], for callers that tore the
    /// reservation apart (a view-mode flat buffer keeps only `write_idx`).
    pub fn commit_write_at(&self, write_idx: u64, max_size: usize, actual_size: usize) {
        if actual_size > max_size {
            error!(actual_size, max_size, "commit exceeds reservation; dropped");
            return;
        }

        let write_idx = write_idx as usize;
        unsafe {
            let size32 = actual_size as u32;
            std::ptr::copy_nonoverlapping(
                size32.to_le_bytes().as_ptr(),
                self.data_ptr().add(write_idx),
                4,
            );
        }

        let data_start = (write_idx + 4) % self.ring_window;
        let new_idx = ((data_start + actual_size) % self.ring_window) as u64;
        self.hdr().write_idx.store(new_idx, Ordering::Release);
        self.notify_reader();
    }

    /// Returns an in-place view of the next record, if any.
    pub fn try_read_view(&self) -> Option<ReadView> {
        let read_idx = self.hdr().read_idx.load(Ordering::Acquire) as usize;
        let write_idx = self.hdr().write_idx.load(Ordering::Acquire) as usize;
        if read_idx == write_idx {
            return None;
        }

        let mut size_bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data_ptr().add(read_idx),
                size_bytes.as_mut_ptr(),
                4,
            );
        }
        let size = u32::from_le_bytes(size_bytes) as usize;
        if size as u64 > self.hdr().max_record_size as u64 {
            error!(size, "corrupt record size in ring");
            return None;
        }

        let data_start = (read_idx + 4) % self.ring_window;
        Some(ReadView {
            data: unsafe { self.data_ptr().add(data_start) },
            size,
            read_idx: ((data_start + size) % self.ring_window) as u64,
        })
    }

    /// Releases a record after in-place consumption.
    pub fn commit_read(&self, view: &ReadView) {
        self.hdr().read_idx.store(view.read_idx, Ordering::Release);
    }

    // ── blocking wait ────────────────────────────────────────────────────

    /// Blocks until the ring is non-empty or `timeout` elapses.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        unsafe {
            let hdr = self.header.as_ptr();
            let mutex = &raw mut (*hdr).mutex;
            let cond = &raw mut (*hdr).cond;

            let mut deadline: libc::timespec = std::mem::zeroed();
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
            let nanos = deadline.tv_nsec as i128 + timeout.subsec_nanos() as i128;
            deadline.tv_sec += timeout.as_secs() as libc::time_t
                + (nanos / 1_000_000_000) as libc::time_t;
            deadline.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;

            libc::pthread_mutex_lock(mutex);
            let mut ok = true;
            while self.is_empty() {
                let rc = libc::pthread_cond_timedwait(cond, mutex, &deadline);
                if rc == libc::ETIMEDOUT {
                    ok = !self.is_empty();
                    break;
                }
                if rc != 0 {
                    ok = false;
                    break;
                }
            }
            libc::pthread_mutex_unlock(mutex);
            ok
        }
    }

    fn notify_reader(&self) {
        unsafe {
            let hdr = self.header.as_ptr();
            let mutex = &raw mut (*hdr).mutex;
            let cond = &raw mut (*hdr).cond;
            libc::pthread_mutex_lock(mutex);
            libc::pthread_cond_signal(cond);
            libc::pthread_mutex_unlock(mutex);
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.data.cast(), 2 * self.ring_window);
            let _ = munmap(self.header.cast(), self.header_len);
        }
        if self.is_creator {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, "failed to remove ring shm: {e}");
            } else {
                debug!(name = %self.name, "ring buffer removed");
            }
        }
    }
}

/// Initializes the process-shared mutex/condvar pair inside the header.
unsafe fn init_pshared_sync(hdr: *mut RingHeader) -> Result<()> {
    unsafe {
        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        if libc::pthread_mutexattr_init(&mut mattr) != 0 {
            bail!("pthread_mutexattr_init failed");
        }
        libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init(&raw mut (*hdr).mutex, &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);
        if rc != 0 {
            bail!("pthread_mutex_init failed: {rc}");
        }

        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        if libc::pthread_condattr_init(&mut cattr) != 0 {
            bail!("pthread_condattr_init failed");
        }
        libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_cond_init(&raw mut (*hdr).cond, &cattr);
        libc::pthread_condattr_destroy(&mut cattr);
        if rc != 0 {
            bail!("pthread_cond_init failed: {rc}");
        }
    }
    Ok(())
}
