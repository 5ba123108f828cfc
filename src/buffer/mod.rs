// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The flat buffer: the single on-wire representation of every message.
//!
//! A buffer is a committed prefix of bytes plus writable headroom. In
//! *owned* mode the storage is a heap `Vec` that grows on demand. In *view*
//! mode the buffer borrows a window that a shared-memory transport reserved
//! inside its send ring (or a record being read in place); growth beyond the
//! reservation fails instead of copying, and the buffer keeps the
//! reservation's `write_idx` so the transport can commit the record later.

/// In-place accessors for strings, vectors and optionals.
pub mod access;
/// Bounds checking for untrusted argument blocks.
pub mod validate;

use thiserror::Error;

/// Returned when a view-mode buffer would have to grow past its
/// reservation. Callers fall back to an owned buffer or fail the call.
#[derive(Debug, Error)]
#[error("view buffer overflow: need {need} bytes, reservation holds {max}")]
pub struct ViewOverflow {
    pub need: usize,
    pub max: usize,
}

enum Storage {
    Owned(Vec<u8>),
    View {
        ptr: *mut u8,
        max_size: usize,
        write_idx: Option<u64>,
    },
}

pub struct FlatBuffer {
    storage: Storage,
    size: usize,
}

// View mode carries a raw pointer into a shared-memory ring. The cell is
// exclusively owned by this buffer until the transport commits or abandons
// the reservation, and a buffer is only touched from one thread at a time.
unsafe impl Send for FlatBuffer {}

impl Default for FlatBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatBuffer {
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            size: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: Storage::Owned(Vec::with_capacity(cap)),
            size: 0,
        }
    }

    /// Wraps an already-complete frame; the whole vector is committed.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            storage: Storage::Owned(data),
            size,
        }
    }

    /// Turns the buffer into a writable view over a ring reservation.
    ///
    /// # Safety
    /// `ptr` must stay valid for `max_size` bytes until the buffer is
    /// dropped or re-assigned, and nothing else may access that window.
    pub unsafe fn set_view(&mut self, ptr: *mut u8, max_size: usize, write_idx: u64) {
        self.storage = Storage::View {
            ptr,
            max_size,
            write_idx: Some(write_idx),
        };
        self.size = 0;
    }

    /// Wraps a fully received in-place record (zero-copy read path).
    ///
    /// # Safety
    /// Same aliasing rules as [`FlatBuffer::set_view`]; `len` bytes at `ptr`
    /// must hold a complete frame.
    pub unsafe fn view_of_record(ptr: *mut u8, len: usize) -> Self {
        Self {
            storage: Storage::View {
                ptr,
                max_size: len,
                write_idx: None,
            },
            size: len,
        }
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View { .. })
    }

    /// `write_idx` of the underlying reservation, if this is a writable
    /// view.
    #[inline]
    pub fn reservation_write_idx(&self) -> Option<u64> {
        match self.storage {
            Storage::View { write_idx, .. } => write_idx,
            Storage::Owned(_) => None,
        }
    }

    #[inline]
    pub fn max_size(&self) -> Option<usize> {
        match self.storage {
            Storage::View { max_size, .. } => Some(max_size),
            Storage::Owned(_) => None,
        }
    }

    /// Number of committed bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Makes `n` bytes of headroom available past the committed prefix and
    /// returns the writable region.
    pub fn prepare(&mut self, n: usize) -> Result<&mut [u8], ViewOverflow> {
        let need = self.size + n;
        match &mut self.storage {
            Storage::Owned(data) => {
                if data.len() < need {
                    data.resize(need, 0);
                }
                Ok(&mut data[self.size..need])
            },
            Storage::View { ptr, max_size, .. } => {
                if need > *max_size {
                    return Err(ViewOverflow {
                        need,
                        max: *max_size,
                    });
                }
                // Within the reservation by the check above.
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(ptr.add(self.size), n)
                })
            },
        }
    }

    /// Extends the committed prefix by `n` previously prepared bytes.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.size += n;
        if let Storage::Owned(data) = &self.storage {
            debug_assert!(self.size <= data.len());
        }
    }

    /// Drops `n` bytes from the front. View buffers only support dropping
    /// everything (abandoning the reservation's content).
    pub fn consume(&mut self, n: usize) {
        match &mut self.storage {
            Storage::Owned(data) => {
                let n = n.min(self.size);
                data.drain(..n);
                self.size -= n;
            },
            Storage::View { .. } => {
                debug_assert!(n >= self.size, "partial consume of a view buffer");
                self.size = 0;
            },
        }
    }

    /// Committed bytes, immutable.
    #[inline]
    pub fn cdata(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(data) => &data[..self.size],
            Storage::View { ptr, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, self.size)
            },
        }
    }

    /// Committed bytes, mutable.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(data) => &mut data[..self.size],
            Storage::View { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, self.size)
            },
        }
    }

    /// Pads the committed prefix so the next allocation starts aligned,
    /// then commits `len` zeroed bytes and returns their offset.
    pub fn alloc_tail(&mut self, len: usize, align: usize) -> Result<usize, ViewOverflow> {
        debug_assert!(align.is_power_of_two());
        let start = (self.size + align - 1) & !(align - 1);
        let pad = start - self.size;
        let region = self.prepare(pad + len)?;
        region.fill(0);
        self.commit(pad + len);
        Ok(start)
    }

    /// Copies the committed prefix into a fresh owned buffer. Used when a
    /// zero-copy reservation turns out to be too small.
    pub fn to_owned_buffer(&self) -> FlatBuffer {
        FlatBuffer::from_vec(self.cdata().to_vec())
    }
}

impl std::fmt::Debug for FlatBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatBuffer")
            .field("mode", &if self.is_view() { "view" } else { "owned" })
            .field("size", &self.size)
            .field("data", &crate::utils::HexPreview(self.cdata()))
            .finish()
    }
}
