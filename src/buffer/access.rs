// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Checked in-place accessors for the variable-length flat constructs.
//!
//! Strings and vectors are an 8-byte descriptor `{u32 offset, u32 len}`
//! where `offset` is relative to the descriptor's own position; optionals
//! are a single `u32` relative offset with 0 meaning absent. Value bytes
//! live later in the buffer, so writers allocate at the aligned tail and
//! then store the relative offset. Accessors are created per use and carry
//! `(buffer, offset)` — growth can move the storage, but offsets stay
//! valid, so there is no pointer to invalidate.

use anyhow::{Result, bail, ensure};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32};

use crate::buffer::FlatBuffer;

/// Wire descriptor of a flat string.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FlatStr {
    pub offset: U32<LittleEndian>,
    pub len: U32<LittleEndian>,
}

/// Wire descriptor of a flat vector. Identical layout to [`FlatStr`];
/// `len` counts elements, not bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FlatVec {
    pub offset: U32<LittleEndian>,
    pub len: U32<LittleEndian>,
}

/// Wire descriptor of a flat optional: relative offset of the value, 0 when
/// absent.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FlatOpt {
    pub offset: U32<LittleEndian>,
}

/// Borrows a POD wire struct at `at` inside the committed prefix.
#[inline]
pub fn pod_at<T: FromBytes + KnownLayout + Immutable>(
    buf: &FlatBuffer,
    at: usize,
) -> Result<&T> {
    let bytes = buf
        .cdata()
        .get(at..at + size_of::<T>())
        .ok_or_else(|| anyhow::anyhow!("read of {} out of bounds at {at}", std::any::type_name::<T>()))?;
    T::ref_from_bytes(bytes).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Mutably borrows a POD wire struct at `at` inside the committed prefix.
#[inline]
pub fn pod_at_mut<T: FromBytes + IntoBytes + KnownLayout + Immutable>(
    buf: &mut FlatBuffer,
    at: usize,
) -> Result<&mut T> {
    let bytes = buf
        .data_mut()
        .get_mut(at..at + size_of::<T>())
        .ok_or_else(|| anyhow::anyhow!("write of {} out of bounds at {at}", std::any::type_name::<T>()))?;
    T::mut_from_bytes(bytes).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Writes `s` through the descriptor at `at`: bytes go to the buffer tail,
/// the descriptor receives the relative offset and length.
pub fn write_str(buf: &mut FlatBuffer, at: usize, s: &str) -> Result<()> {
    ensure!(
        at + size_of::<FlatStr>() <= buf.size(),
        "string descriptor at {at} is outside the committed prefix"
    );

    let data_off = buf.alloc_tail(s.len(), 1)?;
    buf.data_mut()[data_off..data_off + s.len()].copy_from_slice(s.as_bytes());

    let desc = pod_at_mut::<FlatStr>(buf, at)?;
    desc.offset.set((data_off - at) as u32);
    desc.len.set(s.len() as u32);
    Ok(())
}

/// Reads the string referenced by the descriptor at `at`.
pub fn read_str(buf: &FlatBuffer, at: usize) -> Result<&str> {
    let desc = pod_at::<FlatStr>(buf, at)?;
    let (offset, len) = (desc.offset.get() as usize, desc.len.get() as usize);
    if len == 0 {
        return Ok("");
    }

    let start = at
        .checked_add(offset)
        .ok_or_else(|| anyhow::anyhow!("string offset overflow"))?;
    let bytes = buf
        .cdata()
        .get(start..start + len)
        .ok_or_else(|| anyhow::anyhow!("string data out of bounds at {start}+{len}"))?;
    Ok(std::str::from_utf8(bytes)?)
}

/// Allocates storage for `count` elements of `elem_size` bytes at
/// `elem_align` and fills the vector descriptor at `at`. Returns the offset
/// of the first element for in-place writes.
pub fn alloc_vector(
    buf: &mut FlatBuffer,
    at: usize,
    count: usize,
    elem_size: usize,
    elem_align: usize,
) -> Result<usize> {
    ensure!(
        at + size_of::<FlatVec>() <= buf.size(),
        "vector descriptor at {at} is outside the committed prefix"
    );

    let data_off = buf.alloc_tail(count * elem_size, elem_align)?;
    let desc = pod_at_mut::<FlatVec>(buf, at)?;
    desc.offset.set((data_off - at) as u32);
    desc.len.set(count as u32);
    Ok(data_off)
}

/// Writes a byte vector through the descriptor at `at`.
pub fn write_bytes(buf: &mut FlatBuffer, at: usize, bytes: &[u8]) -> Result<()> {
    let data_off = alloc_vector(buf, at, bytes.len(), 1, 1)?;
    buf.data_mut()[data_off..data_off + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Reads the byte vector referenced by the descriptor at `at`.
pub fn read_bytes(buf: &FlatBuffer, at: usize) -> Result<&[u8]> {
    read_vector::<u8>(buf, at)
}

/// Reads a typed vector in place. `T` must be a wire POD with alignment 1
/// (little-endian wrappers), so any relative offset is admissible.
pub fn read_vector<T: FromBytes + KnownLayout + Immutable>(
    buf: &FlatBuffer,
    at: usize,
) -> Result<&[T]> {
    let desc = pod_at::<FlatVec>(buf, at)?;
    let (offset, len) = (desc.offset.get() as usize, desc.len.get() as usize);
    if len == 0 {
        return Ok(&[]);
    }

    let start = at
        .checked_add(offset)
        .ok_or_else(|| anyhow::anyhow!("vector offset overflow"))?;
    let byte_len = len
        .checked_mul(size_of::<T>())
        .ok_or_else(|| anyhow::anyhow!("vector length overflow"))?;
    let bytes = buf
        .cdata()
        .get(start..start + byte_len)
        .ok_or_else(|| anyhow::anyhow!("vector data out of bounds at {start}+{byte_len}"))?;
    <[T]>::ref_from_bytes(bytes).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Marks the optional at `at` as absent.
pub fn set_opt_none(buf: &mut FlatBuffer, at: usize) -> Result<()> {
    pod_at_mut::<FlatOpt>(buf, at)?.offset.set(0);
    Ok(())
}

/// Allocates storage for an optional's value and returns its offset.
pub fn alloc_opt(
    buf: &mut FlatBuffer,
    at: usize,
    value_size: usize,
    value_align: usize,
) -> Result<usize> {
    ensure!(
        at + size_of::<FlatOpt>() <= buf.size(),
        "optional descriptor at {at} is outside the committed prefix"
    );

    let data_off = buf.alloc_tail(value_size, value_align)?;
    let rel = data_off - at;
    if rel == 0 {
        bail!("optional value may not alias its descriptor");
    }
    pod_at_mut::<FlatOpt>(buf, at)?.offset.set(rel as u32);
    Ok(data_off)
}

/// Resolves the optional at `at`: `None` when absent, otherwise the offset
/// of the value.
pub fn read_opt(buf: &FlatBuffer, at: usize) -> Result<Option<usize>> {
    let desc = pod_at::<FlatOpt>(buf, at)?;
    let offset = desc.offset.get() as usize;
    if offset == 0 {
        return Ok(None);
    }
    let start = at
        .checked_add(offset)
        .ok_or_else(|| anyhow::anyhow!("optional offset overflow"))?;
    ensure!(
        start <= buf.size(),
        "optional value out of bounds at {start}"
    );
    Ok(Some(start))
}
