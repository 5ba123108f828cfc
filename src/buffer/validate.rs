// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounds checking for argument blocks arriving on untrusted interfaces.
//!
//! The checks mirror the accessor layer but never slice the data: they only
//! prove that every offset/length pair stays inside the committed prefix.
//! Generated validators compose these primitives field by field, recursing
//! through optionals and vectors of non-flat structs. The router runs the
//! validator before dispatch and answers `Error_BadInput` on failure.

use thiserror::Error;

use crate::buffer::{
    FlatBuffer,
    access::{FlatOpt, FlatStr, pod_at},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("struct at {at} (+{size}) exceeds buffer of {have} bytes")]
    StructOutOfBounds { at: usize, size: usize, have: usize },
    #[error("string at {at} points outside the buffer")]
    BadString { at: usize },
    #[error("vector at {at} points outside the buffer")]
    BadVector { at: usize },
    #[error("optional at {at} points outside the buffer")]
    BadOptional { at: usize },
}

/// Verifies that a fixed-size struct fits inside the committed prefix.
pub fn check_struct(
    buf: &FlatBuffer,
    at: usize,
    size: usize,
) -> Result<(), ValidationError> {
    let have = buf.size();
    let end = at.checked_add(size).ok_or(ValidationError::StructOutOfBounds {
        at,
        size,
        have,
    })?;
    if end > have {
        return Err(ValidationError::StructOutOfBounds { at, size, have });
    }
    Ok(())
}

/// Verifies the string descriptor at `at` and its referenced bytes.
pub fn check_str(buf: &FlatBuffer, at: usize) -> Result<(), ValidationError> {
    check_struct(buf, at, size_of::<FlatStr>())?;
    let desc = pod_at::<FlatStr>(buf, at).map_err(|_| ValidationError::BadString { at })?;
    let (offset, len) = (desc.offset.get() as usize, desc.len.get() as usize);
    if len == 0 {
        return Ok(());
    }

    let ok = at
        .checked_add(offset)
        .and_then(|start| start.checked_add(len))
        .is_some_and(|end| end <= buf.size());
    if !ok {
        return Err(ValidationError::BadString { at });
    }
    Ok(())
}

/// Verifies the vector descriptor at `at`; `elem_size` is the byte size of
/// one element. Returns `(data_offset, len)` so callers can recurse into
/// non-flat elements.
pub fn check_vector(
    buf: &FlatBuffer,
    at: usize,
    elem_size: usize,
) -> Result<(usize, usize), ValidationError> {
    check_struct(buf, at, size_of::<FlatStr>())?;
    let desc = pod_at::<FlatStr>(buf, at).map_err(|_| ValidationError::BadVector { at })?;
    let (offset, len) = (desc.offset.get() as usize, desc.len.get() as usize);
    if len == 0 {
        return Ok((at, 0));
    }

    let start = at
        .checked_add(offset)
        .ok_or(ValidationError::BadVector { at })?;
    let byte_len = len
        .checked_mul(elem_size)
        .ok_or(ValidationError::BadVector { at })?;
    let ok = start
        .checked_add(byte_len)
        .is_some_and(|end| end <= buf.size());
    if !ok {
        return Err(ValidationError::BadVector { at });
    }
    Ok((start, len))
}

/// Verifies the optional descriptor at `at`; `value_size` is the byte size
/// of the value when present. Returns the value's offset for recursion.
pub fn check_optional(
    buf: &FlatBuffer,
    at: usize,
    value_size: usize,
) -> Result<Option<usize>, ValidationError> {
    check_struct(buf, at, size_of::<FlatOpt>())?;
    let desc =
        pod_at::<FlatOpt>(buf, at).map_err(|_| ValidationError::BadOptional { at })?;
    let offset = desc.offset.get() as usize;
    if offset == 0 {
        return Ok(None);
    }

    let start = at
        .checked_add(offset)
        .ok_or(ValidationError::BadOptional { at })?;
    let ok = start
        .checked_add(value_size)
        .is_some_and(|end| end <= buf.size());
    if !ok {
        return Err(ValidationError::BadOptional { at });
    }
    Ok(Some(start))
}
