// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Blocks that follow the frame header on call-related messages.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U64};

use crate::wire::header::HEADER_LEN;

/// Offset of the argument block inside a `FunctionCall` frame.
pub const ARGS_OFFSET: usize = HEADER_LEN + CALL_HEADER_LEN;

pub const CALL_HEADER_LEN: usize = 16;

/// Identifies the servant and method of a `FunctionCall`.
///
/// Lives at offset 16 of the frame; the argument block starts at offset 32.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CallHeader {
    pub poa_idx: U16<LittleEndian>,
    pub interface_idx: u8,
    pub function_idx: u8,
    _reserved: [u8; 4],
    pub object_id: U64<LittleEndian>,
}

impl CallHeader {
    #[inline]
    pub fn read(frame: &[u8]) -> Option<&Self> {
        Self::ref_from_bytes(frame.get(HEADER_LEN..HEADER_LEN + CALL_HEADER_LEN)?).ok()
    }

    #[inline]
    pub fn read_mut(frame: &mut [u8]) -> Option<&mut Self> {
        Self::mut_from_bytes(frame.get_mut(HEADER_LEN..HEADER_LEN + CALL_HEADER_LEN)?)
            .ok()
    }
}

pub const OBJECT_ID_LOCAL_LEN: usize = 16;

/// Payload of `AddReference` and `ReleaseObject`: the local part of an
/// object id, padded out to 16 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ObjectIdLocal {
    pub object_id: U64<LittleEndian>,
    pub poa_idx: U16<LittleEndian>,
    _pad: [u8; 6],
}

impl ObjectIdLocal {
    pub fn new(poa_idx: u16, object_id: u64) -> Self {
        Self {
            object_id: U64::new(object_id),
            poa_idx: U16::new(poa_idx),
            _pad: [0; 6],
        }
    }

    #[inline]
    pub fn read(frame: &[u8]) -> Option<&Self> {
        Self::ref_from_bytes(frame.get(HEADER_LEN..HEADER_LEN + OBJECT_ID_LOCAL_LEN)?)
            .ok()
    }
}
