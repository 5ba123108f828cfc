// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stream control and data blocks. Each sits at offset 16 of its frame,
//! right after the message header.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32, U64,
};

use crate::{buffer::access::FlatVec, wire::header::HEADER_LEN};

/// Flag bit in [`StreamInit::flags`]: chunks may ride a datagram path.
pub const STREAM_FLAG_UNRELIABLE: u32 = 1;

/// Opens a stream: identifies the servant method that produces it.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamInit {
    pub stream_id: U64<LittleEndian>,
    pub object_id: U64<LittleEndian>,
    pub poa_idx: U16<LittleEndian>,
    pub interface_idx: u8,
    pub func_idx: u8,
    pub flags: U32<LittleEndian>,
}

pub const STREAM_INIT_LEN: usize = 24;

/// One data chunk. `data` is a flat vector whose bytes follow later in the
/// frame.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamChunk {
    pub stream_id: U64<LittleEndian>,
    pub sequence: U64<LittleEndian>,
    pub window_size: U32<LittleEndian>,
    pub data: FlatVec,
}

pub const STREAM_CHUNK_LEN: usize = 28;
/// Offset of the `data` descriptor within the frame.
pub const STREAM_CHUNK_DATA_AT: usize = HEADER_LEN + 20;

/// Normal end of stream.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamComplete {
    pub stream_id: U64<LittleEndian>,
    pub final_sequence: U64<LittleEndian>,
}

pub const STREAM_COMPLETE_LEN: usize = 16;

/// Abnormal end of stream; `error_data` carries optional serialized detail.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamError {
    pub stream_id: U64<LittleEndian>,
    pub error_code: U32<LittleEndian>,
    pub error_data: FlatVec,
}

pub const STREAM_ERROR_LEN: usize = 20;
pub const STREAM_ERROR_DATA_AT: usize = HEADER_LEN + 12;

/// Reader-initiated cancellation.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamCancel {
    pub stream_id: U64<LittleEndian>,
}

pub const STREAM_CANCEL_LEN: usize = 8;

macro_rules! block_views {
    ($t:ty, $len:expr) => {
        impl $t {
            #[inline]
            pub fn read(frame: &[u8]) -> Option<&Self> {
                Self::ref_from_bytes(frame.get(HEADER_LEN..HEADER_LEN + $len)?).ok()
            }

            #[inline]
            pub fn read_mut(frame: &mut [u8]) -> Option<&mut Self> {
                Self::mut_from_bytes(frame.get_mut(HEADER_LEN..HEADER_LEN + $len)?)
                    .ok()
            }
        }
    };
}

block_views!(StreamInit, STREAM_INIT_LEN);
block_views!(StreamChunk, STREAM_CHUNK_LEN);
block_views!(StreamComplete, STREAM_COMPLETE_LEN);
block_views!(StreamError, STREAM_ERROR_LEN);
block_views!(StreamCancel, STREAM_CANCEL_LEN);
