// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The fixed 16-byte header that opens every frame.
//!
//! ```text
//! offset 0   u32  size         frame length excluding this field
//! offset 4   u32  msg_id       MessageId discriminant
//! offset 8   u32  msg_type     0 = Request, 1 = Answer
//! offset 12  u32  request_id   correlation id, 0 = unset
//! ```
//!
//! The `size` field doubles as the stream-transport length prefix: a TCP
//! reader first pulls 4 bytes, interprets them as `size`, then reads that
//! many more bytes to complete the frame.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32};

pub const HEADER_LEN: usize = 16;

/// Hard cap on a single frame. Anything larger is treated as a protocol
/// violation: stream transports drop the connection, datagram transports
/// drop the frame.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// All message kinds that can appear in the `msg_id` header field.
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    #[default]
    FunctionCall = 0,
    BlockResponse = 1,
    AddReference = 2,
    ReleaseObject = 3,
    Success = 4,
    Exception = 5,
    ErrorPoaNotExist = 6,
    ErrorObjectNotExist = 7,
    ErrorCommFailure = 8,
    ErrorUnknownFunctionIdx = 9,
    ErrorUnknownMessageId = 10,
    ErrorBadAccess = 11,
    ErrorBadInput = 12,
    StreamInitialization = 13,
    StreamDataChunk = 14,
    StreamCompletion = 15,
    StreamError = 16,
    StreamCancellation = 17,
}

/// Returned when the header carries an undefined message id.
#[derive(Debug, Error)]
#[error("unknown message id: {0}")]
pub struct UnknownMessageId(pub u32);

impl TryFrom<u32> for MessageId {
    type Error = UnknownMessageId;

    fn try_from(v: u32) -> Result<Self, UnknownMessageId> {
        Ok(match v {
            0 => Self::FunctionCall,
            1 => Self::BlockResponse,
            2 => Self::AddReference,
            3 => Self::ReleaseObject,
            4 => Self::Success,
            5 => Self::Exception,
            6 => Self::ErrorPoaNotExist,
            7 => Self::ErrorObjectNotExist,
            8 => Self::ErrorCommFailure,
            9 => Self::ErrorUnknownFunctionIdx,
            10 => Self::ErrorUnknownMessageId,
            11 => Self::ErrorBadAccess,
            12 => Self::ErrorBadInput,
            13 => Self::StreamInitialization,
            14 => Self::StreamDataChunk,
            15 => Self::StreamCompletion,
            16 => Self::StreamError,
            17 => Self::StreamCancellation,
            other => return Err(UnknownMessageId(other)),
        })
    }
}

impl MessageId {
    /// True for the kinds `make_simple_answer` is allowed to emit.
    #[inline]
    pub fn is_simple_answer(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::ErrorPoaNotExist
                | Self::ErrorObjectNotExist
                | Self::ErrorCommFailure
                | Self::ErrorUnknownFunctionIdx
                | Self::ErrorUnknownMessageId
                | Self::ErrorBadAccess
                | Self::ErrorBadInput
        )
    }
}

/// Request/answer direction bit of a frame.
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    #[default]
    Request = 0,
    Answer = 1,
}

/// Raw little-endian view of the frame header.
///
/// Alignment is 1 (all fields are byte-order wrappers), so the view is
/// valid at any offset, including directly inside a shared-memory ring.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MessageHeader {
    pub size: U32<LittleEndian>,
    pub msg_id: U32<LittleEndian>,
    pub msg_type: U32<LittleEndian>,
    pub request_id: U32<LittleEndian>,
}

impl MessageHeader {
    /// Borrow the header from the start of a frame.
    #[inline]
    pub fn read(frame: &[u8]) -> Option<&Self> {
        Self::ref_from_bytes(frame.get(..HEADER_LEN)?).ok()
    }

    /// Mutably borrow the header from the start of a frame.
    #[inline]
    pub fn read_mut(frame: &mut [u8]) -> Option<&mut Self> {
        Self::mut_from_bytes(frame.get_mut(..HEADER_LEN)?).ok()
    }

    #[inline]
    pub fn message_id(&self) -> Result<MessageId, UnknownMessageId> {
        MessageId::try_from(self.msg_id.get())
    }

    #[inline]
    pub fn is_answer(&self) -> bool {
        self.msg_type.get() == MessageType::Answer as u32
    }

    /// Fills the header fields in one go; `size` is derived from the total
    /// frame length.
    pub fn fill(
        &mut self,
        frame_len: usize,
        msg_id: MessageId,
        msg_type: MessageType,
        request_id: u32,
    ) {
        self.size.set(frame_len as u32 - 4);
        self.msg_id.set(msg_id as u32);
        self.msg_type.set(msg_type as u32);
        self.request_id.set(request_id);
    }
}
