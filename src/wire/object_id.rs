// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The full object id as it travels inside argument blocks: fixed part plus
//! two flat strings (class id and the semicolon-separated URL list).

use anyhow::Result;
use bitflags::bitflags;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32, U64,
};

use crate::buffer::{
    FlatBuffer,
    access::{FlatStr, read_str, write_str},
};

/// Marks an object id that refers to nothing.
pub const INVALID_OBJECT_ID: u64 = u64::MAX;

bitflags! {
    /// Flags carried in the object id `flags` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u32 {
        /// Object survives its POA's sessions; reference counting is a no-op.
        const PERSISTENT = 1;
        /// Object is only reachable through the session that delivered it.
        const TETHERED = 2;
    }
}

bitflags! {
    /// Transports an activation permits, plus the session-specific marker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActivationFlags: u32 {
        const ALLOW_TCP = 1 << 0;
        const ALLOW_WEBSOCKET = 1 << 1;
        const ALLOW_SSL_WEBSOCKET = 1 << 2;
        const ALLOW_UDP = 1 << 3;
        const ALLOW_QUIC = 1 << 4;
        const ALLOW_SHARED_MEMORY = 1 << 5;
        /// Tether the object to the activating session.
        const SESSION_SPECIFIC = 1 << 16;
    }
}

impl ActivationFlags {
    /// Everything except SESSION_SPECIFIC.
    pub fn all_transports() -> Self {
        Self::ALLOW_TCP
            | Self::ALLOW_WEBSOCKET
            | Self::ALLOW_SSL_WEBSOCKET
            | Self::ALLOW_UDP
            | Self::ALLOW_QUIC
            | Self::ALLOW_SHARED_MEMORY
    }
}

/// Fixed-layout prefix of the serialized object id.
#[repr(C)]
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ObjectIdFixed {
    pub object_id: U64<LittleEndian>,
    pub poa_idx: U16<LittleEndian>,
    _pad: U16<LittleEndian>,
    pub flags: U32<LittleEndian>,
    pub origin: [u8; 16],
    pub class_id: FlatStr,
    pub urls: FlatStr,
}

/// Serialized size of [`ObjectIdFixed`]; string bytes follow later in the
/// buffer.
pub const OBJECT_ID_FIXED_LEN: usize = 48;

/// Owned form of an object reference as handed to proxies and produced by
/// activation.
#[derive(Debug, Clone, Default)]
pub struct ObjectIdData {
    pub object_id: u64,
    pub poa_idx: u16,
    pub flags: ObjectFlags,
    pub origin: [u8; 16],
    pub class_id: String,
    pub urls: String,
}

impl ObjectIdData {
    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.flags.contains(ObjectFlags::PERSISTENT)
    }

    #[inline]
    pub fn is_tethered(&self) -> bool {
        self.flags.contains(ObjectFlags::TETHERED)
    }

    /// True when `origin` matches the given process GUID, qualifying the
    /// object for same-host transports.
    #[inline]
    pub fn is_same_origin(&self, guid: &[u8; 16]) -> bool {
        &self.origin == guid
    }

    /// Serializes the object id at `at`, which must point at
    /// [`OBJECT_ID_FIXED_LEN`] committed bytes; string bytes are appended to
    /// the buffer tail.
    pub fn write_into(&self, buf: &mut FlatBuffer, at: usize) -> Result<()> {
        {
            let fixed = ObjectIdFixed::mut_from_bytes(
                &mut buf.data_mut()[at..at + OBJECT_ID_FIXED_LEN],
            )
            .map_err(|e| anyhow::anyhow!("object id block: {e}"))?;
            fixed.object_id.set(self.object_id);
            fixed.poa_idx.set(self.poa_idx);
            fixed.flags.set(self.flags.bits());
            fixed.origin = self.origin;
        }
        write_str(buf, at + 32, &self.class_id)?;
        write_str(buf, at + 40, &self.urls)?;
        Ok(())
    }

    /// Reads an object id block at `at`, copying both strings out.
    pub fn read_from(buf: &FlatBuffer, at: usize) -> Result<Self> {
        let committed = buf.cdata();
        let fixed = ObjectIdFixed::ref_from_bytes(
            committed
                .get(at..at + OBJECT_ID_FIXED_LEN)
                .ok_or_else(|| anyhow::anyhow!("object id block out of bounds"))?,
        )
        .map_err(|e| anyhow::anyhow!("object id block: {e}"))?;

        let data = Self {
            object_id: fixed.object_id.get(),
            poa_idx: fixed.poa_idx.get(),
            flags: ObjectFlags::from_bits_truncate(fixed.flags.get()),
            origin: fixed.origin,
            class_id: read_str(buf, at + 32)?.to_owned(),
            urls: read_str(buf, at + 40)?.to_owned(),
        };
        Ok(data)
    }
}
