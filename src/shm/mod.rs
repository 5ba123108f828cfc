//! POSIX shared-memory IPC: mirrored ring buffers, the connection
//! listener and per-client channels.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Ring pair + reader thread for one connection.
pub mod channel;
/// Accept ring, handshake and ready-flag protocol.
pub mod listener;
/// The lock-free, virtually-mirrored SPSC ring buffer.
pub mod ring;

/// Builds the POSIX shm object name for a ring: `/nprpc_<base>_<suffix>`.
pub fn shm_name(base: &str, suffix: &str) -> String {
    format!("/nprpc_{base}_{suffix}")
}

/// Name of the one-page ready-flag segment for a connecting channel.
pub fn ready_flag_name(channel_id: &str) -> String {
    format!("/nprpc_ready_{channel_id}")
}
