//! Fixed-layout wire structures shared by every transport.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Call header following the frame header on `FunctionCall`.
pub mod call;
/// Frame assembly helpers.
pub mod frame;
/// 16-byte frame header, message kinds and types.
pub mod header;
/// Object id blocks and flags.
pub mod object_id;
/// Stream control and data blocks.
pub mod stream_msgs;
