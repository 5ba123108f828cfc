// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frame assembly helpers shared by proxies, servants and the stream
//! manager.

use anyhow::Result;

use crate::{
    buffer::FlatBuffer,
    wire::header::{HEADER_LEN, MessageHeader, MessageId, MessageType},
};

/// Clears `buf` and lays down a header plus `block_len` zeroed bytes for
/// the fixed part of the message. The header's `size` field is provisional
/// until [`finish_frame`] runs.
pub fn begin_frame(
    buf: &mut FlatBuffer,
    block_len: usize,
    msg_id: MessageId,
    msg_type: MessageType,
    request_id: u32,
) -> Result<()> {
    buf.consume(buf.size());
    let total = HEADER_LEN + block_len;
    let region = buf.prepare(total)?;
    region.fill(0);
    buf.commit(total);

    let header = MessageHeader::read_mut(buf.data_mut())
        .expect("frame shorter than its own header");
    header.fill(total, msg_id, msg_type, request_id);
    Ok(())
}

/// Re-derives the header `size` field after variable-length data was
/// appended.
pub fn finish_frame(buf: &mut FlatBuffer) {
    let total = buf.size();
    let header = MessageHeader::read_mut(buf.data_mut())
        .expect("frame shorter than its own header");
    header.size.set(total as u32 - 4);
}
