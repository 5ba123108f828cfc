// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    buffer::access::read_bytes,
    stream::{build_chunk, build_complete, build_error},
    wire::{
        header::{MessageHeader, MessageId},
        stream_msgs::{
            STREAM_CHUNK_DATA_AT, STREAM_ERROR_DATA_AT, StreamChunk, StreamComplete,
            StreamError,
        },
    },
};

#[test]
fn test_chunk_frame_roundtrip() -> Result<()> {
    let payload = vec![7u8; 1500];
    let fb = build_chunk(0xAABB_CCDD_EEFF_0011, 42, &payload);

    let header = MessageHeader::read(fb.cdata()).expect("header present");
    assert_eq!(header.message_id()?, MessageId::StreamDataChunk);
    assert_eq!(header.size.get() as usize, fb.size() - 4);

    let chunk = StreamChunk::read(fb.cdata()).expect("chunk block present");
    assert_eq!(chunk.stream_id.get(), 0xAABB_CCDD_EEFF_0011);
    assert_eq!(chunk.sequence.get(), 42);
    assert_eq!(chunk.window_size.get(), 0);
    assert_eq!(read_bytes(&fb, STREAM_CHUNK_DATA_AT)?, payload.as_slice());
    Ok(())
}

#[test]
fn test_empty_chunk() -> Result<()> {
    let fb = build_chunk(1, 0, &[]);
    assert_eq!(read_bytes(&fb, STREAM_CHUNK_DATA_AT)?, &[] as &[u8]);
    Ok(())
}

#[test]
fn test_complete_frame() -> Result<()> {
    let fb = build_complete(99, 4);
    let header = MessageHeader::read(fb.cdata()).expect("header present");
    assert_eq!(header.message_id()?, MessageId::StreamCompletion);

    let msg = StreamComplete::read(fb.cdata()).expect("complete block present");
    assert_eq!(msg.stream_id.get(), 99);
    assert_eq!(msg.final_sequence.get(), 4);
    Ok(())
}

#[test]
fn test_error_frame() -> Result<()> {
    let fb = build_error(7, 13, b"boom");
    let header = MessageHeader::read(fb.cdata()).expect("header present");
    assert_eq!(header.message_id()?, MessageId::StreamError);

    let msg = StreamError::read(fb.cdata()).expect("error block present");
    assert_eq!(msg.stream_id.get(), 7);
    assert_eq!(msg.error_code.get(), 13);
    assert_eq!(read_bytes(&fb, STREAM_ERROR_DATA_AT)?, b"boom");
    Ok(())
}
