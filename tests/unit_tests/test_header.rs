// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    buffer::FlatBuffer,
    wire::{
        frame::{begin_frame, finish_frame},
        header::{HEADER_LEN, MessageHeader, MessageId, MessageType},
    },
};

#[test]
fn test_header_layout() -> Result<()> {
    let mut buf = FlatBuffer::new();
    begin_frame(
        &mut buf,
        0,
        MessageId::FunctionCall,
        MessageType::Request,
        42,
    )?;

    assert_eq!(buf.size(), HEADER_LEN);

    let raw = buf.cdata();
    // size excludes its own four bytes
    assert_eq!(u32::from_le_bytes(raw[0..4].try_into()?), 12);
    assert_eq!(u32::from_le_bytes(raw[4..8].try_into()?), 0); // FunctionCall
    assert_eq!(u32::from_le_bytes(raw[8..12].try_into()?), 0); // Request
    assert_eq!(u32::from_le_bytes(raw[12..16].try_into()?), 42);
    Ok(())
}

#[test]
fn test_header_read_back() -> Result<()> {
    let mut buf = FlatBuffer::new();
    begin_frame(&mut buf, 8, MessageId::Success, MessageType::Answer, 7)?;

    let header = MessageHeader::read(buf.cdata()).expect("header present");
    assert_eq!(header.message_id()?, MessageId::Success);
    assert!(header.is_answer());
    assert_eq!(header.request_id.get(), 7);
    assert_eq!(header.size.get() as usize, buf.size() - 4);
    Ok(())
}

#[test]
fn test_finish_frame_recomputes_size() -> Result<()> {
    let mut buf = FlatBuffer::new();
    begin_frame(
        &mut buf,
        4,
        MessageId::BlockResponse,
        MessageType::Answer,
        1,
    )?;

    // Simulate appending variable data after the fixed block.
    let region = buf.prepare(100)?;
    region.fill(0xAB);
    buf.commit(100);
    finish_frame(&mut buf);

    let header = MessageHeader::read(buf.cdata()).expect("header present");
    assert_eq!(header.size.get() as usize, buf.size() - 4);
    Ok(())
}

#[test]
fn test_unknown_message_id_rejected() {
    assert!(MessageId::try_from(17).is_ok());
    assert!(MessageId::try_from(18).is_err());
    assert!(MessageId::try_from(u32::MAX).is_err());
}

#[test]
fn test_simple_answer_kinds() {
    assert!(MessageId::Success.is_simple_answer());
    assert!(MessageId::ErrorBadInput.is_simple_answer());
    assert!(!MessageId::FunctionCall.is_simple_answer());
    assert!(!MessageId::BlockResponse.is_simple_answer());
    assert!(!MessageId::Exception.is_simple_answer());
}
