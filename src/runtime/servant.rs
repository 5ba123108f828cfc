// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The servant side of the object model: what generated code implements
//! and what the router drives.

use std::sync::Arc;

use anyhow::Result;

use crate::{
    buffer::FlatBuffer,
    runtime::RpcError,
    session::context::SessionContext,
    stream::StreamWriter,
    wire::{
        frame::begin_frame,
        header::{HEADER_LEN, MessageHeader, MessageId, MessageType},
    },
};

/// Everything a dispatch invocation can touch.
///
/// `rx`/`tx` are only valid for the duration of the call; servants must not
/// stash them.
pub struct Dispatch<'a> {
    pub interface_idx: u8,
    pub function_idx: u8,
    pub request_id: u32,
    pub rx: &'a FlatBuffer,
    pub tx: &'a mut FlatBuffer,
    pub ctx: &'a Arc<SessionContext>,
}

impl<'a> Dispatch<'a> {
    /// Starts a `BlockResponse` answer with `block_len` bytes of fixed
    /// output arguments; returns the offset of the output block.
    pub fn begin_block_response(&mut self, block_len: usize) -> Result<usize> {
        begin_frame(
            self.tx,
            block_len,
            MessageId::BlockResponse,
            MessageType::Answer,
            self.request_id,
        )?;
        Ok(HEADER_LEN)
    }

    /// Writes a bare standard answer.
    pub fn simple_answer(&mut self, id: MessageId) {
        make_simple_answer(self.tx, id, self.request_id);
    }
}

/// An application object bound to a POA slot.
///
/// Implementations are normally emitted by the IDL compiler: `dispatch`
/// switches on `function_idx`, parses the argument block in place and
/// writes either a `BlockResponse`, an `Exception` or a standard answer
/// into `tx`.
pub trait ObjectServant: Send + Sync + 'static {
    /// Stable class id, e.g. `"demo/server.Calculator"`.
    fn class_id(&self) -> &'static str;

    /// Untrusted-interface hook: bounds-check the argument block before
    /// `dispatch` runs. The default accepts everything; generators override
    /// it for interfaces marked untrusted, composing
    /// [`crate::buffer::validate`] primitives.
    fn validate_input(&self, _function_idx: u8, _rx: &FlatBuffer) -> bool {
        true
    }

    /// Handles one call. Must leave a complete answer frame in `d.tx`.
    fn dispatch(&self, d: &mut Dispatch<'_>);

    /// Opens a server→client stream for a method returning `stream of T`.
    /// `None` means the function index does not name a streaming method.
    fn open_stream(
        &self,
        _function_idx: u8,
        _rx: &FlatBuffer,
    ) -> Option<Box<dyn StreamWriter>> {
        None
    }
}

/// Writes a header-only reply (success or one of the error kinds) into
/// `tx`, echoing `request_id`.
pub fn make_simple_answer(tx: &mut FlatBuffer, id: MessageId, request_id: u32) {
    debug_assert!(id.is_simple_answer(), "not a simple answer kind: {id:?}");

    if begin_frame(tx, 0, id, MessageType::Answer, request_id).is_err() {
        // The zero-copy reservation cannot even hold a header; fall back to
        // an owned buffer.
        *tx = FlatBuffer::new();
        begin_frame(tx, 0, id, MessageType::Answer, request_id)
            .expect("owned buffer cannot fail to grow");
    }
}

/// What a client sees after triaging a reply frame.
#[derive(Debug, PartialEq, Eq)]
pub enum StandardReply {
    /// Method completed without out-parameters.
    Success,
    /// User-declared exception follows the header.
    Exception,
    /// Not a standard reply; the caller decodes an argument-carrying
    /// response such as `BlockResponse`.
    Unhandled(MessageId),
}

/// Client-side triage of a reply buffer: maps the error taxonomy onto
/// [`RpcError`], passes everything else through.
pub fn handle_standard_reply(buf: &FlatBuffer) -> Result<StandardReply, RpcError> {
    let header = MessageHeader::read(buf.cdata()).ok_or(RpcError::BadInput)?;
    let id = header.message_id().map_err(|_| RpcError::UnknownMessageId)?;

    match id {
        MessageId::Success => Ok(StandardReply::Success),
        MessageId::Exception => Ok(StandardReply::Exception),
        other => match RpcError::from_message_id(other) {
            Some(err) => Err(err),
            None => Ok(StandardReply::Unhandled(other)),
        },
    }
}
