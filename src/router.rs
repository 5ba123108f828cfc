// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The message router: parses an inbound frame's header and drives the
//! correct path — servant dispatch, reference bookkeeping or stream
//! control.
//!
//! Framing violations (truncated header, inconsistent size) are *local*
//! errors: the function returns `Err`, the transport closes the session and
//! no reply is produced. Dispatch-level failures (missing POA or object,
//! bad input, unknown function) answer with a standard reply instead.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::{
    buffer::FlatBuffer,
    runtime::{
        rpc::Rpc,
        servant::{Dispatch, make_simple_answer},
    },
    session::context::SessionContext,
    stream::StreamManager,
    utils::HexPreview,
    wire::{
        call::{CallHeader, ObjectIdLocal},
        header::{MessageHeader, MessageId},
        stream_msgs::{
            STREAM_FLAG_UNRELIABLE, StreamCancel, StreamChunk, StreamComplete,
            StreamError, StreamInit,
        },
    },
};

/// What the transport must do after the router handled one frame.
pub enum FrameResult {
    /// Nothing to send back.
    NoReply,
    /// `tx` holds a complete answer frame.
    Reply,
    /// Send `tx`, then run the action (stream pump startup ordering).
    ReplyThen(Box<dyn FnOnce() + Send>),
}

impl FrameResult {
    #[inline]
    pub fn needs_reply(&self) -> bool {
        !matches!(self, FrameResult::NoReply)
    }
}

/// Handles one complete inbound frame.
pub fn handle_frame(
    rpc: &Arc<Rpc>,
    ctx: &Arc<SessionContext>,
    rx: &FlatBuffer,
    tx: &mut FlatBuffer,
) -> Result<FrameResult> {
    let Some(header) = MessageHeader::read(rx.cdata()) else {
        bail!("frame shorter than header: {} bytes", rx.size());
    };
    if header.size.get() as usize + 4 != rx.size() {
        bail!(
            "header size {} inconsistent with frame of {} bytes",
            header.size.get(),
            rx.size()
        );
    }
    let request_id = header.request_id.get();

    if rpc.cfg().debug_level.traces_every_call() {
        debug!(frame = ?HexPreview(rx.cdata()), "rx");
    }

    let msg_id = match header.message_id() {
        Ok(id) => id,
        Err(e) => {
            warn!("{e}");
            make_simple_answer(tx, MessageId::ErrorUnknownMessageId, request_id);
            return Ok(FrameResult::Reply);
        },
    };

    match msg_id {
        MessageId::FunctionCall => handle_function_call(rpc, ctx, rx, tx, request_id),
        MessageId::AddReference => {
            if let Some(local) = ObjectIdLocal::read(rx.cdata()) {
                let poa_idx = local.poa_idx.get();
                let oid = local.object_id.get();
                match rpc.get_object(poa_idx, oid) {
                    Some(guard) if guard.get().is_some() => {
                        ctx.ref_list.add_ref(guard.entry());
                    },
                    _ => warn!(poa_idx, oid, "AddReference for unknown object"),
                }
            }
            Ok(FrameResult::NoReply)
        },
        MessageId::ReleaseObject => {
            if let Some(local) = ObjectIdLocal::read(rx.cdata()) {
                ctx.ref_list
                    .remove_ref(local.poa_idx.get(), local.object_id.get());
            }
            Ok(FrameResult::NoReply)
        },
        MessageId::StreamInitialization => handle_stream_init(rpc, ctx, rx, tx, request_id),
        MessageId::StreamDataChunk => {
            if let Some(chunk) = StreamChunk::read(rx.cdata()) {
                let data = crate::buffer::access::read_bytes(
                    rx,
                    crate::wire::stream_msgs::STREAM_CHUNK_DATA_AT,
                )
                .unwrap_or_default()
                .to_vec();
                ctx.streams
                    .on_chunk(chunk.stream_id.get(), chunk.sequence.get(), data);
            }
            Ok(FrameResult::NoReply)
        },
        MessageId::StreamCompletion => {
            if let Some(msg) = StreamComplete::read(rx.cdata()) {
                ctx.streams
                    .on_complete(msg.stream_id.get(), msg.final_sequence.get());
            }
            Ok(FrameResult::NoReply)
        },
        MessageId::StreamError => {
            if let Some(msg) = StreamError::read(rx.cdata()) {
                let data = crate::buffer::access::read_bytes(
                    rx,
                    crate::wire::stream_msgs::STREAM_ERROR_DATA_AT,
                )
                .unwrap_or_default()
                .to_vec();
                ctx.streams
                    .on_error(msg.stream_id.get(), msg.error_code.get(), data);
            }
            Ok(FrameResult::NoReply)
        },
        MessageId::StreamCancellation => {
            if let Some(msg) = StreamCancel::read(rx.cdata()) {
                ctx.streams.on_cancel(msg.stream_id.get());
            }
            Ok(FrameResult::NoReply)
        },
        // Answers are correlated by the session before the router runs;
        // one landing here means the peer is confused.
        other => {
            warn!(?other, "unexpected message on serving path");
            make_simple_answer(tx, MessageId::ErrorUnknownMessageId, request_id);
            Ok(FrameResult::Reply)
        },
    }
}

fn handle_function_call(
    rpc: &Arc<Rpc>,
    ctx: &Arc<SessionContext>,
    rx: &FlatBuffer,
    tx: &mut FlatBuffer,
    request_id: u32,
) -> Result<FrameResult> {
    let Some(call) = CallHeader::read(rx.cdata()) else {
        make_simple_answer(tx, MessageId::ErrorBadInput, request_id);
        return Ok(FrameResult::Reply);
    };
    let poa_idx = call.poa_idx.get();
    let object_id = call.object_id.get();
    let interface_idx = call.interface_idx;
    let function_idx = call.function_idx;

    let Some(poa) = rpc.get_poa(poa_idx) else {
        make_simple_answer(tx, MessageId::ErrorPoaNotExist, request_id);
        return Ok(FrameResult::Reply);
    };
    let Some(guard) = poa.get_object(object_id) else {
        make_simple_answer(tx, MessageId::ErrorObjectNotExist, request_id);
        return Ok(FrameResult::Reply);
    };
    let Some(entry) = guard.get() else {
        make_simple_answer(tx, MessageId::ErrorObjectNotExist, request_id);
        return Ok(FrameResult::Reply);
    };

    if !transport_permitted(entry, ctx) {
        make_simple_answer(tx, MessageId::ErrorBadAccess, request_id);
        return Ok(FrameResult::Reply);
    }

    if !entry.servant.validate_input(function_idx, rx) {
        make_simple_answer(tx, MessageId::ErrorBadInput, request_id);
        return Ok(FrameResult::Reply);
    }

    let mut d = Dispatch {
        interface_idx,
        function_idx,
        request_id,
        rx,
        tx,
        ctx,
    };
    entry.servant.dispatch(&mut d);
    Ok(FrameResult::Reply)
}

fn handle_stream_init(
    rpc: &Arc<Rpc>,
    ctx: &Arc<SessionContext>,
    rx: &FlatBuffer,
    tx: &mut FlatBuffer,
    request_id: u32,
) -> Result<FrameResult> {
    let Some(init) = StreamInit::read(rx.cdata()) else {
        make_simple_answer(tx, MessageId::ErrorBadInput, request_id);
        return Ok(FrameResult::Reply);
    };
    let stream_id = init.stream_id.get();
    let unreliable = init.flags.get() & STREAM_FLAG_UNRELIABLE != 0;

    let Some(poa) = rpc.get_poa(init.poa_idx.get()) else {
        make_simple_answer(tx, MessageId::ErrorPoaNotExist, request_id);
        return Ok(FrameResult::Reply);
    };
    let Some(guard) = poa.get_object(init.object_id.get()) else {
        make_simple_answer(tx, MessageId::ErrorObjectNotExist, request_id);
        return Ok(FrameResult::Reply);
    };
    let Some(entry) = guard.get() else {
        make_simple_answer(tx, MessageId::ErrorObjectNotExist, request_id);
        return Ok(FrameResult::Reply);
    };

    let Some(writer) = entry.servant.open_stream(init.func_idx, rx) else {
        make_simple_answer(tx, MessageId::ErrorUnknownFunctionIdx, request_id);
        return Ok(FrameResult::Reply);
    };

    make_simple_answer(tx, MessageId::Success, request_id);

    // Pump startup is deferred until the transport has queued the reply, so
    // the client sees Success before the first chunk.
    let ctx = Arc::clone(ctx);
    Ok(FrameResult::ReplyThen(Box::new(move || {
        StreamManager::register_writer(&ctx, stream_id, writer, unreliable);
    })))
}

/// Checks the activation flags of `entry` against the transport the call
/// arrived on, including the tethering constraint.
fn transport_permitted(
    entry: &crate::runtime::object_table::ObjectEntry,
    ctx: &Arc<SessionContext>,
) -> bool {
    use crate::{endpoint::Endpoint, wire::object_id::ActivationFlags};

    if let Some(bound) = &entry.session_ctx {
        // Tethered objects only answer on their own session.
        match bound.upgrade() {
            Some(bound) => {
                if !Arc::ptr_eq(&bound, ctx) {
                    return false;
                }
            },
            None => return false,
        }
    }

    let flags = entry.activation_flags;
    match ctx.remote_endpoint {
        Endpoint::Tcp { .. } | Endpoint::TcpTethered { .. } => {
            flags.contains(ActivationFlags::ALLOW_TCP)
        },
        Endpoint::WebSocket { .. } => flags.contains(ActivationFlags::ALLOW_WEBSOCKET),
        Endpoint::SecuredWebSocket { .. } => {
            flags.contains(ActivationFlags::ALLOW_SSL_WEBSOCKET)
        },
        Endpoint::Udp { .. } => flags.contains(ActivationFlags::ALLOW_UDP),
        Endpoint::Quic { .. } => flags.contains(ActivationFlags::ALLOW_QUIC),
        Endpoint::SharedMemory { .. } => {
            flags.contains(ActivationFlags::ALLOW_SHARED_MEMORY)
        },
    }
}
