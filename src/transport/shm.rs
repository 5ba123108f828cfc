// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared-memory sessions on top of ring-buffer channels.
//!
//! The server side reads requests in place (`ReadView` → view-mode flat
//! buffer), dispatches, and commits the reply into a reservation of its
//! send ring — a full round trip without a single heap copy when the
//! reservation holds. The client side correlates answers through the usual
//! call map; its frames are written through a reservation when the caller
//! prepared one, else by copy.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::{
    buffer::FlatBuffer,
    endpoint::Endpoint,
    router::{FrameResult, handle_frame},
    runtime::{RpcError, rpc::Rpc},
    session::{CallMap, context::SessionContext},
    shm::{channel::ShmChannel, listener::connect_to_listener, ring::ReadView},
    wire::header::{HEADER_LEN, MessageHeader},
};

pub struct ShmClientSession {
    ctx: Arc<SessionContext>,
    calls: CallMap,
    channel: Arc<ShmChannel>,
    closed: AtomicBool,
}

impl ShmClientSession {
    /// Handshakes against the listener named by the endpoint's channel id.
    /// The blocking shm work runs off the async executor.
    pub(crate) async fn connect(
        rpc: &Arc<Rpc>,
        endpoint: Endpoint,
    ) -> Result<Arc<Self>> {
        let Endpoint::SharedMemory { channel_id } = &endpoint else {
            anyhow::bail!("not a shared-memory endpoint: {endpoint}");
        };

        let listener_id = channel_id.clone();
        let channel = tokio::task::spawn_blocking(move || connect_to_listener(&listener_id))
            .await
            .context("shm connect task failed")??;

        let ctx = SessionContext::new(rpc, endpoint);
        {
            let ch = Arc::clone(&channel);
            ctx.streams.set_send(Arc::new(move |fb: FlatBuffer| {
                ch.write(fb.cdata());
            }));
        }

        let session = Arc::new(Self {
            ctx,
            calls: CallMap::new(),
            channel,
            closed: AtomicBool::new(false),
        });

        session.start_reading(Arc::downgrade(rpc));
        Ok(session)
    }

    fn start_reading(self: &Arc<Self>, rpc: Weak<Rpc>) {
        let session = Arc::clone(self);
        self.channel.start_reading(move |view| {
            session.on_record(&rpc, view);
        });
    }

    /// Runs on the channel's reader thread.
    fn on_record(&self, rpc: &Weak<Rpc>, view: &ReadView) {
        if view.size < HEADER_LEN {
            warn!(size = view.size, "short shm record");
            self.channel.commit_read(view);
            return;
        }

        // Answers are copied out so the ring slot frees immediately.
        let frame = unsafe {
            FlatBuffer::view_of_record(view.data as *mut u8, view.size)
        };
        let Some(header) = MessageHeader::read(frame.cdata()) else {
            self.channel.commit_read(view);
            return;
        };

        if header.is_answer() {
            let request_id = header.request_id.get();
            let owned = frame.to_owned_buffer();
            self.channel.commit_read(view);
            if !self.calls.complete(request_id, owned) {
                debug!(request_id, "shm answer with no pending call");
            }
            return;
        }

        // Inbound request on the client session (tethered callback).
        let Some(rpc) = rpc.upgrade() else {
            self.channel.commit_read(view);
            return;
        };
        let mut tx = FlatBuffer::new();
        let result = handle_frame(&rpc, &self.ctx, &frame, &mut tx);
        self.channel.commit_read(view);
        match result {
            Ok(FrameResult::NoReply) => {},
            Ok(FrameResult::Reply) => {
                self.channel.write(tx.cdata());
            },
            Ok(FrameResult::ReplyThen(after)) => {
                self.channel.write(tx.cdata());
                after();
            },
            Err(e) => warn!("shm client dispatch failed: {e}"),
        }
    }

    pub fn ctx(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.stop();
        self.calls.abort_all();
        self.ctx.streams.cancel_all();
    }

    /// Reserves `max_size` bytes in the send ring and turns `buf` into a
    /// view over the reservation. `false` when the ring lacks space — the
    /// caller keeps its owned buffer.
    pub fn prepare_write_buffer(&self, buf: &mut FlatBuffer, max_size: usize) -> bool {
        match self.channel.reserve_write(max_size) {
            Some(res) => {
                unsafe { buf.set_view(res.data, res.max_size, res.write_idx) };
                true
            },
            None => false,
        }
    }

    /// Ships one frame: commits the reservation for view-mode buffers,
    /// copies otherwise.
    fn ship(&self, buf: &FlatBuffer) -> Result<(), RpcError> {
        if let Some(write_idx) = buf.reservation_write_idx() {
            let max = buf.max_size().unwrap_or(buf.size());
            self.channel.commit_write_at(write_idx, max, buf.size());
            Ok(())
        } else if self.channel.write(buf.cdata()) {
            Ok(())
        } else {
            Err(RpcError::CommFailure("shm send ring full".into()))
        }
    }

    pub fn send(&self, buf: FlatBuffer) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::CommFailure("session closed".into()));
        }
        self.ship(&buf)
    }

    pub async fn send_receive(
        &self,
        mut buf: FlatBuffer,
        timeout: std::time::Duration,
    ) -> Result<FlatBuffer, RpcError> {
        if self.is_closed() {
            return Err(RpcError::CommFailure("session closed".into()));
        }

        let request_id = self.calls.next_request_id();
        MessageHeader::read_mut(buf.data_mut())
            .ok_or(RpcError::BadInput)?
            .request_id
            .set(request_id);

        let rx = self.calls.register(request_id);
        if let Err(e) = self.ship(&buf) {
            self.calls.forget(request_id);
            return Err(e);
        }
        drop(buf);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) if self.is_closed() => Err(RpcError::Aborted),
            Ok(Err(_)) => Err(RpcError::CommFailure("channel closed".into())),
            Err(_) => {
                self.calls.forget(request_id);
                Err(RpcError::TimedOut)
            },
        }
    }
}

/// Server-side session for one accepted shm connection. Never initiates
/// calls; requests are read zero-copy and answered through send-ring
/// reservations.
pub struct ShmServerSession {
    ctx: Arc<SessionContext>,
    channel: Arc<ShmChannel>,
}

impl ShmServerSession {
    /// Called from the listener's accept handler with the freshly created
    /// channel.
    pub(crate) fn start(rpc: &Arc<Rpc>, channel: Arc<ShmChannel>) -> Arc<Self> {
        let ctx = SessionContext::new(rpc, Endpoint::SharedMemory {
            channel_id: channel.channel_id().to_string(),
        });
        let _ = ctx.shm_channel.set(Arc::downgrade(&channel));
        {
            let ch = Arc::clone(&channel);
            ctx.streams.set_send(Arc::new(move |fb: FlatBuffer| {
                ch.write(fb.cdata());
            }));
        }

        let session = Arc::new(Self {
            ctx,
            channel: Arc::clone(&channel),
        });

        let rpc = Arc::downgrade(rpc);
        let this = Arc::clone(&session);
        channel.start_reading(move |view| {
            this.on_record(&rpc, view);
        });

        session
    }

    pub fn ctx(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn shutdown(&self) {
        self.channel.stop();
        self.ctx.streams.cancel_all();
    }

    /// One request, zero-copy in and (reservation permitting) zero-copy
    /// out. Runs on the channel's reader thread; servants execute here.
    fn on_record(&self, rpc: &Weak<Rpc>, view: &ReadView) {
        if view.size < HEADER_LEN {
            warn!(size = view.size, "short shm record");
            self.channel.commit_read(view);
            return;
        }
        let Some(rpc) = rpc.upgrade() else {
            self.channel.commit_read(view);
            return;
        };

        let rx = unsafe { FlatBuffer::view_of_record(view.data as *mut u8, view.size) };

        // Pre-provision the reply as a view into the send ring; dispatch
        // then serializes straight into shared memory.
        let mut tx = FlatBuffer::new();
        if let Some(res) = self.channel.reserve_write(HEADER_LEN) {
            unsafe { tx.set_view(res.data, res.max_size, res.write_idx) };
        }

        let result = handle_frame(&rpc, &self.ctx, &rx, &mut tx);

        // Dispatch is done reading; free the request slot before shipping
        // the reply.
        self.channel.commit_read(view);

        match result {
            Ok(FrameResult::NoReply) => {
                // Uncommitted reservation stays logically free.
            },
            Ok(FrameResult::Reply) => self.ship_reply(&tx),
            Ok(FrameResult::ReplyThen(after)) => {
                self.ship_reply(&tx);
                after();
            },
            Err(e) => warn!("shm dispatch failed: {e}"),
        }
    }

    fn ship_reply(&self, tx: &FlatBuffer) {
        if let Some(write_idx) = tx.reservation_write_idx() {
            let max = tx.max_size().unwrap_or(tx.size());
            self.channel.commit_write_at(write_idx, max, tx.size());
        } else if !self.channel.write(tx.cdata()) {
            warn!("failed to ship shm reply (ring full)");
        }
    }
}
