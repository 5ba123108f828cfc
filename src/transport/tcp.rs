// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP transport.
//!
//! Framing: every frame starts with the 16-byte message header whose
//! leading `size` field doubles as the length prefix — a reader pulls
//! 4 bytes, then `size` more. Oversized frames close the connection
//! without dispatch.
//!
//! The client session keeps one writer path (an unbounded queue drained by
//! the I/O task), so requests, release notifications and stream frames
//! never interleave mid-frame. Answers correlate by request id; inbound
//! requests (callbacks to objects tethered to this session) run through the
//! router just like on the server.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Result, bail};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::FlatBuffer,
    endpoint::Endpoint,
    router::{FrameResult, handle_frame},
    runtime::{RpcError, rpc::Rpc},
    session::{CallMap, context::SessionContext},
    wire::header::{HEADER_LEN, MAX_MESSAGE_SIZE, MessageHeader},
};

/// Why the pump loop over one socket ended.
enum PumpEnd {
    /// Session shut down or outbound queue closed.
    Closed,
    /// Transport error; a reconnect may be attempted.
    Broken,
}

pub struct TcpSession {
    ctx: Arc<SessionContext>,
    calls: CallMap,
    outbound: mpsc::UnboundedSender<FlatBuffer>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl TcpSession {
    pub(crate) async fn connect(
        rpc: &Arc<Rpc>,
        endpoint: Endpoint,
    ) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", endpoint.hostname(), endpoint.port());
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext::new(rpc, endpoint);
        {
            let tx = outbound_tx.clone();
            ctx.streams.set_send(Arc::new(move |fb| {
                let _ = tx.send(fb);
            }));
        }

        let session = Arc::new(Self {
            ctx,
            calls: CallMap::new(),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&session).supervise(
            Arc::downgrade(rpc),
            addr,
            stream,
            outbound_rx,
        ));

        Ok(session)
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
        self.cancel.cancel();
        self.calls.abort_all();
        self.ctx.streams.cancel_all();
    }

    /// Queues a frame with no expectation of an answer.
    pub fn send(&self, buf: FlatBuffer) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::CommFailure("session closed".into()));
        }
        self.outbound
            .send(buf)
            .map_err(|_| RpcError::CommFailure("session closed".into()))
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
        if self.outbound.send(buf).is_err() {
            self.calls.forget(request_id);
            return Err(RpcError::CommFailure("session closed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) if self.is_closed() => Err(RpcError::Aborted),
            Ok(Err(_)) => Err(RpcError::CommFailure("connection lost".into())),
            Err(_) => {
                self.calls.forget(request_id);
                Err(RpcError::TimedOut)
            },
        }
    }

    /// Owns the socket; restarts it once per disconnect (TCP is the only
    /// transport with reconnect semantics).
    async fn supervise(
        self: Arc<Self>,
        rpc: Weak<Rpc>,
        addr: String,
        mut stream: TcpStream,
        mut outbound_rx: mpsc::UnboundedReceiver<FlatBuffer>,
    ) {
        let mut rxbuf = BytesMut::with_capacity(64 * 1024);
        let mut reconnects: u32 = 0;

        loop {
            let end = self
                .pump(&rpc, &mut stream, &mut rxbuf, &mut outbound_rx, &mut reconnects)
                .await;

            match end {
                PumpEnd::Closed => break,
                PumpEnd::Broken if reconnects == 0 && !self.is_closed() => {
                    reconnects += 1;
                    rxbuf.clear();
                    match TcpStream::connect(&addr).await {
                        Ok(s) => {
                            let _ = s.set_nodelay(true);
                            info!(%addr, "tcp session reconnected");
                            stream = s;
                        },
                        Err(e) => {
                            warn!(%addr, "tcp reconnect failed: {e}");
                            break;
                        },
                    }
                },
                PumpEnd::Broken => break,
            }
        }

        self.shutdown();
    }

    async fn pump(
        &self,
        rpc: &Weak<Rpc>,
        stream: &mut TcpStream,
        rxbuf: &mut BytesMut,
        outbound_rx: &mut mpsc::UnboundedReceiver<FlatBuffer>,
        reconnects: &mut u32,
    ) -> PumpEnd {
        let (mut r, mut w) = stream.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Closed,
                maybe = outbound_rx.recv() => {
                    let Some(fb) = maybe else { return PumpEnd::Closed };
                    if let Err(e) = w.write_all(fb.cdata()).await {
                        warn!("tcp write failed: {e}");
                        return PumpEnd::Broken;
                    }
                },
                res = r.read_buf(rxbuf) => {
                    match res {
                        Err(e) => {
                            warn!("tcp read failed: {e}");
                            return PumpEnd::Broken;
                        },
                        Ok(0) => return PumpEnd::Broken,
                        Ok(_) => {
                            // Successful traffic re-arms the reconnect budget.
                            *reconnects = 0;
                            match self.drain_frames(rpc, rxbuf) {
                                Ok(()) => {},
                                Err(e) => {
                                    warn!("tcp session closing: {e}");
                                    return PumpEnd::Closed;
                                },
                            }
                        },
                    }
                },
            }
        }
    }

    /// Splits complete frames out of the accumulation buffer and routes
    /// them: answers complete pending calls, requests go through the
    /// router.
    fn drain_frames(&self, rpc: &Weak<Rpc>, rxbuf: &mut BytesMut) -> Result<()> {
        while let Some(frame) = take_frame(rxbuf)? {
            let Some(header) = MessageHeader::read(frame.cdata()) else {
                bail!("frame shorter than header");
            };

            if header.is_answer() {
                let request_id = header.request_id.get();
                if !self.calls.complete(request_id, frame) {
                    debug!(request_id, "answer with no pending call");
                }
                continue;
            }

            let Some(rpc) = rpc.upgrade() else {
                bail!("runtime is gone");
            };
            let mut tx = FlatBuffer::new();
            match handle_frame(&rpc, &self.ctx, &frame, &mut tx)? {
                FrameResult::NoReply => {},
                FrameResult::Reply => {
                    let _ = self.outbound.send(tx);
                },
                FrameResult::ReplyThen(after) => {
                    let _ = self.outbound.send(tx);
                    after();
                },
            }
        }
        Ok(())
    }
}

/// Extracts one complete frame from `rxbuf`, or `None` if more bytes are
/// needed. Errors on oversized frames (protocol violation → close).
fn take_frame(rxbuf: &mut BytesMut) -> Result<Option<FlatBuffer>> {
    if rxbuf.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_le_bytes(rxbuf[..4].try_into().expect("4 bytes checked"));
    if size > MAX_MESSAGE_SIZE {
        bail!("oversized frame: {size} bytes");
    }
    let total = size as usize + 4;
    if total < HEADER_LEN {
        bail!("malformed frame: {size} byte size field");
    }
    if rxbuf.len() < total {
        return Ok(None);
    }

    let frame = rxbuf.copy_to_bytes(total);
    Ok(Some(FlatBuffer::from_vec(frame.to_vec())))
}

/// Accept loop: one task per connection, fully synchronous
/// read→dispatch→write on that task. The listener is bound by the caller
/// so the runtime is reachable the moment `Rpc::start` returns.
pub(crate) async fn run_tcp_listener(
    rpc: Arc<Rpc>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = listener.local_addr()?.port();
    info!(port, "tcp listener started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => {
                let (stream, peer) = res?;
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(
                    Arc::clone(&rpc),
                    stream,
                    Endpoint::TcpTethered {
                        host: peer.ip().to_string(),
                        port: peer.port(),
                    },
                    shutdown.clone(),
                ));
            },
        }
    }

    info!(port, "tcp listener stopped");
    Ok(())
}

async fn serve_connection(
    rpc: Arc<Rpc>,
    mut stream: TcpStream,
    peer: Endpoint,
    shutdown: CancellationToken,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<FlatBuffer>();
    let ctx = SessionContext::new(&rpc, peer);
    {
        let tx = outbound_tx.clone();
        ctx.streams.set_send(Arc::new(move |fb| {
            let _ = tx.send(fb);
        }));
    }

    let mut rxbuf = BytesMut::with_capacity(64 * 1024);
    let (mut r, mut w) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = outbound_rx.recv() => {
                let Some(fb) = maybe else { break };
                if let Err(e) = w.write_all(fb.cdata()).await {
                    debug!("server write failed: {e}");
                    break;
                }
            },
            res = r.read_buf(&mut rxbuf) => {
                match res {
                    Err(_) | Ok(0) => break,
                    Ok(_) => {
                        if serve_frames(&rpc, &ctx, &mut rxbuf, &outbound_tx).is_err() {
                            break;
                        }
                    },
                }
            },
        }
    }

    ctx.streams.cancel_all();
    // Dropping ctx releases the peer's reference list.
}

fn serve_frames(
    rpc: &Arc<Rpc>,
    ctx: &Arc<SessionContext>,
    rxbuf: &mut BytesMut,
    outbound: &mpsc::UnboundedSender<FlatBuffer>,
) -> Result<()> {
    while let Some(frame) = take_frame(rxbuf)? {
        if MessageHeader::read(frame.cdata()).is_some_and(MessageHeader::is_answer) {
            // Server-side sessions never initiate calls, so there is no
            // pending request an answer could match.
            debug!("ignoring answer frame on a serving session");
            continue;
        }

        let mut tx = FlatBuffer::new();
        match handle_frame(rpc, ctx, &frame, &mut tx)? {
            FrameResult::NoReply => {},
            FrameResult::Reply => {
                let _ = outbound.send(tx);
            },
            FrameResult::ReplyThen(after) => {
                let _ = outbound.send(tx);
                after();
            },
        }
    }
    Ok(())
}
