// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! WebSocket transport.
//!
//! Message boundaries are WS binary frames, so no explicit length prefix is
//! read here — each message is one complete flat-buffer frame, header
//! first. The server side upgrades plain TCP connections accepted on the
//! HTTP port; `wss://` URLs participate in endpoint selection but the
//! secured variant requires TLS material wired at deployment.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Result, bail};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::Message;
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

pub struct WsSession {
    ctx: Arc<SessionContext>,
    calls: CallMap,
    outbound: mpsc::UnboundedSender<FlatBuffer>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl WsSession {
    pub(crate) async fn connect(
        rpc: &Arc<Rpc>,
        endpoint: Endpoint,
    ) -> Result<Arc<Self>> {
        let scheme = match &endpoint {
            Endpoint::WebSocket { .. } => "ws",
            Endpoint::SecuredWebSocket { .. } => "wss",
            other => bail!("not a websocket endpoint: {other}"),
        };
        let url = format!("{scheme}://{}:{}/rpc", endpoint.hostname(), endpoint.port());

        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;

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

        tokio::spawn(Arc::clone(&session).pump(Arc::downgrade(rpc), ws, outbound_rx));
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

    async fn pump<S>(
        self: Arc<Self>,
        rpc: Weak<Rpc>,
        ws: tokio_tungstenite::WebSocketStream<S>,
        mut outbound_rx: mpsc::UnboundedReceiver<FlatBuffer>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = outbound_rx.recv() => {
                    let Some(fb) = maybe else { break };
                    let msg = Message::Binary(Bytes::copy_from_slice(fb.cdata()));
                    if let Err(e) = sink.send(msg).await {
                        warn!("ws write failed: {e}");
                        break;
                    }
                },
                msg = stream.next() => {
                    match msg {
                        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                        Some(Ok(Message::Binary(data))) => {
                            if self.on_message(&rpc, data).is_err() {
                                break;
                            }
                        },
                        // Pings are answered by tungstenite internally.
                        Some(Ok(_)) => {},
                    }
                },
            }
        }

        self.shutdown();
    }

    fn on_message(&self, rpc: &Weak<Rpc>, data: Bytes) -> Result<()> {
        if data.len() < HEADER_LEN || data.len() > MAX_MESSAGE_SIZE as usize {
            bail!("bad ws message size: {}", data.len());
        }
        let frame = FlatBuffer::from_vec(data.to_vec());
        let Some(header) = MessageHeader::read(frame.cdata()) else {
            bail!("ws frame shorter than header");
        };

        if header.is_answer() {
            let request_id = header.request_id.get();
            if !self.calls.complete(request_id, frame) {
                debug!(request_id, "ws answer with no pending call");
            }
            return Ok(());
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
        Ok(())
    }
}

/// Accept loop for the HTTP port: upgrades each connection to WS and serves
/// it like a TCP session, minus the length prefix.
pub(crate) async fn run_ws_listener(
    rpc: Arc<Rpc>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = listener.local_addr()?.port();
    info!(port, "ws listener started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => {
                let (stream, peer) = res?;
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_ws_connection(
                    Arc::clone(&rpc),
                    stream,
                    Endpoint::WebSocket {
                        host: peer.ip().to_string(),
                        port: peer.port(),
                    },
                    shutdown.clone(),
                ));
            },
        }
    }

    info!(port, "ws listener stopped");
    Ok(())
}

async fn serve_ws_connection(
    rpc: Arc<Rpc>,
    stream: TcpStream,
    peer: Endpoint,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("ws upgrade failed: {e}");
            return;
        },
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<FlatBuffer>();
    let ctx = SessionContext::new(&rpc, peer);
    {
        let tx = outbound_tx.clone();
        ctx.streams.set_send(Arc::new(move |fb| {
            let _ = tx.send(fb);
        }));
    }

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = outbound_rx.recv() => {
                let Some(fb) = maybe else { break };
                let msg = Message::Binary(Bytes::copy_from_slice(fb.cdata()));
                if sink.send(msg).await.is_err() {
                    break;
                }
            },
            msg = stream.next() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Binary(data))) => {
                        if serve_ws_message(&rpc, &ctx, data, &outbound_tx).is_err() {
                            break;
                        }
                    },
                    Some(Ok(_)) => {},
                }
            },
        }
    }

    ctx.streams.cancel_all();
}

fn serve_ws_message(
    rpc: &Arc<Rpc>,
    ctx: &Arc<SessionContext>,
    data: Bytes,
    outbound: &mpsc::UnboundedSender<FlatBuffer>,
) -> Result<()> {
    if data.len() < HEADER_LEN || data.len() > MAX_MESSAGE_SIZE as usize {
        bail!("bad ws message size: {}", data.len());
    }
    let frame = FlatBuffer::from_vec(data.to_vec());
    if MessageHeader::read(frame.cdata()).is_some_and(MessageHeader::is_answer) {
        debug!("ignoring answer frame on a serving ws session");
        return Ok(());
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
    Ok(())
}
