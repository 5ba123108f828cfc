// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! UDP transport: fire-and-forget datagrams plus a reliable mode with
//! request-id correlation and fixed-interval retransmits.
//!
//! A connection is a per-peer socket cached process-wide by `host:port`.
//! Reliable calls register in the pending map, send, and resend the same
//! frame on every timeout up to `max_retries`; the last failure surfaces as
//! a timeout. The receive loop starts with the first reliable call and
//! matches answers by request id.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use tokio::net::UdpSocket;
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

/// Datagrams above this are rejected before hitting the socket.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote: std::net::SocketAddr,
    calls: CallMap,
    receiving: AtomicBool,
    cancel: CancellationToken,
}

impl UdpConnection {
    pub(crate) async fn connect(host: &str, port: u16) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let remote = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("failed to resolve UDP endpoint: {host}"))?;

        info!(%remote, "udp connection created");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            remote,
            calls: CallMap::new(),
            receiving: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }))
    }

    /// Fire-and-forget datagram; no ACK, no retransmit.
    pub async fn send(&self, buf: FlatBuffer) -> Result<(), RpcError> {
        let data = buf.cdata();
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(RpcError::BadInput);
        }
        self.socket
            .send_to(data, self.remote)
            .await
            .map_err(|e| RpcError::CommFailure(e.to_string()))?;
        Ok(())
    }

    /// Reliable call: correlates by request id, retransmits the same frame
    /// on each timeout, gives up after `max_retries` resends.
    pub async fn call_reliable(
        self: &Arc<Self>,
        mut buf: FlatBuffer,
        timeout: std::time::Duration,
        max_retries: u32,
    ) -> Result<FlatBuffer, RpcError> {
        let header = MessageHeader::read_mut(buf.data_mut()).ok_or(RpcError::BadInput)?;
        let mut request_id = header.request_id.get();
        if request_id == 0 {
            request_id = self.calls.next_request_id();
            header.request_id.set(request_id);
        }

        self.ensure_receiving();

        let mut rx = self.calls.register(request_id);

        let mut attempt: u32 = 0;
        loop {
            if let Err(e) = self.send_raw(buf.cdata()).await {
                self.calls.forget(request_id);
                return Err(e);
            }

            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(RpcError::Aborted),
                Err(_) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(request_id, max_retries, "udp call timed out");
                        self.calls.forget(request_id);
                        return Err(RpcError::TimedOut);
                    }
                    debug!(request_id, attempt, "udp retransmit");
                },
            }
        }
    }

    async fn send_raw(&self, data: &[u8]) -> Result<(), RpcError> {
        self.socket
            .send_to(data, self.remote)
            .await
            .map(|_| ())
            .map_err(|e| RpcError::CommFailure(e.to_string()))
    }

    /// Starts the answer-matching receive loop on first use.
    fn ensure_receiving(self: &Arc<Self>) {
        if self.receiving.swap(true, Ordering::AcqRel) {
            return;
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    res = conn.socket.recv_from(&mut buf) => {
                        let Ok((n, _from)) = res else { break };
                        if n < HEADER_LEN {
                            debug!(n, "short udp answer dropped");
                            continue;
                        }
                        let frame = FlatBuffer::from_vec(buf[..n].to_vec());
                        let Some(header) = MessageHeader::read(frame.cdata()) else {
                            continue;
                        };
                        let request_id = header.request_id.get();
                        if !conn.calls.complete(request_id, frame) {
                            debug!(request_id, "no pending udp call");
                        }
                    },
                }
            }
        });
    }

    /// Fails all pending calls and stops the receive loop.
    pub fn close(&self) {
        self.cancel.cancel();
        self.calls.abort_all();
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Server side: one socket, one task; each datagram is parsed, dispatched
/// and answered in place. Oversized or inconsistent datagrams are dropped
/// silently (there is no connection to close).
pub(crate) async fn run_udp_listener(
    rpc: Arc<Rpc>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) -> Result<()> {
    let socket = Arc::new(socket);
    let port = socket.local_addr()?.port();
    info!(port, "udp listener started");

    let mut contexts: std::collections::HashMap<
        std::net::SocketAddr,
        Arc<SessionContext>,
    > = std::collections::HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("udp recv failed: {e}");
                        continue;
                    },
                };
                if n < HEADER_LEN || n > MAX_MESSAGE_SIZE as usize {
                    continue;
                }

                let frame = FlatBuffer::from_vec(buf[..n].to_vec());
                let Some(header) = MessageHeader::read(frame.cdata()) else {
                    continue;
                };
                if header.is_answer() {
                    continue;
                }

                let ctx = contexts.entry(peer).or_insert_with(|| {
                    let ctx = SessionContext::new(&rpc, Endpoint::Udp {
                        host: peer.ip().to_string(),
                        port: peer.port(),
                    });
                    // Stream chunks for UDP peers ride datagrams too.
                    let sock = Arc::clone(&socket);
                    let handle = rpc.handle().clone();
                    ctx.streams.set_send(Arc::new(move |fb: FlatBuffer| {
                        let sock = Arc::clone(&sock);
                        handle.spawn(async move {
                            let _ = sock.send_to(fb.cdata(), peer).await;
                        });
                    }));
                    ctx
                });

                let mut tx = FlatBuffer::new();
                match handle_frame(&rpc, ctx, &frame, &mut tx) {
                    Ok(FrameResult::NoReply) => {},
                    Ok(FrameResult::Reply) => {
                        let _ = socket.send_to(tx.cdata(), peer).await;
                    },
                    Ok(FrameResult::ReplyThen(after)) => {
                        let _ = socket.send_to(tx.cdata(), peer).await;
                        after();
                    },
                    Err(e) => {
                        // Datagram transports drop malformed input.
                        debug!(%peer, "dropping udp frame: {e}");
                    },
                }
            },
        }
    }

    info!(port, "udp listener stopped");
    Ok(())
}
