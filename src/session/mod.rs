// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The unified session layer: one enum over the concrete transports plus
//! the request-id correlation machinery they all share.

/// Per-peer session state.
pub mod context;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::{
    buffer::FlatBuffer,
    endpoint::Endpoint,
    runtime::RpcError,
    session::context::SessionContext,
    transport::{shm::ShmClientSession, tcp::TcpSession, ws::WsSession},
};

/// Completion callback of an asynchronous call.
pub type CompletionHandler = Box<dyn FnOnce(Result<FlatBuffer, RpcError>) + Send>;

/// Correlates outbound requests with their answers by request id.
///
/// Ids are allocated monotonically per session and wrap to 1 — zero means
/// "unset" on the wire and is never handed out.
#[derive(Default)]
pub(crate) struct CallMap {
    next_id: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<FlatBuffer>>,
}

impl CallMap {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    pub fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn register(&self, request_id: u32) -> oneshot::Receiver<FlatBuffer> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    pub fn forget(&self, request_id: u32) {
        self.pending.remove(&request_id);
    }

    /// Delivers an answer; `false` when no call is waiting on that id.
    pub fn complete(&self, request_id: u32, buf: FlatBuffer) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => tx.send(buf).is_ok(),
            None => false,
        }
    }

    /// Fails every pending call (receivers observe a closed channel).
    pub fn abort_all(&self) {
        self.pending.clear();
    }
}

/// A live peer connection, independent of transport.
///
/// Cloning is cheap (the variants are `Arc`s). Server-side sessions never
/// initiate calls; invoking `send_receive` on one is a contract violation
/// and fails with `CommFailure`.
#[derive(Clone)]
pub enum Session {
    Tcp(Arc<TcpSession>),
    WebSocket(Arc<WsSession>),
    SharedMemory(Arc<ShmClientSession>),
}

impl Session {
    pub fn ctx(&self) -> &Arc<SessionContext> {
        match self {
            Session::Tcp(s) => s.ctx(),
            Session::WebSocket(s) => s.ctx(),
            Session::SharedMemory(s) => s.ctx(),
        }
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.ctx().remote_endpoint
    }

    /// Sends `buf` and waits for the correlated answer, which replaces the
    /// buffer's contents. Timeout surfaces as [`RpcError::TimedOut`].
    pub async fn send_receive(
        &self,
        buf: FlatBuffer,
        timeout: Duration,
    ) -> Result<FlatBuffer, RpcError> {
        match self {
            Session::Tcp(s) => s.send_receive(buf, timeout).await,
            Session::WebSocket(s) => s.send_receive(buf, timeout).await,
            Session::SharedMemory(s) => s.send_receive(buf, timeout).await,
        }
    }

    /// Fire-and-forget send with no correlation (release notifications,
    /// stream control).
    pub async fn send(&self, buf: FlatBuffer) -> Result<(), RpcError> {
        match self {
            Session::Tcp(s) => s.send(buf),
            Session::WebSocket(s) => s.send(buf),
            Session::SharedMemory(s) => s.send(buf),
        }
    }

    /// Datagram-path send for unreliable payloads. Transports without a
    /// datagram concept fall back to the regular ordered path.
    pub fn send_datagram(&self, buf: FlatBuffer) {
        let _ = match self {
            Session::Tcp(s) => s.send(buf),
            Session::WebSocket(s) => s.send(buf),
            Session::SharedMemory(s) => s.send(buf),
        };
    }

    /// Fires the call off and invokes `handler` (if any) with the outcome.
    pub fn send_receive_async(
        &self,
        buf: FlatBuffer,
        handler: Option<CompletionHandler>,
        timeout: Duration,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let res = this.send_receive(buf, timeout).await;
            if let Some(handler) = handler {
                handler(res);
            }
        });
    }

    /// Idempotently tears the session down: pending calls fail with an
    /// aborted status, streams are cancelled, the transport closes.
    pub fn shutdown(&self) {
        match self {
            Session::Tcp(s) => s.shutdown(),
            Session::WebSocket(s) => s.shutdown(),
            Session::SharedMemory(s) => s.shutdown(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Session::Tcp(s) => s.is_closed(),
            Session::WebSocket(s) => s.is_closed(),
            Session::SharedMemory(s) => s.is_closed(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Session::Tcp(_) => "tcp",
            Session::WebSocket(_) => "ws",
            Session::SharedMemory(_) => "shm",
        };
        f.debug_struct("Session")
            .field("kind", &kind)
            .field("remote", &self.remote_endpoint().to_string())
            .finish()
    }
}
