// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The runtime handle: owns the POA slots, the session registry, every
//! listener and the UDP connection cache. There are no process-wide
//! globals — everything hangs off an `Arc<Rpc>` and generated code reaches
//! the runtime through the session context.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    buffer::FlatBuffer,
    cfg::config::Config,
    endpoint::Endpoint,
    runtime::{
        RpcError,
        object_table::{IdPolicy, ObjectGuard},
        poa::{Lifespan, Poa, PoaBuilder},
        proxy::ObjectProxy,
    },
    session::{CompletionHandler, Session, context::SessionContext},
    shm::listener::ShmListener,
    transport::{
        shm::{ShmClientSession, ShmServerSession},
        tcp::{TcpSession, run_tcp_listener},
        udp::{UdpConnection, run_udp_listener},
        ws::{WsSession, run_ws_listener},
    },
    utils::generate_guid,
    wire::object_id::{ObjectFlags, ObjectIdData},
};

/// Fixed POA index space per runtime.
pub const MAX_POAS: usize = 6;

/// Default per-attempt timeout of reliable UDP calls.
pub const UDP_RELIABLE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default resend budget of reliable UDP calls.
pub const UDP_MAX_RETRIES: u32 = 3;

pub struct Rpc {
    cfg: Config,
    guid: [u8; 16],
    guid_hex: String,
    handle: tokio::runtime::Handle,
    poas: RwLock<[Option<Arc<Poa>>; MAX_POAS]>,
    sessions: Mutex<Vec<Session>>,
    udp_conns: DashMap<String, Arc<UdpConnection>>,
    shm_listener: Mutex<Option<ShmListener>>,
    shm_server_sessions: Mutex<Vec<Arc<ShmServerSession>>>,
    shutdown_token: CancellationToken,
    down: AtomicBool,
}

impl Rpc {
    /// Brings the runtime up: binds every configured listener and returns
    /// the shared handle. Must run inside a tokio runtime.
    pub async fn start(cfg: Config) -> Result<Arc<Self>> {
        let (guid, guid_hex) = generate_guid();
        info!(uuid = %guid_hex, "nprpc runtime starting");

        let rpc = Arc::new(Self {
            cfg,
            guid,
            guid_hex,
            handle: tokio::runtime::Handle::current(),
            poas: RwLock::new(std::array::from_fn(|_| None)),
            sessions: Mutex::new(Vec::new()),
            udp_conns: DashMap::new(),
            shm_listener: Mutex::new(None),
            shm_server_sessions: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            down: AtomicBool::new(false),
        });

        // Listeners bind here, not in their tasks: the runtime is reachable
        // the moment start() returns.
        if rpc.cfg.listen.tcp_port != 0 {
            let listener =
                tokio::net::TcpListener::bind(("0.0.0.0", rpc.cfg.listen.tcp_port))
                    .await
                    .context("failed to bind tcp listener")?;
            let task = run_tcp_listener(
                Arc::clone(&rpc),
                listener,
                rpc.shutdown_token.child_token(),
            );
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!("tcp listener failed: {e}");
                }
            });
        }

        if rpc.cfg.listen.http_port != 0 {
            let listener =
                tokio::net::TcpListener::bind(("0.0.0.0", rpc.cfg.listen.http_port))
                    .await
                    .context("failed to bind ws listener")?;
            let task = run_ws_listener(
                Arc::clone(&rpc),
                listener,
                rpc.shutdown_token.child_token(),
            );
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!("ws listener failed: {e}");
                }
            });
        }

        if rpc.cfg.listen.udp_port != 0 {
            let socket =
                tokio::net::UdpSocket::bind(("0.0.0.0", rpc.cfg.listen.udp_port))
                    .await
                    .context("failed to bind udp listener")?;
            let task = run_udp_listener(
                Arc::clone(&rpc),
                socket,
                rpc.shutdown_token.child_token(),
            );
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!("udp listener failed: {e}");
                }
            });
        }

        if let Some(listener_name) = rpc.cfg.shm.listener_name.clone() {
            let accept_rpc = Arc::downgrade(&rpc);
            let listener = ShmListener::start(
                &listener_name,
                rpc.cfg.shm.ring_capacity,
                Box::new(move |channel| {
                    let Some(rpc) = accept_rpc.upgrade() else {
                        return;
                    };
                    let session = ShmServerSession::start(&rpc, channel);
                    rpc.shm_server_sessions
                        .lock()
                        .expect("shm session list poisoned")
                        .push(session);
                }),
            )?;
            *rpc.shm_listener.lock().expect("shm listener poisoned") = Some(listener);
        }

        Ok(rpc)
    }

    #[inline]
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// This process's origin GUID.
    #[inline]
    pub fn guid(&self) -> &[u8; 16] {
        &self.guid
    }

    #[inline]
    pub fn guid_hex(&self) -> &str {
        &self.guid_hex
    }

    #[inline]
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Listener id advertised in `mem://` activation URLs, when the shm
    /// listener is up.
    pub fn shm_listener_id(&self) -> Option<String> {
        self.shm_listener
            .lock()
            .expect("shm listener poisoned")
            .as_ref()
            .and(self.cfg.shm.listener_name.clone())
    }

    // ── POAs ─────────────────────────────────────────────────────────────

    pub fn create_poa(self: &Arc<Self>) -> PoaBuilder {
        PoaBuilder::new(self)
    }

    pub(crate) fn register_poa(
        self: &Arc<Self>,
        max_objects: u32,
        lifespan: Lifespan,
        id_policy: IdPolicy,
    ) -> Result<Arc<Poa>> {
        let mut poas = self.poas.write().expect("poa table poisoned");
        let idx = poas
            .iter()
            .position(|slot| slot.is_none())
            .context("maximum number of POAs reached")?;
        let poa = Arc::new(Poa::new(
            idx as u16,
            max_objects,
            lifespan,
            id_policy,
            Arc::downgrade(self),
        ));
        poas[idx] = Some(Arc::clone(&poa));
        Ok(poa)
    }

    pub fn get_poa(&self, idx: u16) -> Option<Arc<Poa>> {
        self.poas
            .read()
            .expect("poa table poisoned")
            .get(idx as usize)?
            .clone()
    }

    pub fn destroy_poa(&self, poa: &Arc<Poa>) {
        let mut poas = self.poas.write().expect("poa table poisoned");
        let idx = poa.index() as usize;
        if idx < poas.len() {
            poas[idx] = None;
        }
    }

    /// Guarded object lookup across all POAs.
    pub fn get_object(&self, poa_idx: u16, object_id: u64) -> Option<ObjectGuard> {
        self.get_poa(poa_idx)?.get_object(object_id)
    }

    // ── sessions & calls ─────────────────────────────────────────────────

    /// Finds or establishes the session for `endpoint`.
    pub async fn get_session(
        self: &Arc<Self>,
        endpoint: &Endpoint,
    ) -> Result<Session, RpcError> {
        if self.down.load(Ordering::Acquire) {
            return Err(RpcError::Aborted);
        }

        if let Some(existing) = self.find_session(endpoint) {
            return Ok(existing);
        }

        let created = match endpoint {
            Endpoint::TcpTethered { .. } => {
                return Err(RpcError::CommFailure(
                    "cannot create a tethered TCP connection".into(),
                ));
            },
            Endpoint::Tcp { .. } => TcpSession::connect(self, endpoint.clone())
                .await
                .map(Session::Tcp),
            Endpoint::WebSocket { .. } | Endpoint::SecuredWebSocket { .. } => {
                WsSession::connect(self, endpoint.clone())
                    .await
                    .map(Session::WebSocket)
            },
            Endpoint::SharedMemory { .. } => {
                ShmClientSession::connect(self, endpoint.clone())
                    .await
                    .map(Session::SharedMemory)
            },
            Endpoint::Udp { .. } | Endpoint::Quic { .. } => {
                return Err(RpcError::CommFailure(format!(
                    "no session transport for endpoint {endpoint}"
                )));
            },
        }
        .map_err(|e| RpcError::CommFailure(e.to_string()))?;

        let mut sessions = self.sessions.lock().expect("session list poisoned");
        // Another task may have raced the connect; prefer the earlier one.
        if let Some(existing) = sessions
            .iter()
            .find(|s| s.remote_endpoint() == endpoint && !s.is_closed())
        {
            created.shutdown();
            return Ok(existing.clone());
        }
        sessions.retain(|s| !s.is_closed());
        sessions.push(created.clone());
        Ok(created)
    }

    fn find_session(&self, endpoint: &Endpoint) -> Option<Session> {
        let sessions = self.sessions.lock().expect("session list poisoned");
        sessions
            .iter()
            .find(|s| s.remote_endpoint() == endpoint && !s.is_closed())
            .cloned()
    }

    pub fn has_session(&self, endpoint: &Endpoint) -> bool {
        self.find_session(endpoint).is_some()
    }

    /// Blocking-style call: send, wait, return the reply buffer.
    pub async fn call(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
        timeout: Option<Duration>,
    ) -> Result<FlatBuffer, RpcError> {
        let timeout = timeout.unwrap_or(self.cfg.limits.default_call_timeout);
        self.get_session(endpoint)
            .await?
            .send_receive(buf, timeout)
            .await
    }

    /// Fire-and-forget or handler-completed call.
    pub async fn call_async(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
        handler: Option<CompletionHandler>,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        let timeout = timeout.unwrap_or(self.cfg.limits.default_call_timeout);
        let session = self.get_session(endpoint).await?;
        session.send_receive_async(buf, handler, timeout);
        Ok(())
    }

    async fn udp_connection(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Arc<UdpConnection>, RpcError> {
        let key = format!("{host}:{port}");
        if let Some(conn) = self.udp_conns.get(&key) {
            return Ok(Arc::clone(conn.value()));
        }
        let conn = UdpConnection::connect(host, port)
            .await
            .map_err(|e| RpcError::CommFailure(e.to_string()))?;
        self.udp_conns.insert(key, Arc::clone(&conn));
        Ok(conn)
    }

    /// Fire-and-forget datagram (no ACK, no retransmit). Non-UDP endpoints
    /// fall back to an async call whose reply is discarded.
    pub async fn send_udp(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
    ) -> Result<(), RpcError> {
        match endpoint {
            Endpoint::Udp { host, port } => {
                self.udp_connection(host, *port).await?.send(buf).await
            },
            _ => self.call_async(endpoint, buf, None, Some(Duration::ZERO)).await,
        }
    }

    /// Reliable UDP call with retransmits; non-UDP endpoints degrade to a
    /// normal call with a stretched timeout.
    pub async fn call_udp_reliable(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<FlatBuffer, RpcError> {
        match endpoint {
            Endpoint::Udp { host, port } => {
                self.udp_connection(host, *port)
                    .await?
                    .call_reliable(buf, timeout, max_retries)
                    .await
            },
            _ => self.call(endpoint, buf, Some(timeout * (max_retries + 1))).await,
        }
    }

    /// Async reliable UDP call; the handler observes the outcome.
    pub async fn call_udp_reliable_async(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
        handler: Option<CompletionHandler>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<(), RpcError> {
        match endpoint {
            Endpoint::Udp { host, port } => {
                let conn = self.udp_connection(host, *port).await?;
                tokio::spawn(async move {
                    let res = conn.call_reliable(buf, timeout, max_retries).await;
                    if let Some(handler) = handler {
                        handler(res);
                    }
                });
                Ok(())
            },
            _ => {
                self.call_async(endpoint, buf, handler, Some(timeout * (max_retries + 1)))
                    .await
            },
        }
    }

    /// Unreliable send across transports: UDP rides datagrams, everything
    /// else uses the session's datagram path (which may fall back to the
    /// ordered path).
    pub async fn send_unreliable(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        buf: FlatBuffer,
    ) -> Result<(), RpcError> {
        match endpoint {
            Endpoint::Udp { host, port } => {
                self.udp_connection(host, *port).await?.send(buf).await
            },
            _ => {
                self.get_session(endpoint).await?.send_datagram(buf);
                Ok(())
            },
        }
    }

    // ── zero copy ────────────────────────────────────────────────────────

    /// Turns `buf` into a view over a send-ring reservation when the
    /// context's transport is shared memory. `false` leaves `buf` owned —
    /// the caller proceeds with a heap buffer.
    pub fn prepare_zero_copy_buffer(
        &self,
        ctx: &SessionContext,
        buf: &mut FlatBuffer,
        max_size: usize,
    ) -> bool {
        if !ctx.remote_endpoint.is_shared_memory() {
            return false;
        }

        // Server side: the session's own channel.
        if let Some(channel) = ctx.shm_channel() {
            match channel.reserve_write(max_size) {
                Some(res) => {
                    unsafe { buf.set_view(res.data, res.max_size, res.write_idx) };
                    return true;
                },
                None => return false,
            }
        }

        // Client side: the cached session for this endpoint.
        match self.find_session(&ctx.remote_endpoint) {
            Some(Session::SharedMemory(s)) => s.prepare_write_buffer(buf, max_size),
            _ => false,
        }
    }

    // ── well-known objects ───────────────────────────────────────────────

    /// Builds a proxy for the conventionally located nameserver.
    pub fn get_nameserver(self: &Arc<Self>, nameserver_ip: &str) -> Result<ObjectProxy> {
        let data = ObjectIdData {
            object_id: 0,
            poa_idx: 0,
            flags: ObjectFlags::PERSISTENT,
            origin: [0; 16],
            class_id: "nprpc.Nameserver".to_string(),
            urls: format!("tcp://{nameserver_ip}:15000;ws://{nameserver_ip}:15001;"),
        };
        ObjectProxy::from_data(self, data, None)
    }

    // ── teardown ─────────────────────────────────────────────────────────

    /// Idempotent full stop: listeners first, then every open session. All
    /// pending handlers observe an aborted/comm-failure status exactly
    /// once.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("nprpc runtime shutting down");

        self.shutdown_token.cancel();

        if let Some(mut listener) =
            self.shm_listener.lock().expect("shm listener poisoned").take()
        {
            listener.stop();
        }

        let sessions =
            std::mem::take(&mut *self.sessions.lock().expect("session list poisoned"));
        for session in &sessions {
            session.shutdown();
        }

        let shm_sessions = std::mem::take(
            &mut *self
                .shm_server_sessions
                .lock()
                .expect("shm session list poisoned"),
        );
        for session in &shm_sessions {
            session.shutdown();
        }

        for entry in self.udp_conns.iter() {
            entry.value().close();
        }
        self.udp_conns.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("uuid", &self.guid_hex)
            .field("tcp_port", &self.cfg.listen.tcp_port)
            .field("http_port", &self.cfg.listen.http_port)
            .field("udp_port", &self.cfg.listen.udp_port)
            .finish()
    }
}
