// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side object handle: a frozen endpoint plus the distributed
//! reference count protocol.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::{
    buffer::FlatBuffer,
    endpoint::{Endpoint, select_endpoint},
    runtime::{RpcError, rpc::Rpc, servant::handle_standard_reply},
    session::Session,
    stream::{StreamReader, generate_stream_id},
    wire::{
        call::{CALL_HEADER_LEN, CallHeader, OBJECT_ID_LOCAL_LEN, ObjectIdLocal},
        frame::begin_frame,
        header::{MessageId, MessageType},
        object_id::{INVALID_OBJECT_ID, ObjectIdData},
        stream_msgs::{STREAM_FLAG_UNRELIABLE, STREAM_INIT_LEN, StreamInit},
    },
};

pub struct ObjectProxy {
    rpc: Weak<Rpc>,
    data: ObjectIdData,
    endpoint: Endpoint,
    local_ref: AtomicU32,
    timeout_ms: AtomicU64,
}

impl ObjectProxy {
    /// Builds a proxy from received object-id data, selecting the endpoint
    /// once. `remote` is the endpoint of the session the reference arrived
    /// on, if any.
    pub fn from_data(
        rpc: &Arc<Rpc>,
        mut data: ObjectIdData,
        remote: Option<&Endpoint>,
    ) -> Result<Self> {
        if data.object_id == INVALID_OBJECT_ID {
            bail!("object id is invalid");
        }

        let endpoint = if data.is_tethered() {
            // Tethered references ride the exact session they came from.
            let Some(remote) = remote else {
                bail!("tethered object reference without an originating session");
            };
            data.urls = format!("{remote};");
            remote.clone()
        } else {
            let same_host = data.is_same_origin(rpc.guid());
            match select_endpoint(&data.urls, same_host, remote) {
                Some(ep) => ep,
                None => bail!(
                    "cannot select endpoint for object {}: urls {}",
                    data.class_id,
                    data.urls
                ),
            }
        };

        let timeout = rpc.cfg().limits.default_call_timeout;
        Ok(Self {
            rpc: Arc::downgrade(rpc),
            data,
            endpoint,
            local_ref: AtomicU32::new(1),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        })
    }

    /// Reads an object id block out of `buf` at `at` and builds the proxy.
    pub fn from_wire(
        rpc: &Arc<Rpc>,
        buf: &FlatBuffer,
        at: usize,
        remote: Option<&Endpoint>,
    ) -> Result<Self> {
        let data = ObjectIdData::read_from(buf, at)?;
        Self::from_data(rpc, data, remote)
    }

    #[inline]
    pub fn data(&self) -> &ObjectIdData {
        &self.data
    }

    #[inline]
    pub fn class_id(&self) -> &str {
        &self.data.class_id
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[inline]
    pub fn object_id(&self) -> u64 {
        self.data.object_id
    }

    #[inline]
    pub fn poa_idx(&self) -> u16 {
        self.data.poa_idx
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    // ── frame building ───────────────────────────────────────────────────

    /// Starts a `FunctionCall` frame addressed at this object; the argument
    /// block begins at [`crate::wire::call::ARGS_OFFSET`].
    pub fn make_call_frame(
        &self,
        interface_idx: u8,
        function_idx: u8,
        args_len: usize,
    ) -> FlatBuffer {
        let mut buf = FlatBuffer::new();
        begin_frame(
            &mut buf,
            CALL_HEADER_LEN + args_len,
            MessageId::FunctionCall,
            MessageType::Request,
            0,
        )
        .expect("owned buffer cannot fail to grow");

        let call = CallHeader::read_mut(buf.data_mut()).expect("call header present");
        call.poa_idx.set(self.data.poa_idx);
        call.interface_idx = interface_idx;
        call.function_idx = function_idx;
        call.object_id.set(self.data.object_id);
        buf
    }

    fn make_local_frame(&self, msg_id: MessageId) -> FlatBuffer {
        let mut buf = FlatBuffer::new();
        begin_frame(
            &mut buf,
            OBJECT_ID_LOCAL_LEN,
            msg_id,
            MessageType::Request,
            0,
        )
        .expect("owned buffer cannot fail to grow");

        let block = ObjectIdLocal::new(self.data.poa_idx, self.data.object_id);
        buf.data_mut()[crate::wire::header::HEADER_LEN..]
            .copy_from_slice(block.as_bytes());
        buf
    }

    // ── calls ────────────────────────────────────────────────────────────

    /// Sends `buf` on this object's endpoint and returns the reply. UDP
    /// endpoints have no session; they go through the reliable-datagram
    /// path with its retransmit schedule.
    pub async fn call(&self, buf: FlatBuffer) -> Result<FlatBuffer, RpcError> {
        let rpc = self.rpc.upgrade().ok_or(RpcError::Aborted)?;
        match &self.endpoint {
            Endpoint::Udp { .. } => {
                rpc.call_udp_reliable(
                    &self.endpoint,
                    buf,
                    crate::runtime::rpc::UDP_RELIABLE_TIMEOUT,
                    crate::runtime::rpc::UDP_MAX_RETRIES,
                )
                .await
            },
            _ => rpc.call(&self.endpoint, buf, Some(self.get_timeout())).await,
        }
    }

    /// Unreliable fire-and-forget on whatever path the endpoint offers.
    pub async fn send_unreliable(&self, buf: FlatBuffer) -> Result<(), RpcError> {
        let rpc = self.rpc.upgrade().ok_or(RpcError::Aborted)?;
        rpc.send_unreliable(&self.endpoint, buf).await
    }

    /// The session this proxy's calls ride on.
    pub async fn get_session(&self) -> Result<Session, RpcError> {
        let rpc = self.rpc.upgrade().ok_or(RpcError::Aborted)?;
        rpc.get_session(&self.endpoint).await
    }

    /// Asks the transport for a zero-copy send buffer; leaves `buf` owned
    /// when the endpoint is not shared memory.
    pub async fn prepare_zero_copy_buffer(
        &self,
        buf: &mut FlatBuffer,
        max_size: usize,
    ) -> bool {
        let Some(rpc) = self.rpc.upgrade() else {
            return false;
        };
        let Ok(session) = self.get_session().await else {
            return false;
        };
        rpc.prepare_zero_copy_buffer(session.ctx(), buf, max_size)
    }

    /// Opens a server→client stream produced by `function_idx`. The reader
    /// is registered before the `StreamInitialization` goes out, so no
    /// chunk can slip past it.
    pub async fn init_stream(
        &self,
        interface_idx: u8,
        function_idx: u8,
        unreliable: bool,
    ) -> Result<StreamReader, RpcError> {
        let session = self.get_session().await?;
        let stream_id = generate_stream_id();
        let reader = session.ctx().streams.register_reader(stream_id);

        let mut buf = FlatBuffer::new();
        begin_frame(
            &mut buf,
            STREAM_INIT_LEN,
            MessageId::StreamInitialization,
            MessageType::Request,
            0,
        )
        .expect("owned buffer cannot fail to grow");
        {
            let init = StreamInit::read_mut(buf.data_mut()).expect("init block present");
            init.stream_id.set(stream_id);
            init.object_id.set(self.data.object_id);
            init.poa_idx.set(self.data.poa_idx);
            init.interface_idx = interface_idx;
            init.func_idx = function_idx;
            init.flags
                .set(if unreliable { STREAM_FLAG_UNRELIABLE } else { 0 });
        }

        let reply = session.send_receive(buf, self.get_timeout()).await?;
        handle_standard_reply(&reply)?;
        Ok(reader)
    }

    // ── distributed reference count ──────────────────────────────────────

    /// Local increment; the 0→1-style first acquisition on a non-persistent
    /// object posts `AddReference` to the owning peer.
    pub fn add_ref(&self) -> u32 {
        let cnt = self.local_ref.fetch_add(1, Ordering::AcqRel);
        if self.data.is_persistent() || cnt != 0 {
            return cnt + 1;
        }
        self.post_reference_message(MessageId::AddReference);
        cnt + 1
    }

    /// Local decrement; the last release on a transient object tells the
    /// peer, best-effort.
    pub fn release(&self) -> u32 {
        let cnt = self.local_ref.fetch_sub(1, Ordering::AcqRel) - 1;
        if cnt != 0 {
            return cnt;
        }
        if !self.data.is_persistent() {
            self.send_release_best_effort();
        }
        0
    }

    fn send_release_best_effort(&self) {
        let Some(rpc) = self.rpc.upgrade() else {
            // Runtime already gone; nothing to notify.
            return;
        };

        if self.endpoint.is_tethered() && !rpc.has_session(&self.endpoint) {
            // The session was closed and cannot be reopened.
            debug!("skipping ReleaseObject: tethered session is gone");
            return;
        }

        self.post_reference_message(MessageId::ReleaseObject);
    }

    /// Posts AddReference/ReleaseObject asynchronously; failures only log.
    fn post_reference_message(&self, msg_id: MessageId) {
        let Some(rpc) = self.rpc.upgrade() else {
            return;
        };
        let buf = self.make_local_frame(msg_id);
        let endpoint = self.endpoint.clone();

        rpc.handle().clone().spawn(async move {
            match rpc.get_session(&endpoint).await {
                Ok(session) => {
                    if let Err(e) = session.send(buf).await {
                        warn!("failed to post {msg_id:?}: {e}");
                    }
                },
                Err(e) => warn!("failed to post {msg_id:?}: {e}"),
            }
        });
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        // A proxy dropped without explicit release still owes the peer its
        // reference; the send is best-effort and never blocks drop.
        if self.local_ref.swap(0, Ordering::AcqRel) > 0 && !self.data.is_persistent() {
            self.send_release_best_effort();
        }
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("class", &self.data.class_id)
            .field("poa_idx", &self.data.poa_idx)
            .field("object_id", &self.data.object_id)
            .field("endpoint", &self.endpoint.to_string())
            .finish()
    }
}
