// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-peer session state shared by every transport.

use std::sync::{Arc, OnceLock, Weak};

use crate::{
    endpoint::Endpoint,
    runtime::{reference_list::ReferenceList, rpc::Rpc},
    shm::channel::ShmChannel,
    stream::StreamManager,
};

/// Everything the router and servants may touch about the session a call
/// arrived on. The current rx/tx buffers are deliberately *not* here: they
/// are only valid inside one dispatch and travel through
/// [`crate::runtime::servant::Dispatch`].
pub struct SessionContext {
    pub remote_endpoint: Endpoint,
    /// Servants the remote peer holds references to.
    pub ref_list: ReferenceList,
    /// Streams multiplexed over this session.
    pub streams: StreamManager,
    /// Owning runtime.
    pub rpc: Weak<Rpc>,
    /// Server-side shared-memory channel, set when the session rides a ring
    /// pair; enables the zero-copy reply path.
    pub shm_channel: OnceLock<Weak<ShmChannel>>,
}

impl SessionContext {
    pub fn new(rpc: &Arc<Rpc>, remote_endpoint: Endpoint) -> Arc<Self> {
        let ctx = Arc::new(Self {
            remote_endpoint,
            ref_list: ReferenceList::new(rpc.cfg().limits.max_references_per_session),
            streams: StreamManager::new(),
            rpc: Arc::downgrade(rpc),
            shm_channel: OnceLock::new(),
        });
        ctx.streams.set_post_handle(rpc.handle().clone());
        ctx
    }

    /// The shared-memory channel of a server-side shm session, if alive.
    pub fn shm_channel(&self) -> Option<Arc<ShmChannel>> {
        self.shm_channel.get().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("remote_endpoint", &self.remote_endpoint.to_string())
            .field("held_refs", &self.ref_list.len())
            .finish()
    }
}
