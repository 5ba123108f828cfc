// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Portable Object Adapter: activation, lookup and deactivation of
//! servants for one `(poa_idx, object_id)` namespace.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::{
    endpoint::{
        MEM_PREFIX, QUIC_PREFIX, TCP_PREFIX, UDP_PREFIX, WS_PREFIX, WSS_PREFIX,
    },
    runtime::{
        object_table::{IdPolicy, ObjectEntry, ObjectGuard, ObjectTable},
        rpc::Rpc,
        servant::ObjectServant,
    },
    session::context::SessionContext,
    wire::object_id::{ActivationFlags, ObjectFlags, ObjectIdData},
};

/// How long activations on this POA live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Objects die with the session that holds them; reference counted.
    Transient,
    /// Objects outlive sessions; reference counting is a no-op.
    Persistent,
}

impl Lifespan {
    #[inline]
    pub fn is_persistent(self) -> bool {
        matches!(self, Lifespan::Persistent)
    }
}

/// Configures and registers a new POA on a runtime.
pub struct PoaBuilder {
    rpc: Arc<Rpc>,
    max_objects: u32,
    lifespan: Lifespan,
    id_policy: IdPolicy,
}

impl PoaBuilder {
    pub fn new(rpc: &Arc<Rpc>) -> Self {
        Self {
            rpc: Arc::clone(rpc),
            max_objects: rpc.cfg().limits.max_poa_objects,
            lifespan: Lifespan::Transient,
            id_policy: IdPolicy::SystemGenerated,
        }
    }

    pub fn with_max_objects(mut self, max_objects: u32) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn with_id_policy(mut self, policy: IdPolicy) -> Self {
        self.id_policy = policy;
        self
    }

    pub fn build(self) -> Result<Arc<Poa>> {
        self.rpc
            .register_poa(self.max_objects, self.lifespan, self.id_policy)
    }
}

pub struct Poa {
    idx: u16,
    lifespan: Lifespan,
    table: ObjectTable,
    rpc: Weak<Rpc>,
}

impl Poa {
    pub(crate) fn new(
        idx: u16,
        max_objects: u32,
        lifespan: Lifespan,
        id_policy: IdPolicy,
        rpc: Weak<Rpc>,
    ) -> Self {
        Self {
            idx,
            lifespan,
            table: ObjectTable::new(max_objects, id_policy),
            rpc,
        }
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.idx
    }

    #[inline]
    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    /// Guarded lookup; `None` for vacant or tombstoned slots.
    pub fn get_object(&self, object_id: u64) -> Option<ObjectGuard> {
        self.table.get(object_id)
    }

    /// Activates `servant` under a system-generated id.
    pub fn activate_object(
        self: &Arc<Self>,
        servant: Box<dyn ObjectServant>,
        activation_flags: ActivationFlags,
        ctx: Option<&Arc<SessionContext>>,
    ) -> Result<ObjectIdData> {
        if self.table.policy() == IdPolicy::UserSupplied {
            bail!("POA requires user-supplied object ids; call activate_object_with_id");
        }

        let object_id = self.table.alloc_id()?;
        match self.finalize_activation(servant, object_id, activation_flags, ctx) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.table.release_id(object_id);
                Err(e)
            },
        }
    }

    /// Activates `servant` under a caller-chosen id.
    pub fn activate_object_with_id(
        self: &Arc<Self>,
        object_id: u64,
        servant: Box<dyn ObjectServant>,
        activation_flags: ActivationFlags,
        ctx: Option<&Arc<SessionContext>>,
    ) -> Result<ObjectIdData> {
        if self.table.policy() == IdPolicy::SystemGenerated {
            bail!("POA is configured for system-generated object ids");
        }
        self.finalize_activation(servant, object_id, activation_flags, ctx)
    }

    fn finalize_activation(
        self: &Arc<Self>,
        servant: Box<dyn ObjectServant>,
        object_id: u64,
        activation_flags: ActivationFlags,
        ctx: Option<&Arc<SessionContext>>,
    ) -> Result<ObjectIdData> {
        let rpc = self
            .rpc
            .upgrade()
            .context("runtime is gone; cannot activate objects")?;

        let tethered = activation_flags.contains(ActivationFlags::SESSION_SPECIFIC);
        if tethered && ctx.is_none() {
            bail!("SESSION_SPECIFIC activation requires a session context");
        }
        if self.lifespan == Lifespan::Transient && ctx.is_none() {
            bail!("transient POA requires a session context for activation");
        }

        let entry = Arc::new(ObjectEntry::new(
            servant,
            activation_flags,
            Arc::downgrade(self),
            self.idx,
            object_id,
            tethered.then(|| Arc::downgrade(ctx.expect("checked above"))),
        ));

        let mut data = ObjectIdData {
            object_id,
            poa_idx: self.idx,
            flags: ObjectFlags::empty(),
            origin: *rpc.guid(),
            class_id: entry.servant.class_id().to_string(),
            urls: self.build_urls(&rpc, activation_flags)?,
        };
        if self.lifespan.is_persistent() {
            data.flags |= ObjectFlags::PERSISTENT;
        }
        if tethered {
            data.flags |= ObjectFlags::TETHERED;
        }

        if self.lifespan == Lifespan::Transient {
            ctx.expect("checked above").ref_list.add_ref(&entry);
        }

        self.table.store(object_id, entry)?;
        Ok(data)
    }

    /// Builds the URL list for an activation, limited to the transports the
    /// runtime actually listens on.
    fn build_urls(&self, rpc: &Arc<Rpc>, flags: ActivationFlags) -> Result<String> {
        let cfg = rpc.cfg();
        let host = cfg.default_host();
        let mut urls = String::new();

        if flags.contains(ActivationFlags::ALLOW_TCP) {
            urls += &format!("{TCP_PREFIX}{host}:{};", cfg.listen.tcp_port);
        }
        if flags.contains(ActivationFlags::ALLOW_WEBSOCKET) {
            urls += &format!("{WS_PREFIX}{host}:{};", cfg.listen.http_port);
        }
        if flags.contains(ActivationFlags::ALLOW_SSL_WEBSOCKET) {
            if cfg.hostname.is_empty() {
                bail!("SSL websocket activation requires a hostname");
            }
            urls += &format!("{WSS_PREFIX}{}:{};", cfg.hostname, cfg.listen.http_port);
        }
        if flags.contains(ActivationFlags::ALLOW_SHARED_MEMORY) {
            let listener = rpc
                .shm_listener_id()
                .context("shared-memory activation requires an shm listener")?;
            urls += &format!("{MEM_PREFIX}{listener};");
        }
        if flags.contains(ActivationFlags::ALLOW_UDP) {
            if cfg.listen.udp_port == 0 {
                bail!("UDP port not configured");
            }
            urls += &format!("{UDP_PREFIX}{host}:{};", cfg.listen.udp_port);
        }
        if flags.contains(ActivationFlags::ALLOW_QUIC) {
            if cfg.listen.quic_port == 0 {
                bail!("QUIC port not configured");
            }
            urls += &format!("{QUIC_PREFIX}{host}:{};", cfg.listen.quic_port);
        }

        Ok(urls)
    }

    /// Two-phase deactivation: the slot is cleared and tombstoned now;
    /// servant memory is reclaimed when the last guard or reference drops.
    pub fn deactivate_object(&self, object_id: u64) {
        match self.table.remove(object_id) {
            Some(entry) => {
                if entry.in_use_count() != 0 {
                    // Guards are still live; destruction is deferred to the
                    // final Arc drop, lookups already miss.
                    tracing::debug!(
                        object_id,
                        in_use = entry.in_use_count(),
                        "deactivate deferred while object is in use"
                    );
                }
            },
            None => warn!(object_id, "deactivate_object: object not found"),
        }
    }
}

impl std::fmt::Debug for Poa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poa")
            .field("idx", &self.idx)
            .field("lifespan", &self.lifespan)
            .field("capacity", &self.table.capacity())
            .finish()
    }
}
