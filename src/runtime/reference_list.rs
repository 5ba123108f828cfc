// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-session bag of servant references held by the remote peer.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::runtime::object_table::ObjectEntry;

/// Tracks which servants a peer session holds. Adding bumps the servant's
/// distributed refcount; removal (explicit `ReleaseObject` or session
/// close) releases it, which may deactivate transient objects.
pub struct ReferenceList {
    refs: Mutex<Vec<Arc<ObjectEntry>>>,
    max_refs: usize,
}

impl ReferenceList {
    pub fn new(max_refs: usize) -> Self {
        Self {
            refs: Mutex::new(Vec::new()),
            max_refs,
        }
    }

    /// Registers `entry`. A duplicate or an over-cap add is logged and
    /// dropped, matching the wire contract of `AddReference` (no reply).
    pub fn add_ref(&self, entry: &Arc<ObjectEntry>) {
        let mut refs = self.refs.lock().expect("reference list poisoned");

        if refs.len() >= self.max_refs {
            warn!(
                max = self.max_refs,
                class = entry.servant.class_id(),
                "maximum references per session exceeded, rejecting AddReference"
            );
            return;
        }

        if refs.iter().any(|e| Arc::ptr_eq(e, entry)) {
            warn!(class = entry.servant.class_id(), "duplicate reference");
            return;
        }

        refs.push(Arc::clone(entry));
        entry.add_ref();
    }

    /// Releases the reference for `(poa_idx, object_id)`. Returns whether
    /// anything was held.
    pub fn remove_ref(&self, poa_idx: u16, object_id: u64) -> bool {
        let entry = {
            let mut refs = self.refs.lock().expect("reference list poisoned");
            let pos = refs
                .iter()
                .position(|e| e.poa_idx == poa_idx && e.object_id == object_id);
            match pos {
                Some(pos) => refs.swap_remove(pos),
                None => return false,
            }
        };
        entry.release();
        true
    }

    pub fn len(&self) -> usize {
        self.refs.lock().expect("reference list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ReferenceList {
    fn drop(&mut self) {
        let refs = std::mem::take(&mut *self.refs.lock().expect("reference list poisoned"));
        if !refs.is_empty() {
            debug!(count = refs.len(), "releasing session references");
        }
        for entry in refs {
            entry.release();
        }
    }
}
