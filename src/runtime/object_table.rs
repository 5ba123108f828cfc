// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Object slot tables: lock-free lookup, guarded access, deferred destroy.
//!
//! Two id policies exist. *SystemGenerated* hands out slot indices from a
//! free list; *UserSupplied* lets the application pick any id below the
//! table size. Either way a slot is one atomic pointer, so the lookup path
//! takes no lock. A slot owns one strong reference to its entry; a lookup
//! acquires another one before handing the entry out behind an
//! [`ObjectGuard`].

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering},
    },
    time::SystemTime,
};

use anyhow::{Result, bail};

use crate::{
    runtime::{poa::Poa, servant::ObjectServant},
    session::context::SessionContext,
    wire::object_id::ActivationFlags,
};

/// A servant bound to a POA slot, together with its lifecycle state.
///
/// Entries are immutable after publication; only the three counters change.
pub struct ObjectEntry {
    pub servant: Box<dyn ObjectServant>,
    pub object_id: u64,
    pub poa_idx: u16,
    pub activation_flags: ActivationFlags,
    pub activated_at: SystemTime,
    /// Owning POA; weak so lingering guards do not keep a torn-down POA
    /// alive.
    pub poa: Weak<Poa>,
    /// Session the object is tethered to, when activated SESSION_SPECIFIC.
    pub session_ctx: Option<Weak<SessionContext>>,
    ref_cnt: AtomicU32,
    in_use_cnt: AtomicU32,
    to_delete: AtomicBool,
}

impl ObjectEntry {
    pub(crate) fn new(
        servant: Box<dyn ObjectServant>,
        activation_flags: ActivationFlags,
        poa: Weak<Poa>,
        poa_idx: u16,
        object_id: u64,
        session_ctx: Option<Weak<SessionContext>>,
    ) -> Self {
        Self {
            servant,
            object_id,
            poa_idx,
            activation_flags,
            activated_at: SystemTime::now(),
            poa,
            session_ctx,
            ref_cnt: AtomicU32::new(0),
            in_use_cnt: AtomicU32::new(0),
            to_delete: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.ref_cnt.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn in_use_count(&self) -> u32 {
        self.in_use_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn marked_deleted(&self) -> bool {
        self.to_delete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.to_delete.store(true, Ordering::Release);
    }

    /// Bumps the distributed reference count held for this servant.
    pub fn add_ref(&self) -> u32 {
        self.ref_cnt.fetch_add(1, Ordering::Release) + 1
    }

    /// Drops one reference. The last reference on a transient-POA object
    /// deactivates the slot; the entry itself is reclaimed once every guard
    /// and list has let go of its `Arc`.
    pub fn release(self: &Arc<Self>) -> u32 {
        let Some(poa) = self.poa.upgrade() else {
            return 0;
        };

        if poa.lifespan().is_persistent() {
            return 1;
        }

        let cnt = self.ref_cnt.fetch_sub(1, Ordering::AcqRel) - 1;
        if cnt == 0 {
            poa.deactivate_object(self.object_id);
        }
        cnt
    }
}

impl std::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("class", &self.servant.class_id())
            .field("poa_idx", &self.poa_idx)
            .field("object_id", &self.object_id)
            .field("refs", &self.ref_count())
            .field("in_use", &self.in_use_count())
            .field("to_delete", &self.marked_deleted())
            .finish()
    }
}

/// Stack-scoped access token. While any guard is alive the servant cannot
/// be destroyed; a guard taken around a deactivation reports the object as
/// gone.
pub struct ObjectGuard {
    entry: Arc<ObjectEntry>,
}

impl ObjectGuard {
    pub(crate) fn new(entry: Arc<ObjectEntry>) -> Self {
        entry.in_use_cnt.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    /// The guarded entry, unless it was tombstoned in the meantime.
    pub fn get(&self) -> Option<&ObjectEntry> {
        if self.entry.marked_deleted() {
            None
        } else {
            Some(&self.entry)
        }
    }

    /// The entry regardless of tombstoning (for reference bookkeeping).
    pub fn entry(&self) -> &Arc<ObjectEntry> {
        &self.entry
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        self.entry.in_use_cnt.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One atomic slot owning a strong count on its entry (stored as a raw
/// `Arc` pointer; null = vacant).
struct Slot(AtomicPtr<ObjectEntry>);

impl Slot {
    const fn empty() -> Self {
        Self(AtomicPtr::new(std::ptr::null_mut()))
    }

    /// Acquire a clone of the stored entry, if any.
    fn load(&self) -> Option<Arc<ObjectEntry>> {
        let ptr = self.0.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // The slot holds one strong count; manufacture another for the
        // caller without disturbing it.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Publish `entry` if the slot is vacant.
    fn try_store(&self, entry: Arc<ObjectEntry>) -> bool {
        let raw = Arc::into_raw(entry) as *mut ObjectEntry;
        let ok = self
            .0
            .compare_exchange(
                std::ptr::null_mut(),
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !ok {
            // Slot already taken; give the strong count back.
            unsafe { drop(Arc::from_raw(raw)) };
        }
        ok
    }

    /// Vacate the slot, returning the entry it owned.
    fn take(&self) -> Option<Arc<ObjectEntry>> {
        let ptr = self.0.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { Arc::from_raw(ptr) })
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let ptr = *self.0.get_mut();
        if !ptr.is_null() {
            unsafe { drop(Arc::from_raw(ptr)) };
        }
    }
}

/// Object id allocation policy of a POA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPolicy {
    SystemGenerated,
    UserSupplied,
}

/// Fixed-capacity slot table for one POA.
pub struct ObjectTable {
    slots: Box<[Slot]>,
    /// Free slot indices; only used by the system-generated policy and only
    /// touched on activation/deactivation.
    free: Mutex<Vec<u32>>,
    policy: IdPolicy,
}

impl ObjectTable {
    pub fn new(max_objects: u32, policy: IdPolicy) -> Self {
        let slots = (0..max_objects).map(|_| Slot::empty()).collect();
        // Pop from the back, so ids start at 0.
        let free = (0..max_objects).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            policy,
        }
    }

    #[inline]
    pub fn policy(&self) -> IdPolicy {
        self.policy
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Claims the next system-generated id.
    pub fn alloc_id(&self) -> Result<u64> {
        debug_assert_eq!(self.policy, IdPolicy::SystemGenerated);
        let mut free = self.free.lock().expect("object table free list poisoned");
        match free.pop() {
            Some(id) => Ok(id as u64),
            None => bail!("POA fixed size has been exceeded"),
        }
    }

    /// Returns an id claimed by [`ObjectTable::alloc_id`] after a failed
    /// activation.
    pub fn release_id(&self, id: u64) {
        if self.policy == IdPolicy::SystemGenerated {
            self.free
                .lock()
                .expect("object table free list poisoned")
                .push(id as u32);
        }
    }

    /// Publishes `entry` at `id`.
    pub fn store(&self, id: u64, entry: Arc<ObjectEntry>) -> Result<()> {
        if id >= self.slots.len() as u64 {
            bail!("object id {id} exceeds max_objects for this POA");
        }
        if !self.slots[id as usize].try_store(entry) {
            bail!("object id {id} already in use");
        }
        Ok(())
    }

    /// Guarded lookup. Tombstoned entries read as absent.
    pub fn get(&self, id: u64) -> Option<ObjectGuard> {
        let entry = self.slots.get(id as usize)?.load()?;
        if entry.marked_deleted() {
            return None;
        }
        Some(ObjectGuard::new(entry))
    }

    /// Clears the slot and tombstones its entry. Memory is reclaimed once
    /// the last `Arc` (guards, reference lists) drops.
    pub fn remove(&self, id: u64) -> Option<Arc<ObjectEntry>> {
        let entry = self.slots.get(id as usize)?.take()?;
        entry.mark_deleted();
        if self.policy == IdPolicy::SystemGenerated {
            self.free
                .lock()
                .expect("object table free list poisoned")
                .push(id as u32);
        }
        Some(entry)
    }
}
