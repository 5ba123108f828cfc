// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A full-duplex shared-memory connection: one ring per direction plus the
//! reader thread that drains the receive side.
//!
//! Ring names are fixed from the *server's* perspective —
//! `/nprpc_<id>_send` is written by the server and read by the client,
//! `/nprpc_<id>_recv` the other way around.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, warn};

use crate::shm::{
    ring::{ReadView, RingBuffer, WriteReservation},
    shm_name,
};

/// How long a full send ring is retried before the write is abandoned.
const SEND_FULL_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ShmChannel {
    channel_id: String,
    send: RingBuffer,
    recv: RingBuffer,
    running: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ShmChannel {
    /// Server side: creates both rings (and removes them again on drop).
    pub fn create(channel_id: &str, ring_capacity: usize) -> Result<Arc<Self>> {
        let send_name = shm_name(channel_id, "send");
        let recv_name = shm_name(channel_id, "recv");
        // A crashed predecessor may have left stale objects behind.
        RingBuffer::remove(&send_name);
        RingBuffer::remove(&recv_name);

        let send = RingBuffer::create(&send_name, ring_capacity)?;
        let recv = RingBuffer::create(&recv_name, ring_capacity)?;
        Ok(Arc::new(Self {
            channel_id: channel_id.to_string(),
            send,
            recv,
            running: AtomicBool::new(false),
            reader: Mutex::new(None),
        }))
    }

    /// Client side: opens the server-created rings with the directions
    /// swapped.
    pub fn open(channel_id: &str) -> Result<Arc<Self>> {
        let send = RingBuffer::open(&shm_name(channel_id, "recv"))?;
        let recv = RingBuffer::open(&shm_name(channel_id, "send"))?;
        Ok(Arc::new(Self {
            channel_id: channel_id.to_string(),
            send,
            recv,
            running: AtomicBool::new(false),
            reader: Mutex::new(None),
        }))
    }

    #[inline]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    // ── send side ────────────────────────────────────────────────────────

    /// Copy-path write; waits briefly when the ring is full.
    pub fn write(&self, data: &[u8]) -> bool {
        let deadline = std::time::Instant::now() + SEND_FULL_TIMEOUT;
        loop {
            if self.send.try_write(data) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                warn!(
                    channel = %self.channel_id,
                    len = data.len(),
                    "send ring stayed full; dropping record"
                );
                return false;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Zero-copy write reservation in the send ring.
    pub fn reserve_write(&self, min_size: usize) -> Option<WriteReservation> {
        self.send.try_reserve_write(min_size)
    }

    pub fn commit_write(&self, reservation: &WriteReservation, actual_size: usize) {
        self.send.commit_write(reservation, actual_size);
    }

    /// Commits a reservation that survived only as `(write_idx, max_size)`
    /// inside a view-mode flat buffer.
    pub fn commit_write_at(&self, write_idx: u64, max_size: usize, actual_size: usize) {
        self.send.commit_write_at(write_idx, max_size, actual_size);
    }

    // ── receive side ─────────────────────────────────────────────────────

    pub fn commit_read(&self, view: &ReadView) {
        self.recv.commit_read(view);
    }

    /// Spawns the reader thread. `on_record` gets an in-place view of each
    /// record and must call [`ShmChannel::commit_read`] when done with it.
    pub fn start_reading<F>(self: &Arc<Self>, on_record: F)
    where
        F: Fn(&ReadView) + Send + 'static,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let channel = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("nprpc-shm-{}", self.channel_id))
            .spawn(move || {
                while channel.running.load(Ordering::Acquire) {
                    match channel.recv.try_read_view() {
                        Some(view) => on_record(&view),
                        None => {
                            channel.recv.wait_readable(Duration::from_millis(100));
                        },
                    }
                }
                debug!(channel = %channel.channel_id, "shm reader exiting");
            })
            .expect("failed to spawn shm reader thread");

        *self.reader.lock().expect("shm reader handle poisoned") = Some(handle);
    }

    /// Stops the reader thread; idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .reader
            .lock()
            .expect("shm reader handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ShmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmChannel")
            .field("channel_id", &self.channel_id)
            .field("send_window", &self.send.ring_window())
            .field("recv_window", &self.recv.ring_window())
            .finish()
    }
}
