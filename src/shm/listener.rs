// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection establishment over shared memory.
//!
//! A server owns a small well-known *accept ring*. Connecting clients
//! write a handshake record naming a fresh channel id and a one-page
//! ready-flag segment, then spin on that flag. The server creates the
//! channel rings, wires its session up, and only then release-stores 1
//! into the flag — the client's acquire-load therefore observes fully
//! initialized rings and a listening peer, never a half-built channel.

use std::{
    num::NonZeroUsize,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use nix::{
    fcntl::OFlag,
    sys::{
        mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink},
        stat::Mode,
    },
    unistd::ftruncate,
};
use tracing::{info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32};

use crate::shm::{channel::ShmChannel, ready_flag_name, ring::RingBuffer, shm_name};

const HANDSHAKE_MAGIC: u32 = 0x6e70_6873; // "nphs"
const HANDSHAKE_VERSION: u32 = 1;

/// The accept ring only carries handshakes; 10 KiB fits plenty of them.
const ACCEPT_RING_SIZE: usize = 10 * 1024;

/// How long a client waits for the server's ready signal.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-size connection request written into the accept ring.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Handshake {
    magic: U32<LittleEndian>,
    version: U32<LittleEndian>,
    channel_id: [u8; 64],
    ready_flag_shm: [u8; 64],
}

impl Handshake {
    fn new(channel_id: &str, ready_flag_shm: &str) -> Result<Self> {
        let mut hs = Handshake {
            magic: U32::new(HANDSHAKE_MAGIC),
            version: U32::new(HANDSHAKE_VERSION),
            channel_id: [0; 64],
            ready_flag_shm: [0; 64],
        };
        copy_name(&mut hs.channel_id, channel_id)?;
        copy_name(&mut hs.ready_flag_shm, ready_flag_shm)?;
        Ok(hs)
    }

    fn is_valid(&self) -> bool {
        self.magic.get() == HANDSHAKE_MAGIC && self.version.get() == HANDSHAKE_VERSION
    }

    fn channel_id(&self) -> &str {
        str_field(&self.channel_id)
    }

    fn ready_flag_shm(&self) -> &str {
        str_field(&self.ready_flag_shm)
    }
}

fn copy_name(dst: &mut [u8; 64], src: &str) -> Result<()> {
    let bytes = src.as_bytes();
    if bytes.len() >= dst.len() {
        bail!("shm name too long: {src}");
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn str_field(field: &[u8; 64]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Accept handler: receives the freshly created channel for one client.
pub type AcceptHandler = Box<dyn Fn(Arc<ShmChannel>) + Send + 'static>;

/// Server-side listener owning the accept ring and its polling thread.
pub struct ShmListener {
    listener_id: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ShmListener {
    pub fn start(
        listener_id: &str,
        ring_capacity: usize,
        accept_handler: AcceptHandler,
    ) -> Result<Self> {
        if listener_id.is_empty() {
            bail!("listener name cannot be empty");
        }

        let accept_name = shm_name(listener_id, "accept");
        // A crashed server may have left the ring behind.
        RingBuffer::remove(&accept_name);
        let accept_ring = RingBuffer::create(&accept_name, ACCEPT_RING_SIZE)
            .context("failed to create listener accept ring")?;

        info!(listener_id, "shm listener created");

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            let listener_id = listener_id.to_string();
            std::thread::Builder::new()
                .name(format!("nprpc-shm-accept-{listener_id}"))
                .spawn(move || {
                    accept_loop(accept_ring, running, ring_capacity, accept_handler);
                    info!(%listener_id, "shm accept loop exiting");
                })
                .expect("failed to spawn shm accept thread")
        };

        Ok(Self {
            listener_id: listener_id.to_string(),
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!(listener_id = %self.listener_id, "shm listener stopped");
    }
}

impl Drop for ShmListener {
    fn drop(&mut self) {
        self.stop();
        // The accept ring was moved into the loop thread and is gone by
        // now; its creator flag removed the shm object.
    }
}

fn accept_loop(
    accept_ring: RingBuffer,
    running: Arc<AtomicBool>,
    ring_capacity: usize,
    accept_handler: AcceptHandler,
) {
    let mut buf = [0u8; 1024];

    while running.load(Ordering::Acquire) {
        let n = accept_ring.read_with_timeout(&mut buf, Duration::from_millis(100));
        if n == 0 {
            continue;
        }
        if n != size_of::<Handshake>() {
            warn!(n, "invalid handshake size");
            continue;
        }
        let Ok(handshake) = Handshake::read_from_bytes(&buf[..n]) else {
            continue;
        };
        if !handshake.is_valid() {
            warn!("invalid handshake magic/version");
            continue;
        }

        if let Err(e) = accept_one(&handshake, ring_capacity, &accept_handler) {
            warn!("shm accept failed: {e}");
        }
    }
}

fn accept_one(
    handshake: &Handshake,
    ring_capacity: usize,
    accept_handler: &AcceptHandler,
) -> Result<()> {
    let channel_id = handshake.channel_id();
    info!(channel_id, "accepting shm connection");

    let channel = ShmChannel::create(channel_id, ring_capacity)?;

    // Wire the session up BEFORE signaling the client: once the flag flips,
    // the client may send immediately and the handler must already listen.
    accept_handler(channel);

    // The release-store is the synchronization barrier: all ring-creation
    // work above is sequenced-before it, the client's acquire-load sees it.
    let ready = ReadyFlag::open(handshake.ready_flag_shm())?;
    ready.signal();
    Ok(())
}

/// Client entry point: performs the handshake against `listener_id` and
/// returns the opened channel. The caller wires its receive handler and
/// then calls `start_reading`.
pub fn connect_to_listener(listener_id: &str) -> Result<Arc<ShmChannel>> {
    if listener_id.is_empty() {
        bail!("listener name cannot be empty");
    }

    let channel_id = crate::utils::generate_channel_id();
    let ready_name = ready_flag_name(&channel_id);

    info!(listener_id, %channel_id, "connecting to shm listener");

    // The guard removes the one-page flag segment on every exit path.
    let ready = ReadyFlag::create(&ready_name)?;

    let handshake = Handshake::new(&channel_id, &ready_name)?;
    let accept_ring = RingBuffer::open(&shm_name(listener_id, "accept"))?;
    if !accept_ring.try_write(handshake.as_bytes()) {
        bail!("failed to send connection request (accept ring full)");
    }

    // Spin on the acquire-load; the server's setup happens-before success.
    let start = Instant::now();
    while !ready.is_set() {
        std::hint::spin_loop();
        if start.elapsed() > READY_TIMEOUT {
            bail!("timeout waiting for server to create ring buffers");
        }
    }

    let channel = ShmChannel::open(&channel_id)?;
    info!(%channel_id, "connected to shm listener");
    Ok(channel)
}

/// One-page shm segment holding a single `AtomicU32`, created by the
/// client and removed by it on all paths.
struct ReadyFlag {
    name: String,
    ptr: NonNull<AtomicU32>,
    len: usize,
    owns: bool,
}

impl ReadyFlag {
    fn create(name: &str) -> Result<Self> {
        let _ = shm_unlink(name); // stale flag from a crashed client
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .with_context(|| format!("shm_open(create) failed for {name}"))?;
        let len = size_of::<AtomicU32>().max(4096);
        ftruncate(&fd, len as libc::off_t)?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        let flag: NonNull<AtomicU32> = ptr.cast();
        unsafe { flag.as_ref().store(0, Ordering::Relaxed) };

        Ok(Self {
            name: name.to_string(),
            ptr: flag,
            len,
            owns: true,
        })
    }

    fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .with_context(|| format!("shm_open failed for {name}"))?;
        let len = 4096;
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Self {
            name: name.to_string(),
            ptr: ptr.cast(),
            len,
            owns: false,
        })
    }

    fn signal(&self) {
        unsafe { self.ptr.as_ref().store(1, Ordering::Release) };
    }

    fn is_set(&self) -> bool {
        unsafe { self.ptr.as_ref().load(Ordering::Acquire) != 0 }
    }
}

impl Drop for ReadyFlag {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
        if self.owns {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}
