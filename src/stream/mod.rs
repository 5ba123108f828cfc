// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Long-running server→client data streams multiplexed over a session.
//!
//! The writer side is a lazy, finite chunk producer owned by a pump task;
//! the reader side is an event receiver keyed by stream id. Both live in
//! the per-session [`StreamManager`]. Chunks of a stream share one send
//! path, so `sequence` values arrive strictly increasing and readers never
//! reorder.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    buffer::{FlatBuffer, access::write_bytes},
    session::context::SessionContext,
    wire::{
        frame::{begin_frame, finish_frame},
        header::{MessageId, MessageType},
        stream_msgs::{
            STREAM_CANCEL_LEN, STREAM_CHUNK_DATA_AT, STREAM_CHUNK_LEN,
            STREAM_COMPLETE_LEN, STREAM_ERROR_DATA_AT, STREAM_ERROR_LEN, StreamCancel,
            StreamChunk, StreamComplete, StreamError,
        },
    },
};

/// A finite, non-restartable chunk producer. The pump calls `next_chunk`
/// until it returns `None`, then emits `StreamComplete`.
pub trait StreamWriter: Send + 'static {
    /// Produces the next chunk, or `None` when the stream is done.
    fn next_chunk(&mut self) -> Option<Vec<u8>>;

    /// Invoked when the peer cancels or the session dies.
    fn cancel(&mut self) {}
}

/// What a stream reader observes.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk { sequence: u64, data: Vec<u8> },
    Complete { final_sequence: u64 },
    Error { code: u32, data: Vec<u8> },
}

/// Client-side handle to an open stream.
#[derive(Debug)]
pub struct StreamReader {
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamReader {
    #[inline]
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Next event; `None` once the manager dropped its sender (completion,
    /// error or session close already delivered).
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Outbound frame hook installed by the session's transport.
pub type SendFn = Arc<dyn Fn(FlatBuffer) + Send + Sync>;

struct WriterEntry {
    cancel: CancellationToken,
}

static STREAM_ID_BASE: Lazy<u64> = Lazy::new(rand::random::<u64>);
static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique stream id: random base XOR a monotone counter.
pub fn generate_stream_id() -> u64 {
    *STREAM_ID_BASE
        ^ STREAM_ID_COUNTER
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
}

/// Per-session stream table plus the send hooks of its transport.
pub struct StreamManager {
    writers: Mutex<HashMap<u64, WriterEntry>>,
    readers: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamEvent>>>,
    send: OnceLock<SendFn>,
    send_datagram: OnceLock<SendFn>,
    /// Runtime handle the chunk pumps are spawned on; lets the shared-memory
    /// reader thread register writers without being inside the runtime.
    post: OnceLock<tokio::runtime::Handle>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
            send: OnceLock::new(),
            send_datagram: OnceLock::new(),
            post: OnceLock::new(),
        }
    }

    /// Installs the normal outbound path. One shot; later calls are ignored.
    pub fn set_send(&self, f: SendFn) {
        let _ = self.send.set(f);
    }

    /// Installs the datagram path for unreliable chunks.
    pub fn set_send_datagram(&self, f: SendFn) {
        let _ = self.send_datagram.set(f);
    }

    pub fn set_post_handle(&self, handle: tokio::runtime::Handle) {
        let _ = self.post.set(handle);
    }

    fn send_frame(&self, fb: FlatBuffer) {
        match self.send.get() {
            Some(send) => send(fb),
            None => warn!("stream manager has no send path installed"),
        }
    }

    // ── writer side ──────────────────────────────────────────────────────

    /// Registers `writer` and spawns its chunk pump on the runtime. Called
    /// by the router after the `Success` reply to `StreamInitialization` is
    /// on its way, so the client always sees the reply before the first
    /// chunk.
    pub fn register_writer(
        ctx: &Arc<SessionContext>,
        stream_id: u64,
        mut writer: Box<dyn StreamWriter>,
        unreliable: bool,
    ) {
        let mgr = &ctx.streams;
        let cancel = CancellationToken::new();
        mgr.writers
            .lock()
            .expect("stream writers poisoned")
            .insert(
                stream_id,
                WriterEntry {
                    cancel: cancel.clone(),
                },
            );

        debug!(stream_id, unreliable, "stream registered");

        let Some(handle) = mgr.post.get().cloned() else {
            warn!(stream_id, "stream manager has no post handle; dropping stream");
            mgr.writers
                .lock()
                .expect("stream writers poisoned")
                .remove(&stream_id);
            return;
        };

        let send = mgr.send.get().cloned();
        let send_datagram = mgr.send_datagram.get().cloned();
        let ctx = Arc::clone(ctx);

        handle.spawn(async move {
            let mut sequence: u64 = 0;
            let mut last: Option<u64> = None;

            loop {
                if cancel.is_cancelled() {
                    writer.cancel();
                    break;
                }
                let Some(chunk) = writer.next_chunk() else {
                    if let Some(send) = &send {
                        send(build_complete(stream_id, last.unwrap_or(0)));
                    }
                    break;
                };

                let fb = build_chunk(stream_id, sequence, &chunk);
                match (&send_datagram, unreliable) {
                    (Some(dgram), true) => dgram(fb),
                    _ => {
                        if let Some(send) = &send {
                            send(fb);
                        }
                    },
                }

                last = Some(sequence);
                sequence += 1;
                tokio::task::yield_now().await;
            }

            ctx.streams
                .writers
                .lock()
                .expect("stream writers poisoned")
                .remove(&stream_id);
        });
    }

    // ── reader side ──────────────────────────────────────────────────────

    /// Registers a reader for `stream_id` before the `StreamInitialization`
    /// call goes out.
    pub fn register_reader(&self, stream_id: u64) -> StreamReader {
        let (tx, rx) = mpsc::unbounded_channel();
        self.readers
            .lock()
            .expect("stream readers poisoned")
            .insert(stream_id, tx);
        StreamReader { stream_id, rx }
    }

    /// Routes an incoming chunk to its reader.
    pub fn on_chunk(&self, stream_id: u64, sequence: u64, data: Vec<u8>) {
        let readers = self.readers.lock().expect("stream readers poisoned");
        match readers.get(&stream_id) {
            Some(tx) => {
                let _ = tx.send(StreamEvent::Chunk { sequence, data });
            },
            None => warn!(stream_id, "received chunk for unknown stream"),
        }
    }

    /// Normal completion: delivers the event and closes the reader.
    pub fn on_complete(&self, stream_id: u64, final_sequence: u64) {
        let tx = self
            .readers
            .lock()
            .expect("stream readers poisoned")
            .remove(&stream_id);
        if let Some(tx) = tx {
            let _ = tx.send(StreamEvent::Complete { final_sequence });
        }
    }

    /// Error completion: delivers the error and closes the reader.
    pub fn on_error(&self, stream_id: u64, code: u32, data: Vec<u8>) {
        let tx = self
            .readers
            .lock()
            .expect("stream readers poisoned")
            .remove(&stream_id);
        if let Some(tx) = tx {
            let _ = tx.send(StreamEvent::Error { code, data });
        }
    }

    /// Peer asked to stop a stream this side is writing.
    pub fn on_cancel(&self, stream_id: u64) {
        let entry = self
            .writers
            .lock()
            .expect("stream writers poisoned")
            .remove(&stream_id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
        }
    }

    /// Reader-initiated cancellation: tells the peer and forgets the reader.
    pub fn cancel_reader(&self, stream_id: u64) {
        self.readers
            .lock()
            .expect("stream readers poisoned")
            .remove(&stream_id);

        let mut fb = FlatBuffer::new();
        if begin_frame(
            &mut fb,
            STREAM_CANCEL_LEN,
            MessageId::StreamCancellation,
            MessageType::Request,
            0,
        )
        .is_ok()
        {
            if let Some(msg) = StreamCancel::read_mut(fb.data_mut()) {
                msg.stream_id.set(stream_id);
            }
            self.send_frame(fb);
        }
    }

    /// Session teardown: cancels every writer, errors every reader.
    pub fn cancel_all(&self) {
        let writers =
            std::mem::take(&mut *self.writers.lock().expect("stream writers poisoned"));
        for (_, entry) in writers {
            entry.cancel.cancel();
        }

        let readers =
            std::mem::take(&mut *self.readers.lock().expect("stream readers poisoned"));
        for (_, tx) in readers {
            let _ = tx.send(StreamEvent::Error {
                code: 0,
                data: Vec::new(),
            });
        }
    }
}

/// Builds a `StreamDataChunk` frame.
pub fn build_chunk(stream_id: u64, sequence: u64, data: &[u8]) -> FlatBuffer {
    let mut fb = FlatBuffer::new();
    begin_frame(
        &mut fb,
        STREAM_CHUNK_LEN,
        MessageId::StreamDataChunk,
        MessageType::Request,
        0,
    )
    .expect("owned buffer cannot fail to grow");

    {
        let msg = StreamChunk::read_mut(fb.data_mut()).expect("chunk block present");
        msg.stream_id.set(stream_id);
        msg.sequence.set(sequence);
        msg.window_size.set(0);
    }
    write_bytes(&mut fb, STREAM_CHUNK_DATA_AT, data)
        .expect("owned buffer cannot fail to grow");
    finish_frame(&mut fb);
    fb
}

/// Builds a `StreamCompletion` frame.
pub fn build_complete(stream_id: u64, final_sequence: u64) -> FlatBuffer {
    let mut fb = FlatBuffer::new();
    begin_frame(
        &mut fb,
        STREAM_COMPLETE_LEN,
        MessageId::StreamCompletion,
        MessageType::Request,
        0,
    )
    .expect("owned buffer cannot fail to grow");

    let msg = StreamComplete::read_mut(fb.data_mut()).expect("complete block present");
    msg.stream_id.set(stream_id);
    msg.final_sequence.set(final_sequence);
    fb
}

/// Builds a `StreamError` frame.
pub fn build_error(stream_id: u64, code: u32, error_data: &[u8]) -> FlatBuffer {
    let mut fb = FlatBuffer::new();
    begin_frame(
        &mut fb,
        STREAM_ERROR_LEN,
        MessageId::StreamError,
        MessageType::Request,
        0,
    )
    .expect("owned buffer cannot fail to grow");

    {
        let msg = StreamError::read_mut(fb.data_mut()).expect("error block present");
        msg.stream_id.set(stream_id);
        msg.error_code.set(code);
    }
    write_bytes(&mut fb, STREAM_ERROR_DATA_AT, error_data)
        .expect("owned buffer cannot fail to grow");
    finish_frame(&mut fb);
    fb
}
