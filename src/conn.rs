//! Socket framing and the per-connection reader task
//!
//! A [`FramedConnection`] wraps one player's bidirectional text-frame
//! transport. A reader task decodes inbound frames into typed messages and
//! appends them to a small bounded queue, signalling the owning room's
//! wake-up after each one; when the transport ends for any reason the task
//! enqueues exactly one synthetic close carrying the socket's handle and
//! stops. Writes go through the connection directly and are serialized by
//! the room loop owning it, so the transport's sink is never used from two
//! tasks at once.
//!
//! The core is agnostic about how the transport is obtained: anything that
//! implements [`FrameSource`] and [`FrameSink`] can be attached, be it an
//! upgraded websocket or an in-memory channel pair in tests.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants;
use crate::message::{self, IncomingMessage};

/// Process-unique identity of one accepted socket
///
/// Handles are comparable so that a close produced by a connection the
/// user has already replaced can be told apart from a close of the
/// connection they are currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Failure of the underlying transport while reading or writing a frame
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(
    /// Human-readable cause of the failure
    pub String,
);

/// Receiving half of a framed transport
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Waits for the next text frame from the peer.
    ///
    /// Returns `None` once the stream has ended; after that the source
    /// will not be polled again.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// Sending half of a framed transport
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Writes one already-encoded frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the frame could not be written; the
    /// connection is considered closed afterwards.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Closes the underlying transport. This must cause the paired
    /// [`FrameSource`] to end.
    async fn close(&mut self);
}

/// One player's connection: a decoded-message queue plus the writing half
pub struct FramedConnection {
    id: SocketId,
    sink: Box<dyn FrameSink>,
    inbound: mpsc::Receiver<IncomingMessage>,
    /// One-slot pushback so a consumer can examine the head of the queue
    /// without consuming it.
    unread: Option<IncomingMessage>,
    closed: bool,
    reader: JoinHandle<()>,
}

impl FramedConnection {
    /// Wraps a transport and spawns its reader task.
    ///
    /// `wakeup` is signalled after every message the reader enqueues, so
    /// the owning room wakes whenever there is something to consume.
    pub fn spawn(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        wakeup: Arc<Notify>,
    ) -> Self {
        let id = SocketId::next();
        let (queue, inbound) = mpsc::channel(constants::conn::INBOUND_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_loop(id, source, queue, wakeup));

        Self {
            id,
            sink,
            inbound,
            unread: None,
            closed: false,
            reader,
        }
    }

    /// Returns the handle identifying this socket
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Takes the next decoded message without blocking, if one is queued
    pub fn read_next(&mut self) -> Option<IncomingMessage> {
        if let Some(message) = self.unread.take() {
            return Some(message);
        }
        self.inbound.try_recv().ok()
    }

    /// Waits for the next decoded message.
    ///
    /// Returns `None` only if the reader task is gone and the queue has
    /// been drained, which cannot happen before the synthetic close has
    /// been consumed.
    pub async fn read_next_blocking(&mut self) -> Option<IncomingMessage> {
        if let Some(message) = self.unread.take() {
            return Some(message);
        }
        self.inbound.recv().await
    }

    /// Puts a message back at the head of the queue.
    ///
    /// Only one message can be held back at a time; the slot must be empty.
    pub fn unread(&mut self, message: IncomingMessage) {
        debug_assert!(self.unread.is_none(), "pushback slot already occupied");
        self.unread = Some(message);
    }

    /// Writes one encoded frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the connection is already closed or
    /// the write fails; a failed write marks the connection closed so the
    /// owner can route it through the normal disconnect path.
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError("connection is closed".to_owned()));
        }
        if let Err(err) = self.sink.send_frame(frame).await {
            warn!(socket = %self.id, %err, "write failed, marking connection closed");
            self.closed = true;
            return Err(err);
        }
        Ok(())
    }

    /// Closes the transport and marks the connection closed
    pub async fn close(&mut self) {
        if !self.closed {
            self.sink.close().await;
            self.closed = true;
        }
    }

    /// `true` once the connection has been closed or a write has failed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        // The reader normally ends on transport EOF; aborting covers
        // transports that outlive a dropped connection.
        self.reader.abort();
    }
}

/// Translates transport frames into decoded messages until the transport
/// ends, then enqueues exactly one synthetic close.
async fn read_loop(
    id: SocketId,
    mut source: Box<dyn FrameSource>,
    queue: mpsc::Sender<IncomingMessage>,
    wakeup: Arc<Notify>,
) {
    debug!(socket = %id, "reader started");

    loop {
        match source.next_frame().await {
            Some(Ok(frame)) => match message::decode(&frame) {
                Ok(decoded) => {
                    // A full queue blocks here, backpressuring the peer.
                    if queue.send(decoded).await.is_err() {
                        break;
                    }
                    wakeup.notify_one();
                }
                Err(err) => {
                    warn!(socket = %id, %err, "dropping undecodable frame");
                }
            },
            Some(Err(err)) => {
                debug!(socket = %id, %err, "socket read failed");
                break;
            }
            None => break,
        }
    }

    let _ = queue.send(IncomingMessage::SocketClosed { socket: id }).await;
    wakeup.notify_one();
    debug!(socket = %id, "reader stopped");
}
