use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;

/// How long a draining session may flush buffered bytes before being
/// forcibly dropped.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Queued-bytes watermark above which envelope writes are dropped
/// instead of blocking the dispatcher.
pub const WRITE_QUEUE_WATERMARK: usize = 64 * 1024;

const WRITE_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Idle,
    Active,
    Multiplex,
    Draining,
    Closed,
}

/// Monotone session id source. Ids are never reused for the life of the
/// process.
#[derive(Default)]
pub struct SessionIds(AtomicU64);

impl SessionIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// One agent-to-gateway data-plane connection, tagged to a single public
/// port for its entire life.
pub struct Session {
    id: u64,
    public_port: u16,
    state: RwLock<SessionState>,
    closed: AtomicBool,
    opened_at: Instant,
}

impl Session {
    pub fn new(id: u64, public_port: u16) -> Self {
        Self {
            id,
            public_port,
            state: RwLock::new(SessionState::Handshaking),
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub async fn set_state(&self, state: SessionState) {
        let mut s = self.state.write().await;
        *s = state;
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Claim the right to run cleanup. Returns true exactly once no
    /// matter how many paths race to close the session.
    pub fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent close: the first caller transitions to `Closed` and
    /// gets `true`; everyone else gets `false`.
    pub async fn close(&self) -> bool {
        if self.begin_close() {
            self.set_state(SessionState::Closed).await;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("Session write queue over watermark")]
    Backpressure,

    #[error("Session writer closed")]
    Closed,
}

/// Cloneable handle enforcing the single-writer discipline on a
/// session. Envelopes enter a queue drained by exactly one task, so two
/// envelopes' bytes never interleave on the stream.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::Sender<Bytes>,
    queued: Arc<AtomicUsize>,
    watermark: usize,
}

impl SessionWriter {
    pub fn channel(watermark: usize) -> (SessionWriter, SessionWriteQueue) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let queued = Arc::new(AtomicUsize::new(0));
        (
            SessionWriter {
                tx,
                queued: queued.clone(),
                watermark,
            },
            SessionWriteQueue { rx, queued },
        )
    }

    /// Enqueue one pre-encoded envelope. Never blocks: over the
    /// watermark the envelope is dropped and the caller counts it.
    pub fn try_enqueue(&self, buf: Bytes) -> Result<(), WriteError> {
        let len = buf.len();
        if self.queued.load(Ordering::Relaxed) + len > self.watermark {
            return Err(WriteError::Backpressure);
        }
        self.queued.fetch_add(len, Ordering::Relaxed);
        self.tx.try_send(buf).map_err(|e| {
            self.queued.fetch_sub(len, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => WriteError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
            }
        })
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Receiving end of a session's write queue; `run` is the session's
/// single writer task.
pub struct SessionWriteQueue {
    rx: mpsc::Receiver<Bytes>,
    queued: Arc<AtomicUsize>,
}

impl SessionWriteQueue {
    /// Drain queued envelopes onto the stream. Each envelope is one
    /// uninterrupted `write_all`. Returns when the queue closes or the
    /// stream errors.
    pub async fn run<W: AsyncWrite + Unpin>(mut self, mut writer: W) {
        while let Some(buf) = self.rx.recv().await {
            let len = buf.len();
            let result = writer.write_all(&buf).await;
            self.queued.fetch_sub(len, Ordering::Relaxed);
            if result.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let session = Session::new(7, 25565);
        assert_eq!(session.id(), 7);
        assert_eq!(session.public_port(), 25565);
        assert_eq!(session.state().await, SessionState::Handshaking);

        session.set_state(SessionState::Idle).await;
        assert_eq!(session.state().await, SessionState::Idle);

        session.set_state(SessionState::Active).await;
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_close_fires_once() {
        let session = Session::new(1, 8080);
        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(session.is_closed());
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[test]
    fn test_session_ids_monotone() {
        let ids = SessionIds::new();
        let a = ids.next();
        let b = ids.next();
        let c = ids.next();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_writer_backpressure() {
        let (writer, _queue) = SessionWriter::channel(10);

        writer.try_enqueue(Bytes::from_static(b"12345")).unwrap();
        writer.try_enqueue(Bytes::from_static(b"12345")).unwrap();
        // Queue sits at the watermark; the next envelope is dropped.
        let result = writer.try_enqueue(Bytes::from_static(b"x"));
        assert_eq!(result, Err(WriteError::Backpressure));
    }

    #[tokio::test]
    async fn test_writer_drains_to_stream() {
        let (writer, queue) = SessionWriter::channel(WRITE_QUEUE_WATERMARK);
        let (client, mut server) = tokio::io::duplex(4096);

        let task = tokio::spawn(queue.run(client));

        writer.try_enqueue(Bytes::from_static(b"one")).unwrap();
        writer.try_enqueue(Bytes::from_static(b"two")).unwrap();
        drop(writer);

        task.await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"onetwo");
    }

    #[tokio::test]
    async fn test_writer_closed_after_queue_dropped() {
        let (writer, queue) = SessionWriter::channel(WRITE_QUEUE_WATERMARK);
        drop(queue);
        let result = writer.try_enqueue(Bytes::from_static(b"late"));
        assert_eq!(result, Err(WriteError::Closed));
    }
}
