//! # Multiplexed RPC Connection
//!
//! Purpose: Carry many concurrent requests over one stream and route each
//! reply to the caller that sent it.
//!
//! ## Design Principles
//! 1. **Request Ledger**: Every in-flight request owns a `oneshot` sender
//!    keyed by request id. An entry is removed exactly once, either by the
//!    reader task when its reply arrives or by `fail` when the connection dies.
//! 2. **Fail Together**: Any transport error, peer close, undecodable frame or
//!    request timeout marks the connection unhealthy and completes every
//!    pending request with the same failure.
//! 3. **Weak Links**: The reader task and the owning pool are referenced
//!    weakly; dropping the last strong handle tears the connection down.
//!
//! ## Structure Overview
//!
//! ```text
//! RpcConnection
//!   ├── writer: tokio Mutex<WriteHalf>   (frames written whole)
//!   ├── ledger: Mutex<Ledger>            (id -> oneshot::Sender)
//!   ├── reader task (Weak<RpcConnection>) -> route(id, response)
//!   └── owner: Weak<dyn ConnectionOwner> -> evict(id) on failure
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use rkv_common::{decode_frame, encode_frame, Envelope, Request, Response};

use crate::error::ConnectionFailure;
use crate::transport::{BoxedStream, Endpoint};

/// Pool-assigned connection identifier.
pub type ConnectionId = u64;

type Completion = oneshot::Sender<Result<Response, ConnectionFailure>>;

/// Receives eviction requests from failing connections.
pub trait ConnectionOwner: Send + Sync {
    fn evict(&self, id: ConnectionId, failure: &ConnectionFailure);
}

struct Detached;

impl ConnectionOwner for Detached {
    fn evict(&self, _id: ConnectionId, _failure: &ConnectionFailure) {}
}

#[derive(Default)]
struct Ledger {
    pending: HashMap<u64, Completion>,
    failure: Option<ConnectionFailure>,
}

/// One physical multiplexed connection to a backend.
pub struct RpcConnection {
    id: ConnectionId,
    endpoint: Endpoint,
    created_at: Instant,
    request_timeout: Duration,
    healthy: AtomicBool,
    next_request: AtomicU64,
    ledger: Mutex<Ledger>,
    writer: Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    owner: Weak<dyn ConnectionOwner>,
}

impl RpcConnection {
    /// Wraps an established stream and starts its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        id: ConnectionId,
        endpoint: Endpoint,
        stream: BoxedStream,
        request_timeout: Duration,
        owner: Weak<dyn ConnectionOwner>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(RpcConnection {
            id,
            endpoint,
            created_at: Instant::now(),
            request_timeout,
            healthy: AtomicBool::new(true),
            next_request: AtomicU64::new(1),
            ledger: Mutex::new(Ledger::default()),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reader_task: Mutex::new(None),
            owner,
        });

        let task = tokio::spawn(read_loop(Arc::downgrade(&conn), reader));
        *conn.reader_task.lock() = Some(task);
        conn
    }

    /// Opens a connection that no pool owns.
    pub fn open_detached(
        id: ConnectionId,
        endpoint: Endpoint,
        stream: BoxedStream,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let owner: Weak<dyn ConnectionOwner> = Weak::<Detached>::new();
        Self::open(id, endpoint, stream, request_timeout, owner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Requests currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.ledger.lock().pending.len()
    }

    /// Sends one request and waits for its reply.
    pub async fn call(&self, request: Request) -> Result<Response, ConnectionFailure> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);

        let mut frame = BytesMut::new();
        encode_frame(&Envelope::new(id, request), &mut frame)
            .map_err(|err| ConnectionFailure::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut ledger = self.ledger.lock();
            if let Some(failure) = &ledger.failure {
                return Err(failure.clone());
            }
            ledger.pending.insert(id, tx);
        }

        // One deadline covers both writing the frame and awaiting the reply.
        match tokio::time::timeout(self.request_timeout, self.exchange(&frame, rx)).await {
            Ok(result) => result,
            Err(_) => {
                self.fail(ConnectionFailure::Timeout);
                Err(ConnectionFailure::Timeout)
            }
        }
    }

    async fn exchange(
        &self,
        frame: &[u8],
        rx: oneshot::Receiver<Result<Response, ConnectionFailure>>,
    ) -> Result<Response, ConnectionFailure> {
        {
            let mut writer = self.writer.lock().await;
            // A failure while queued on the writer already completed `rx`.
            if self.is_healthy() {
                let written = match writer.write_all(frame).await {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = written {
                    drop(writer);
                    self.fail(ConnectionFailure::Reset(err.to_string()));
                }
            }
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without completing: the connection went away.
            Err(_) => Err(ConnectionFailure::Closed),
        }
    }

    /// Shuts the connection down, failing pending requests.
    pub fn shutdown(&self) {
        self.fail(ConnectionFailure::Shutdown);
    }

    /// Marks the connection unhealthy and fans the failure out.
    ///
    /// Only the first call has any effect.
    pub fn fail(&self, failure: ConnectionFailure) {
        let pending = {
            let mut ledger = self.ledger.lock();
            if !self.healthy.swap(false, Ordering::AcqRel) {
                return;
            }
            ledger.failure = Some(failure.clone());
            std::mem::take(&mut ledger.pending)
        };

        debug!(
            connection = self.id,
            endpoint = %self.endpoint,
            pending = pending.len(),
            error = %failure,
            "connection marked unhealthy"
        );

        for (_, completion) in pending {
            let _ = completion.send(Err(failure.clone()));
        }

        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.writer);
            handle.spawn(async move {
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.evict(self.id, &failure);
        }
    }

    fn route(&self, id: u64, response: Response) {
        let completion = self.ledger.lock().pending.remove(&id);
        match completion {
            Some(completion) => {
                let _ = completion.send(Ok(response));
            }
            None => debug!(connection = self.id, request = id, "reply for unknown request"),
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_loop(conn: Weak<RpcConnection>, mut reader: ReadHalf<BoxedStream>) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    let failure = 'read: loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break ConnectionFailure::Closed,
            Ok(_) => {}
            Err(err) => break ConnectionFailure::Reset(err.to_string()),
        }

        loop {
            match decode_frame::<Response>(&mut buffer) {
                Ok(Some(Envelope { id, body })) => match conn.upgrade() {
                    Some(conn) => conn.route(id, body),
                    None => return,
                },
                Ok(None) => break,
                Err(err) => break 'read ConnectionFailure::Protocol(err.to_string()),
            }
        }
    };

    if let Some(conn) = conn.upgrade() {
        conn.fail(failure);
    }
}
