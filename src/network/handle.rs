use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::network::{MessageFrame, MetaValue};
use crate::{AppError, AppResult};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Lifecycle state of a [`ConnectionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closing,
    Closed,
}

/// One accepted or opened transport connection.
///
/// The handle owns the buffered write half (so `send` works from any task),
/// the lifecycle state, a close signal for its reader task, and the typed
/// per-connection metadata store. The read half lives in the reader task's
/// [`Connection`](crate::network::Connection).
///
/// Ids are assigned monotonically by the owning server and never reused
/// within its lifetime; a client-opened handle counts up per open.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer_addr: SocketAddr,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    state: AtomicU8,
    close_tx: broadcast::Sender<()>,
    metadata: DashMap<String, MetaValue>,
    max_frame_size: usize,
}

impl ConnectionHandle {
    /// Creates a handle around the write half of a freshly split socket.
    ///
    /// The returned receiver must be handed to the reader task before the
    /// handle is shared; a `close` fired in between would otherwise be missed.
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
        max_frame_size: usize,
    ) -> (ConnectionHandle, broadcast::Receiver<()>) {
        let (close_tx, close_rx) = broadcast::channel(1);
        let handle = ConnectionHandle {
            id,
            peer_addr,
            writer: Mutex::new(BufWriter::new(writer)),
            state: AtomicU8::new(STATE_OPEN),
            close_tx,
            metadata: DashMap::new(),
            max_frame_size,
        };
        (handle, close_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> HandleState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => HandleState::Open,
            STATE_CLOSING => HandleState::Closing,
            _ => HandleState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    /// Sends one message payload, framed, as a synchronous write on the
    /// caller's task. A failure is returned to the caller and does not by
    /// itself tear the connection down; that decision belongs to the owner.
    pub async fn send(&self, payload: Bytes) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::ConnectionClosed);
        }
        let frame = MessageFrame::new(payload);
        let mut writer = self.writer.lock().await;
        frame.write_to(&mut *writer, self.max_frame_size).await?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("flush message error: {}", e)))?;
        Ok(())
    }

    /// Closes the transport and signals the reader task to exit.
    ///
    /// Idempotent: only the first caller performs the shutdown, later calls
    /// return `Ok(())` immediately. The shutdown error, if any, goes to that
    /// first caller; teardown paths swallow it.
    pub async fn close(&self) -> AppResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        // reader task may already be gone, a dead receiver is fine
        let _ = self.close_tx.send(());
        let result = {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        self.state.store(STATE_CLOSED, Ordering::Release);
        debug!("{} closed", self);
        result.map_err(AppError::from)
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set_info(&self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns a copy of the value stored under `key`, if any.
    pub fn get_info(&self, key: &str) -> Option<MetaValue> {
        self.metadata.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove_info(&self, key: &str) -> Option<MetaValue> {
        self.metadata.remove(key).map(|(_, value)| value)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{} ({})", self.id, self.peer_addr)
    }
}
