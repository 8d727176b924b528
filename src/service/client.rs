use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::network::{Connection, ConnectionHandle};
use crate::service::handler::ClientHandler;
use crate::service::{ClientConfig, Shutdown};
use crate::{AppError, AppResult};

/// The client side of the framework: at most one connection to a server.
///
/// `open_connection` establishes the transport and starts the reader task;
/// inbound messages and lifecycle events go directly to the injected
/// [`ClientHandler`]. Connection loss is reported through
/// `connection_exception` followed by `connection_closed`; reconnecting is
/// the application's decision, never the core's.
pub struct Client {
    config: RwLock<ClientConfig>,
    handler: Arc<dyn ClientHandler>,
    connection: Mutex<Option<Arc<ConnectionHandle>>>,
    connected: AtomicBool,
    next_connection_id: AtomicU64,
    open_lock: tokio::sync::Mutex<()>,
}

impl Client {
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Arc<Client> {
        Arc::new(Client {
            config: RwLock::new(config),
            handler,
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            open_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens the connection to the configured host and port. A no-op when
    /// already connected. Each successful open replaces the previous handle.
    pub async fn open_connection(self: &Arc<Self>) -> AppResult<()> {
        let _guard = self.open_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let config = self.config.read().clone();
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            AppError::DetailedIoError(format!("failed to connect to {}: {}", addr, e))
        })?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (handle, close_rx) =
            ConnectionHandle::new(id, peer_addr, writer, config.max_frame_size);
        let handle = Arc::new(handle);
        *self.connection.lock() = Some(handle.clone());
        self.connected.store(true, Ordering::SeqCst);
        info!("opened {}", handle);

        let connection = Connection::new(reader, config.read_buffer_size, config.max_frame_size);
        let core = Arc::downgrade(self);
        tokio::spawn(Self::read_loop(
            core,
            handle,
            connection,
            Shutdown::new(close_rx),
        ));

        self.handler.connection_established(self).await;
        Ok(())
    }

    /// Closes the connection and notifies the handler. A no-op when already
    /// disconnected. The close error, if any, is returned after the
    /// notification has fired.
    pub async fn close_connection(&self) -> AppResult<()> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let handle = self.connection.lock().take();
        let mut result = Ok(());
        if let Some(handle) = handle {
            result = handle.close().await;
        }
        if was_connected {
            self.handler.connection_closed(self).await;
        }
        result
    }

    /// Sends one message payload to the server from the caller's task.
    pub async fn send(&self, payload: Bytes) -> AppResult<()> {
        let handle = self.connection.lock().clone();
        match handle {
            Some(handle) => handle.send(payload).await,
            None => Err(AppError::ConnectionClosed),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The current connection handle, for metadata or peer-address access.
    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection.lock().clone()
    }

    pub fn host(&self) -> String {
        self.config.read().host.clone()
    }

    /// Takes effect on the next `open_connection()`.
    pub fn set_host(&self, host: impl Into<String>) {
        self.config.write().host = host.into();
    }

    pub fn port(&self) -> u16 {
        self.config.read().port
    }

    /// Takes effect on the next `open_connection()`.
    pub fn set_port(&self, port: u16) {
        self.config.write().port = port;
    }

    async fn read_loop(
        core: Weak<Client>,
        handle: Arc<ConnectionHandle>,
        mut connection: Connection,
        mut close: Shutdown,
    ) {
        let error = loop {
            let result = tokio::select! {
                res = connection.read_message() => res,
                _ = close.recv() => break None,
            };
            let Some(client) = core.upgrade() else {
                return;
            };
            match result {
                Ok(Some(payload)) => {
                    client.handler.handle_message(&client, payload).await;
                }
                // server closed the connection gracefully
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        let Some(client) = core.upgrade() else {
            return;
        };
        client.teardown(handle, error).await;
    }

    /// Reader-side teardown: report the error (unless the close was
    /// deliberate), release the transport, clear the slot and fire the
    /// closed notification exactly once.
    async fn teardown(&self, handle: Arc<ConnectionHandle>, error: Option<AppError>) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(error) = error {
            if handle.is_open() {
                warn!("{} connection lost: {}", handle, error);
                self.handler.connection_exception(self, &error).await;
            }
        }
        if let Err(e) = handle.close().await {
            debug!("error releasing {}: {}", handle, e);
        }
        {
            let mut slot = self.connection.lock();
            if slot.as_ref().map(|h| h.id()) == Some(handle.id()) {
                *slot = None;
            }
        }
        if was_connected {
            self.handler.connection_closed(self).await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!("client dropped");
    }
}
