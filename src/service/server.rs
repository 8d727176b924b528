use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{Connection, ConnectionHandle};
use crate::service::handler::ServerHandler;
use crate::service::{ServerConfig, Shutdown};
use crate::{AppError, AppResult};

/// A lifecycle or inbound-message event funneled through the server's single
/// dispatch task. One queue, one consumer: the application handler never
/// observes two callbacks concurrently.
enum ServerEvent {
    Message {
        client: Arc<ConnectionHandle>,
        payload: Bytes,
    },
    Connected(Arc<ConnectionHandle>),
    Disconnected(Arc<ConnectionHandle>),
    ClientException {
        client: Arc<ConnectionHandle>,
        error: AppError,
    },
    ListeningException(AppError),
    Started,
    Stopped,
    Closed,
}

/// The server side of the framework.
///
/// Owns the listening socket, the accept loop, and the registry of active
/// connections, and delegates every inbound message and lifecycle event to
/// the injected [`ServerHandler`].
///
/// Lifecycle: `Stopped -> Listening` via [`listen`](Server::listen),
/// `Listening -> Stopped` via [`stop_listening`](Server::stop_listening)
/// (cooperative, observed within the accept timeout), and
/// [`close`](Server::close) from either state releases the listening socket
/// and every registered connection. A closed server may `listen` again; the
/// socket is recreated lazily.
pub struct Server {
    config: RwLock<ServerConfig>,
    handler: Arc<dyn ServerHandler>,
    /// Active connections by id. Insert on accept, remove by id on
    /// disconnect/close; ids are never reused within this server's lifetime.
    registry: DashMap<u64, Arc<ConnectionHandle>>,
    next_connection_id: AtomicU64,
    listening: AtomicBool,
    stop_requested: AtomicBool,
    /// Distinguishes accept loops across listen/stop cycles so a superseded
    /// loop's exit does not clobber a newer loop's listening flag.
    accept_generation: AtomicU64,
    listener: Mutex<Option<Arc<TcpListener>>>,
    notify_stop: Mutex<Option<broadcast::Sender<()>>>,
    event_tx: Sender<ServerEvent>,
    event_rx: Mutex<Option<Receiver<ServerEvent>>>,
    dispatch_started: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Arc<Server> {
        let (event_tx, event_rx) = async_channel::bounded(config.event_channel_capacity);
        Arc::new(Server {
            config: RwLock::new(config),
            handler,
            registry: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            listening: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            accept_generation: AtomicU64::new(0),
            listener: Mutex::new(None),
            notify_stop: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            dispatch_started: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Starts listening for connections.
    ///
    /// Lazily binds the listening socket with the configured port and
    /// backlog, clears the stop flag and spawns the accept loop. Calling
    /// while already listening is a no-op. A bind failure is returned to the
    /// caller and leaves the server stopped.
    pub async fn listen(self: &Arc<Self>) -> AppResult<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let config = self.config.read().clone();

        let listener = match self.acquire_listener(&config) {
            Ok(listener) => listener,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (stop_tx, shutdown) = Shutdown::pair();
        *self.notify_stop.lock() = Some(stop_tx);

        self.ensure_dispatch();
        self.emit(ServerEvent::Started).await;

        let generation = self.accept_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let accept_timeout = Duration::from_millis(config.accept_timeout_ms);
        let core = Arc::downgrade(self);
        tokio::spawn(Self::accept_loop(
            core,
            generation,
            listener,
            shutdown,
            accept_timeout,
        ));
        Ok(())
    }

    /// Requests the accept loop to stop. Never blocks and never touches
    /// already-registered connections; the loop observes the request at the
    /// next accept-timeout boundary at the latest.
    pub fn stop_listening(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = self.notify_stop.lock().take() {
            let _ = stop_tx.send(());
        }
    }

    /// Closes the server: stops listening, releases the listening socket,
    /// best-effort closes every registered connection and clears the
    /// registry. Per-connection failures are swallowed; one misbehaving
    /// socket must not keep the rest open. Serialized against concurrent
    /// `close` calls so the listening socket is released exactly once.
    /// Before anything has been bound the call is a no-op.
    pub async fn close(&self) {
        let _guard = self.close_lock.lock().await;
        // nothing was ever bound and nothing is registered: there is nothing
        // to release, and no closed notification to deliver
        if self.listener.lock().is_none() && self.registry.is_empty() {
            return;
        }
        self.stop_listening();
        // the accept loop holds its own reference and exits promptly on the
        // stop signal; dropping ours here releases the socket with it
        *self.listener.lock() = None;

        let clients: Vec<_> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for client in clients {
            if let Err(e) = client.close().await {
                warn!("error closing {}: {}", client, e);
            }
        }
        self.registry.clear();
        self.emit(ServerEvent::Closed).await;
    }

    /// Best-effort broadcast of one message to every registered connection.
    ///
    /// Iterates a registry snapshot; a send failure on one connection is
    /// swallowed and delivery continues for the rest. No ordering guarantee
    /// across clients, and a connection racing into the registry may or may
    /// not receive a broadcast already in flight.
    pub async fn send_to_all_clients(&self, payload: Bytes) {
        let clients: Vec<_> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for client in clients {
            if let Err(e) = client.send(payload.clone()).await {
                debug!("broadcast to {} failed: {}", client, e);
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the currently registered connections.
    pub fn client_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_client(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.registry.get(&id).map(|entry| entry.value().clone())
    }

    /// The address actually bound, once a listening socket exists. Callers
    /// configuring port 0 discover the effective port here.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.listener.lock();
        slot.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn port(&self) -> u16 {
        self.config.read().port
    }

    /// Takes effect the next time a listening socket is created.
    pub fn set_port(&self, port: u16) {
        self.config.write().port = port;
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read().accept_timeout_ms)
    }

    /// Takes effect on the next `listen()`.
    pub fn set_accept_timeout(&self, timeout: Duration) {
        self.config.write().accept_timeout_ms = timeout.as_millis() as u64;
    }

    pub fn backlog(&self) -> u32 {
        self.config.read().backlog
    }

    /// Takes effect the next time a listening socket is created.
    pub fn set_backlog(&self, backlog: u32) {
        self.config.write().backlog = backlog;
    }

    fn acquire_listener(&self, config: &ServerConfig) -> AppResult<Arc<TcpListener>> {
        let mut slot = self.listener.lock();
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.clone());
        }
        let addr: SocketAddr = format!("{}:{}", config.ip, config.port)
            .parse()
            .map_err(|e| AppError::InvalidValue(format!("listen address: {}", e)))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|e| AppError::BindError(format!("failed to bind {}: {}", addr, e)))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| AppError::BindError(format!("failed to listen on {}: {}", addr, e)))?;
        match listener.local_addr() {
            Ok(local) => info!("server listening on {}", local),
            Err(_) => info!("server listening on {}", addr),
        }
        let listener = Arc::new(listener);
        *slot = Some(listener.clone());
        Ok(listener)
    }

    /// Spawns the single event-dispatch task on first use. It holds only a
    /// weak reference and exits when the server is dropped.
    fn ensure_dispatch(self: &Arc<Self>) {
        if self.dispatch_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(event_rx) = self.event_rx.lock().take() else {
            return;
        };
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            debug!("server dispatch task started");
            while let Ok(event) = event_rx.recv().await {
                let Some(server) = core.upgrade() else {
                    break;
                };
                server.dispatch(event).await;
            }
            debug!("server dispatch task exited");
        });
    }

    async fn dispatch(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message { client, payload } => {
                self.handler.handle_message(self, &client, payload).await;
            }
            ServerEvent::Connected(client) => {
                self.handler.client_connected(self, &client).await;
            }
            ServerEvent::Disconnected(client) => {
                self.handler.client_disconnected(self, &client).await;
            }
            ServerEvent::ClientException { client, error } => {
                self.handler.client_exception(self, &client, &error).await;
            }
            ServerEvent::ListeningException(error) => {
                self.handler.listening_exception(self, &error).await;
            }
            ServerEvent::Started => self.handler.server_started(self).await,
            ServerEvent::Stopped => self.handler.server_stopped(self).await,
            ServerEvent::Closed => self.handler.server_closed(self).await,
        }
    }

    async fn emit(&self, event: ServerEvent) {
        if self.event_tx.send(event).await.is_err() {
            error!("server event queue closed, event dropped");
        }
    }

    async fn accept_loop(
        core: Weak<Server>,
        generation: u64,
        listener: Arc<TcpListener>,
        mut shutdown: Shutdown,
        accept_timeout: Duration,
    ) {
        debug!("accept loop started");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                res = time::timeout(accept_timeout, listener.accept()) => res,
            };
            let Some(server) = core.upgrade() else {
                return;
            };
            match accepted {
                // timeout elapsed with no incoming connection, re-check stop
                Err(_) => continue,
                Ok(Ok((socket, addr))) => server.register(socket, addr).await,
                Ok(Err(e)) => {
                    if !server.stop_requested.load(Ordering::SeqCst) {
                        error!("accept error: {}", e);
                        server.emit(ServerEvent::ListeningException(e.into())).await;
                    }
                    break;
                }
            }
        }
        if let Some(server) = core.upgrade() {
            if server.accept_generation.load(Ordering::SeqCst) == generation {
                server.listening.store(false, Ordering::SeqCst);
            }
            server.emit(ServerEvent::Stopped).await;
        }
        debug!("accept loop exited");
    }

    async fn register(self: &Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let config = self.config.read().clone();
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = socket.into_split();
        let (handle, close_rx) =
            ConnectionHandle::new(id, addr, writer, config.max_frame_size);
        let client = Arc::new(handle);
        self.registry.insert(id, client.clone());
        info!("accepted {}", client);
        self.emit(ServerEvent::Connected(client.clone())).await;

        let connection = Connection::new(reader, config.read_buffer_size, config.max_frame_size);
        let core = Arc::downgrade(self);
        tokio::spawn(Self::read_loop(
            core,
            client,
            connection,
            Shutdown::new(close_rx),
        ));
    }

    /// Per-connection reader. Decodes messages until clean EOF, a read
    /// error, or the handle's close signal, then runs the common teardown.
    async fn read_loop(
        core: Weak<Server>,
        client: Arc<ConnectionHandle>,
        mut connection: Connection,
        mut close: Shutdown,
    ) {
        let error = loop {
            let result = tokio::select! {
                res = connection.read_message() => res,
                _ = close.recv() => break None,
            };
            match result {
                Ok(Some(payload)) => {
                    let Some(server) = core.upgrade() else {
                        return;
                    };
                    let event = ServerEvent::Message {
                        client: client.clone(),
                        payload,
                    };
                    if server.event_tx.send(event).await.is_err() {
                        break None;
                    }
                }
                // peer closed the connection gracefully
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        let Some(server) = core.upgrade() else {
            return;
        };
        server.unregister(client, error).await;
    }

    /// Common teardown for a connection: remove from the registry by id,
    /// report a read error (unless the close was deliberate), release the
    /// transport and notify the handler of the disconnect. Errors here are
    /// swallowed.
    async fn unregister(&self, client: Arc<ConnectionHandle>, error: Option<AppError>) {
        self.registry.remove(&client.id());
        if let Some(error) = error {
            if client.is_open() {
                debug!("{} read error: {}", client, error);
                self.emit(ServerEvent::ClientException {
                    client: client.clone(),
                    error,
                })
                .await;
            }
        }
        let _ = client.close().await;
        self.emit(ServerEvent::Disconnected(client)).await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("server dropped");
    }
}
