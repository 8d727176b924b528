use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::ConnectionHandle;
use crate::service::client::Client;
use crate::service::server::Server;
use crate::AppError;

/// Application-side callbacks for a [`Server`].
///
/// Every method defaults to a no-op, so an embedding application implements
/// only the events it cares about. All callbacks are invoked from the
/// server's single dispatch task: no two of them ever run concurrently for
/// the same server instance, which keeps shared application state simple to
/// reason about at the cost of server-wide throughput.
///
/// Callbacks receive the server so they can call back in (broadcast, close,
/// metadata on other clients) without holding their own reference.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// One decoded inbound message from one client. Exactly-once per
    /// successful read, in per-connection order.
    async fn handle_message(
        &self,
        _server: &Server,
        _client: &Arc<ConnectionHandle>,
        _payload: Bytes,
    ) {
    }

    async fn client_connected(&self, _server: &Server, _client: &Arc<ConnectionHandle>) {}

    async fn client_disconnected(&self, _server: &Server, _client: &Arc<ConnectionHandle>) {}

    /// A read error terminated `client`'s connection; teardown has already
    /// begun and `client_disconnected` will follow.
    async fn client_exception(
        &self,
        _server: &Server,
        _client: &Arc<ConnectionHandle>,
        _error: &AppError,
    ) {
    }

    /// The accept loop died from an I/O error that was not a deliberate stop.
    async fn listening_exception(&self, _server: &Server, _error: &AppError) {}

    async fn server_started(&self, _server: &Server) {}

    async fn server_stopped(&self, _server: &Server) {}

    async fn server_closed(&self, _server: &Server) {}
}

/// Application-side callbacks for a [`Client`]. Invoked directly from the
/// client's reader task (a single connection needs no extra serialization).
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn handle_message(&self, _client: &Client, _payload: Bytes) {}

    async fn connection_established(&self, _client: &Client) {}

    async fn connection_closed(&self, _client: &Client) {}

    /// Connection loss detected by the reader task. There is no automatic
    /// reconnection; that decision belongs to the application.
    async fn connection_exception(&self, _client: &Client, _error: &AppError) {}
}

/// Default do-nothing server handler.
#[derive(Debug, Default)]
pub struct NoopServerHandler;

#[async_trait]
impl ServerHandler for NoopServerHandler {}

/// Default do-nothing client handler.
#[derive(Debug, Default)]
pub struct NoopClientHandler;

#[async_trait]
impl ClientHandler for NoopClientHandler {}
