mod network;
mod service;

pub use network::{Connection, ConnectionHandle, HandleState, MessageFrame, MetaValue};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientConfig, ClientHandler,
    NoopClientHandler, NoopServerHandler, Server, ServerConfig, ServerHandler, Shutdown,
};
