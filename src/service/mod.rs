pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use handler::{ClientHandler, NoopClientHandler, NoopServerHandler, ServerHandler};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod handler;
mod server;
mod shutdown;
mod tracing_config;
