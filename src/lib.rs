pub mod certs;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod http;
pub mod plugins;
pub mod proxy;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use connection::Connection;
pub use error::{Error, Result};
pub use http::HttpParser;
pub use proxy::{Context, HttpProxyPlugin, ProxyServer};
pub use server::MitmRelayServer;
pub use shutdown::{Shutdown, ShutdownListener};
