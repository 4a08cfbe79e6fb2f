//! The proxy core: per-connection handler, plugin hooks and tunnel interception.

pub mod context;
pub mod handler;
pub mod plugin;
pub mod server;
pub mod tunnel;
pub mod upstream;

pub use context::Context;
pub use handler::{HandlerState, HttpProtocolHandler};
pub use plugin::{
    ClientHandle, HttpProxyPlugin, PluginChain, PluginContext, PluginFactory, PluginRegistry,
};
pub use server::ProxyServer;
pub use tunnel::{Interception, OpensslUpgrader, TlsUpgrader, TunnelContext, TunnelState};
pub use upstream::{TcpConnector, UpstreamConnector};
