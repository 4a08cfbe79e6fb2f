use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::BoxedStream;
use crate::{Error, Result};

/// Opens the server leg of a proxied connection.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<(BoxedStream, Option<SocketAddr>)>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.connect_timeout())
    }
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<(BoxedStream, Option<SocketAddr>)> {
        // tries every resolved address, v4 and v6
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::upstream_connect(host, port, e)),
            Err(_) => {
                return Err(Error::upstream_connect(
                    host,
                    port,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Unable to set TCP_NODELAY for {}:{}: {}", host, port, e);
        }
        let peer = stream.peer_addr().ok();
        debug!("Connected to upstream {}:{} ({:?})", host, port, peer);
        Ok((Box::new(stream), peer))
    }
}
