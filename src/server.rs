use tokio::signal;
use tracing::{error, info};

use crate::config::Config;
use crate::proxy::{Context, ProxyServer};
use crate::shutdown::Shutdown;
use crate::Result;

/// The whole process: proxy listener plus Ctrl+C handling.
pub struct MitmRelayServer {
    proxy: ProxyServer,
    shutdown: Shutdown,
}

impl MitmRelayServer {
    pub async fn new(config: Config) -> Result<Self> {
        let context = Context::from_config(config)?;
        let proxy = ProxyServer::bind(context).await?;
        Ok(Self {
            proxy,
            shutdown: Shutdown::new(),
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting mitm-relay on {}", self.proxy.local_addr()?);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Unable to listen for Ctrl+C: {}", e),
            }
            shutdown.trigger();
        });

        self.proxy.serve(self.shutdown).await?;
        info!("Shut down gracefully");
        Ok(())
    }
}
