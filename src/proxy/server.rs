//! Listening socket and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::events;
use crate::proxy::context::Context;
use crate::proxy::handler::HttpProtocolHandler;
use crate::shutdown::Shutdown;
use crate::Result;

/// Accepts client connections and runs one handler task per connection.
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<Context>,
}

impl ProxyServer {
    pub async fn bind(context: Context) -> Result<Self> {
        let addr = context.config.proxy_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Serve until `shutdown` fires, then wait for every handler to finish.
    pub async fn serve(self, shutdown: Shutdown) -> Result<()> {
        let mut handlers = JoinSet::new();

        if let Some(queue) = &self.context.events {
            let rx = queue.subscribe();
            let listener = shutdown.subscribe();
            handlers.spawn(events::run_dispatcher(rx, listener));
        }

        let mut stop = shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = stop.recv() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted client {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Unable to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let handler = HttpProtocolHandler::new(
                        Arc::clone(&self.context),
                        stream,
                        Some(addr),
                        shutdown.subscribe(),
                    );
                    handlers.spawn(handler.run());
                }
                Err(e) => error!("Error accepting connection: {}", e),
            }

            while let Some(finished) = handlers.try_join_next() {
                if let Err(e) = finished {
                    error!("Handler task failed: {}", e);
                }
            }
        }

        info!("Shutting down, waiting for {} handlers", handlers.len());
        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                error!("Handler task failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::HttpParser;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_config() -> Config {
        Config {
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_forwards_to_real_upstream() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .respond_with(ResponseTemplate::new(200).set_body_string("from upstream"))
            .expect(1)
            .mount(&upstream)
            .await;

        let server = ProxyServer::bind(Context::new(local_config())).await.unwrap();
        let proxy_addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let upstream_addr = upstream.address();
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET {}/get HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            upstream.uri(),
            upstream_addr
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = HttpParser::response();
        let mut buf = [0u8; 4096];
        while !response.is_complete() {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            response.parse(&buf[..n]).unwrap();
        }
        assert_eq!(response.status_code(), Some(200));
        assert_eq!(response.body(), Some(&b"from upstream"[..]));

        drop(client);
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = ProxyServer::bind(Context::new(local_config())).await.unwrap();
        let proxy_addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        // an idle client must not hold up shutdown
        let _idle = TcpStream::connect(proxy_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(proxy_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_event_dispatcher_runs_with_events_enabled() {
        let config = Config {
            enable_events: true,
            ..local_config()
        };
        let server = ProxyServer::bind(Context::from_config(config).unwrap())
            .await
            .unwrap();
        let queue = server.context().events.clone().unwrap();
        let shutdown = Shutdown::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.subscriber_count(), 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queue.subscriber_count(), 0);
    }
}
