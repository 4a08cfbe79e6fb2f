//! Per-connection protocol handler and relay loop.
//!
//! One handler owns the client leg of an accepted connection and, once a
//! request names an upstream, the server leg. A single readiness future polls
//! client read, server write, server read and client write in that order, so
//! the task only wakes when a stream it owns is ready.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, Role, Stream};
use crate::events::EventName;
use crate::http::{HttpParser, ParserState, PROXY_AGENT};
use crate::proxy::context::Context;
use crate::proxy::plugin::{ClientHandle, ClientOutbox, PluginChain, PluginContext};
use crate::proxy::tunnel::{TunnelContext, PROXY_TUNNEL_ESTABLISHED};
use crate::shutdown::ShutdownListener;
use crate::{Error, Result};

/// Stop reading from one side while the other side's backlog is this large.
const BACKLOG_HIGH_WATER: usize = 1024 * 1024;

const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingRequest,
    RequestComplete,
    AwaitingUpstreamConnect,
    Relaying,
    TunnelUpgrade,
    Closed,
}

#[derive(Debug)]
enum RelayEvent {
    ClientData(Bytes),
    ClientEof,
    ServerData(Bytes),
    ServerEof,
    ClientFlushed(usize),
    ServerFlushed(usize),
}

#[derive(Debug, Clone)]
struct RequestSummary {
    method: String,
    host: String,
    port: u16,
    path: String,
}

pub struct HttpProtocolHandler {
    context: Arc<Context>,
    request_id: Uuid,
    state: HandlerState,
    client: Connection,
    client_addr: Option<SocketAddr>,
    client_eof: bool,
    server: Option<Connection>,
    server_eof: bool,
    upstream: Option<(String, u16)>,
    plugins: PluginChain,
    outbox: ClientOutbox,
    request: HttpParser,
    response: HttpParser,
    // cleared after the first unparseable upstream byte
    track_responses: bool,
    /// Methods of forwarded requests whose responses have not started yet.
    pending_methods: VecDeque<String>,
    tunneled: bool,
    intercepted: Option<(String, u16)>,
    last_request: Option<RequestSummary>,
    last_status: Option<(u16, String)>,
    response_bytes: usize,
    started: Instant,
    shutdown: ShutdownListener,
}

impl HttpProtocolHandler {
    pub fn new<S>(
        context: Arc<Context>,
        stream: S,
        client_addr: Option<SocketAddr>,
        shutdown: ShutdownListener,
    ) -> Self
    where
        S: Stream + 'static,
    {
        let (client_handle, outbox) = ClientHandle::new(client_addr);
        let plugins = context.plugins.build_chain(&PluginContext {
            config: Arc::clone(&context.config),
            client: client_handle,
        });
        let client = Connection::new(
            Role::Client,
            stream,
            client_addr,
            context.config.client_recvbuf_size,
        );
        let body_limit = context.config.body_limit();

        Self {
            context,
            request_id: Uuid::new_v4(),
            state: HandlerState::AwaitingRequest,
            client,
            client_addr,
            client_eof: false,
            server: None,
            server_eof: false,
            upstream: None,
            plugins,
            outbox,
            request: HttpParser::request().with_max_body_size(body_limit),
            response: HttpParser::response().with_max_body_size(body_limit),
            track_responses: true,
            pending_methods: VecDeque::new(),
            tunneled: false,
            intercepted: None,
            last_request: None,
            last_status: None,
            response_bytes: 0,
            started: Instant::now(),
            shutdown,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    fn request_parser(&self) -> HttpParser {
        HttpParser::request().with_max_body_size(self.context.config.body_limit())
    }

    fn response_parser(&self) -> HttpParser {
        HttpParser::response().with_max_body_size(self.context.config.body_limit())
    }

    /// Relay until either side is done, then tear both legs down.
    pub async fn run(mut self) {
        self.publish(EventName::WorkStarted, json!({ "client": self.client_label() }));

        if let Err(err) = self.relay().await {
            self.on_error(err).await;
        }
        self.teardown().await;
    }

    async fn relay(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();

        while !self.should_terminate() {
            let event = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("{} closing for shutdown", self.client_label());
                    return Ok(());
                }
                event = poll_fn(|cx| self.poll_event(cx)) => event?,
            };

            match event {
                RelayEvent::ClientData(data) => self.on_client_data(data).await?,
                RelayEvent::ClientEof => {
                    debug!("{} closed by client", self.client_label());
                    self.client_eof = true;
                }
                RelayEvent::ServerData(chunk) => self.on_server_data(chunk),
                RelayEvent::ServerEof => {
                    debug!("{:?} closed by server", self.upstream);
                    self.server_eof = true;
                }
                RelayEvent::ClientFlushed(_) | RelayEvent::ServerFlushed(_) => {}
            }
        }
        Ok(())
    }

    fn should_terminate(&self) -> bool {
        if self.client.is_closed() {
            return true;
        }
        let server_pending = self.server.as_ref().is_some_and(Connection::has_buffer);
        (self.client_eof && !server_pending) || (self.server_eof && !self.client.has_buffer())
    }

    fn poll_event(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<RelayEvent>> {
        let server_backlog = self.server.as_ref().map_or(0, |s| s.backlog().len());
        if !self.client_eof && server_backlog < BACKLOG_HIGH_WATER {
            match self.client.poll_receive(cx) {
                Poll::Ready(Ok(Some(data))) => return Poll::Ready(Ok(RelayEvent::ClientData(data))),
                Poll::Ready(Ok(None)) => return Poll::Ready(Ok(RelayEvent::ClientEof)),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        if let Some(server) = self.server.as_mut() {
            if server.has_buffer() {
                if let Poll::Ready(sent) = server.poll_flush_once(cx) {
                    return Poll::Ready(sent.map(RelayEvent::ServerFlushed));
                }
            }
            if !self.server_eof && self.client.backlog().len() < BACKLOG_HIGH_WATER {
                match server.poll_receive(cx) {
                    Poll::Ready(Ok(Some(chunk))) => {
                        return Poll::Ready(Ok(RelayEvent::ServerData(chunk)))
                    }
                    Poll::Ready(Ok(None)) => return Poll::Ready(Ok(RelayEvent::ServerEof)),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }
        }

        if self.client.has_buffer() {
            if let Poll::Ready(sent) = self.client.poll_flush_once(cx) {
                return Poll::Ready(sent.map(RelayEvent::ClientFlushed));
            }
        }
        Poll::Pending
    }

    /// Bytes flow straight through: CONNECT without interception.
    fn is_opaque_tunnel(&self) -> bool {
        self.tunneled && self.intercepted.is_none()
    }

    async fn on_client_data(&mut self, data: Bytes) -> Result<()> {
        if self.is_opaque_tunnel() {
            if let Some(server) = self.server.as_mut() {
                server.enqueue(&data);
            }
            return Ok(());
        }

        self.request.parse(&data)?;
        while self.request.is_complete() {
            let leftover = self.request.take_remaining();
            // the TLS handshake must start on a fresh read after the 200
            if self.request.is_connect()
                && !leftover.is_empty()
                && !self.tunneled
                && self.context.interception.is_some()
            {
                return Err(Error::protocol(
                    "client sent data before the CONNECT tunnel was established",
                ));
            }
            self.on_request_complete().await?;
            self.request = self.request_parser();

            if leftover.is_empty() {
                break;
            }
            if self.is_opaque_tunnel() {
                if let Some(server) = self.server.as_mut() {
                    server.enqueue(leftover);
                }
                break;
            }
            self.request.parse(&leftover)?;
        }
        Ok(())
    }

    async fn on_request_complete(&mut self) -> Result<()> {
        self.state = HandlerState::RequestComplete;
        if self.intercepted.is_none() {
            self.authenticate()?;
        }

        let suppressed = self
            .plugins
            .before_upstream_connection(&mut self.request)
            .is_break();
        self.drain_outbox();

        // inside an intercepted tunnel the server leg is already fixed
        if !suppressed && self.intercepted.is_none() {
            let (host, port) = self
                .request
                .upstream_address()
                .ok_or_else(|| Error::protocol("request does not name an upstream host"))?;
            self.state = HandlerState::AwaitingUpstreamConnect;
            self.connect_upstream(host, port).await?;
        }

        let forward = self
            .plugins
            .handle_client_request(&mut self.request)
            .is_continue();
        self.drain_outbox();
        self.record_request();
        self.state = HandlerState::Relaying;

        if suppressed || !forward {
            return Ok(());
        }

        if self.request.is_connect() {
            if self.tunneled {
                return Err(Error::protocol("CONNECT inside an established tunnel"));
            }
            return self.establish_tunnel().await;
        }

        let packet = self.build_forward_packet()?;
        let server = self
            .server
            .as_mut()
            .ok_or(Error::ConnectionClosed("server"))?;
        server.enqueue(packet);
        if let Some(method) = self.request.method() {
            self.pending_methods.push_back(method.to_string());
        }
        Ok(())
    }

    fn authenticate(&self) -> Result<()> {
        let Some(expected) = self.context.proxy_authorization() else {
            return Ok(());
        };
        match self.request.header("Proxy-Authorization") {
            Some(value) if value.trim_ascii() == expected.as_bytes() => Ok(()),
            _ => Err(Error::ProxyAuthenticationRequired),
        }
    }

    async fn connect_upstream(&mut self, host: String, port: u16) -> Result<()> {
        if self.server.is_some() {
            let same = matches!(&self.upstream, Some((h, p)) if *h == host && *p == port);
            if same && !self.server_eof {
                return Ok(());
            }
            self.close_server();
        }

        let connector = Arc::clone(&self.context.connector);
        let (stream, peer) = connector.connect(&host, port).await?;
        self.server = Some(Connection::from_boxed(
            Role::Server,
            stream,
            peer,
            self.context.config.server_recvbuf_size,
        ));
        self.server_eof = false;
        self.response = self.response_parser();
        self.track_responses = true;
        self.pending_methods.clear();
        self.upstream = Some((host, port));
        Ok(())
    }

    fn close_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.close();
            self.plugins.on_upstream_connection_close();
            debug!("Closed upstream connection {:?}", self.upstream);
        }
    }

    fn build_forward_packet(&mut self) -> Result<Vec<u8>> {
        if self.intercepted.is_none() {
            self.request
                .del_headers(&["Proxy-Authorization", "Proxy-Connection"]);
            self.request
                .headers_mut()
                .append("Via", format!("1.1 {}", PROXY_AGENT));
        }
        Ok(self.request.build(&self.context.config.disable_headers)?)
    }

    async fn establish_tunnel(&mut self) -> Result<()> {
        let (host, port) = self
            .upstream
            .clone()
            .ok_or(Error::ConnectionClosed("server"))?;

        self.client.enqueue(PROXY_TUNNEL_ESTABLISHED);
        self.client.flush_all().await?;
        self.tunneled = true;

        let Some(interception) = self.context.interception.clone() else {
            debug!("Relaying opaque tunnel to {}:{}", host, port);
            self.publish(
                EventName::TunnelEstablished,
                json!({ "host": host, "port": port, "intercepted": false }),
            );
            return Ok(());
        };

        self.state = HandlerState::TunnelUpgrade;
        let mut tunnel = TunnelContext::new(
            host.clone(),
            port,
            interception.ca_cert().map(Path::to_path_buf),
        );

        let leaf = interception.issue_certificate(&host).await?;
        tunnel.certificate = Some(leaf.clone());

        interception.upgrade_client(&mut self.client, &leaf).await?;
        tunnel.mark_client_ready();

        let server = self
            .server
            .as_mut()
            .ok_or(Error::ConnectionClosed("server"))?;
        interception.upgrade_server(server, &host).await?;
        tunnel.mark_server_ready();

        if tunnel.is_established() {
            debug!("TLS interception established for {}:{}", tunnel.host, tunnel.port);
            drop(tunnel);
            self.request = self.request_parser();
            self.response = self.response_parser();
            self.track_responses = true;
            self.pending_methods.clear();
            self.intercepted = Some((host.clone(), port));
            self.publish(
                EventName::TunnelEstablished,
                json!({ "host": host, "port": port, "intercepted": true }),
            );
        }
        self.state = HandlerState::Relaying;
        Ok(())
    }

    fn on_server_data(&mut self, chunk: Bytes) {
        let chunk = self.plugins.handle_upstream_chunk(chunk);
        self.response_bytes += chunk.len();
        if !self.is_opaque_tunnel() {
            self.track_response(&chunk);
        }
        self.client.enqueue(&chunk);
        self.drain_outbox();
    }

    /// Parse upstream bytes only to learn the status of each response.
    fn track_response(&mut self, chunk: &[u8]) {
        if !self.track_responses {
            return;
        }
        self.bind_pending_method();
        if let Err(e) = self.response.parse(chunk) {
            debug!("Not tracking responses from {:?}: {}", self.upstream, e);
            self.track_responses = false;
            return;
        }

        while self.response.is_complete() {
            if let Some(status) = self.response.status_code() {
                let reason = self.response.reason().unwrap_or_default().to_string();
                self.last_status = Some((status, reason));
                // an interim response is followed by the final one
                if (100..200).contains(&status) && status != 101 {
                    if let Some(method) = self.response.request_method() {
                        self.pending_methods.push_front(method.to_string());
                    }
                }
            }
            let leftover = self.response.take_remaining();
            self.response = self.response_parser();
            if leftover.is_empty() {
                break;
            }
            self.bind_pending_method();
            if let Err(e) = self.response.parse(&leftover) {
                debug!("Not tracking responses from {:?}: {}", self.upstream, e);
                self.track_responses = false;
                break;
            }
        }
    }

    fn bind_pending_method(&mut self) {
        if self.response.state() != ParserState::Initialized
            || self.response.request_method().is_some()
        {
            return;
        }
        if let Some(method) = self.pending_methods.pop_front() {
            self.response.set_request_method(method);
        }
    }

    fn drain_outbox(&mut self) {
        for data in self.outbox.drain() {
            self.client.enqueue(&data);
        }
    }

    fn record_request(&mut self) {
        let method = self.request.method().unwrap_or_default().to_string();
        let (host, port) = self
            .intercepted
            .clone()
            .or_else(|| self.request.upstream_address())
            .unwrap_or_default();
        let path = self.request.path().unwrap_or_default().to_string();

        self.publish(
            EventName::RequestComplete,
            json!({ "method": method, "host": host, "port": port, "path": path }),
        );
        self.last_request = Some(RequestSummary {
            method,
            host,
            port,
            path,
        });
    }

    async fn on_error(&mut self, err: Error) {
        if err.is_transport() {
            debug!("{}: {}", self.client_label(), err);
        } else {
            warn!("{}: {}", self.client_label(), err);
        }

        let Some(packet) = err.client_response() else {
            return;
        };
        if self.client.is_closed() {
            return;
        }
        self.client.enqueue(packet);
        if let Ok(Err(e)) =
            tokio::time::timeout(FINAL_FLUSH_TIMEOUT, self.client.flush_all()).await
        {
            debug!("Unable to deliver error response: {}", e);
        }
    }

    async fn teardown(&mut self) {
        if self.client.has_buffer() && !self.client.is_closed() {
            let _ = tokio::time::timeout(FINAL_FLUSH_TIMEOUT, self.client.flush_all()).await;
        }
        let _ = tokio::time::timeout(FINAL_FLUSH_TIMEOUT, self.client.shutdown()).await;
        self.client.close();
        self.close_server();
        self.state = HandlerState::Closed;

        self.access_log();
        self.publish(
            EventName::WorkFinished,
            json!({ "client": self.client_label(), "bytes": self.response_bytes }),
        );
    }

    fn access_log(&self) {
        let client = self.client_label();
        let elapsed = self.started.elapsed().as_secs_f64() * 1000.0;

        match &self.last_request {
            Some(req) if req.method == "CONNECT" && self.intercepted.is_none() => info!(
                "{} - {} {}:{} - {} bytes - {:.2} ms",
                client, req.method, req.host, req.port, self.response_bytes, elapsed
            ),
            Some(req) => {
                let (status, reason) = match &self.last_status {
                    Some((status, reason)) => (status.to_string(), reason.as_str()),
                    None => ("-".to_string(), "-"),
                };
                info!(
                    "{} - {} {}:{}{} - {} {} - {} bytes - {:.2} ms",
                    client,
                    req.method,
                    req.host,
                    req.port,
                    req.path,
                    status,
                    reason,
                    self.response_bytes,
                    elapsed
                );
            }
            None => debug!("{} closed without a complete request after {:.2} ms", client, elapsed),
        }
    }

    fn publish(&self, name: EventName, payload: serde_json::Value) {
        if let Some(events) = &self.context.events {
            events.publish(self.request_id, name, payload, Some("HttpProtocolHandler"));
        }
    }

    fn client_label(&self) -> String {
        self.client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
