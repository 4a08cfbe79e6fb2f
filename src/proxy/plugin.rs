//! Plugin hook contract and ordered dispatch.
//!
//! A plugin sees traffic at four points:
//!
//! 1. [`HttpProxyPlugin::before_upstream_connection`] once a request is fully
//!    parsed. `Break` suppresses the upstream connection.
//! 2. [`HttpProxyPlugin::handle_client_request`] after the connection
//!    decision. `Break` drops the request.
//! 3. [`HttpProxyPlugin::handle_upstream_chunk`] for each upstream chunk, in
//!    arrival order.
//! 4. [`HttpProxyPlugin::on_upstream_connection_close`] when the upstream leg
//!    closes.
//!
//! Within a hook the first plugin to break wins; later plugins are skipped for
//! that message.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::http::HttpParser;

pub trait HttpProxyPlugin: Send {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn before_upstream_connection(&mut self, _request: &mut HttpParser) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn handle_client_request(&mut self, _request: &mut HttpParser) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Bytes {
        chunk
    }

    fn on_upstream_connection_close(&mut self) {}
}

/// Write access to the client leg for plugins.
///
/// Bytes queued here are appended to the client backlog as soon as the
/// current hook returns.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    addr: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Bytes>,
}

impl ClientHandle {
    pub fn new(addr: Option<SocketAddr>) -> (Self, ClientOutbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { addr, outbox: tx }, ClientOutbox { rx })
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn queue(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let len = data.len();
        // the handler is gone once the receiver is dropped
        if self.outbox.send(data).is_err() {
            return 0;
        }
        len
    }
}

#[derive(Debug)]
pub struct ClientOutbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ClientOutbox {
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut queued = Vec::new();
        while let Ok(data) = self.rx.try_recv() {
            queued.push(data);
        }
        queued
    }
}

/// What every plugin is constructed with.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub config: Arc<Config>,
    pub client: ClientHandle,
}

pub type PluginFactory = Arc<dyn Fn(&PluginContext) -> Box<dyn HttpProxyPlugin> + Send + Sync>;

/// Plugin factories, fixed at startup and shared by all handlers.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Vec<(String, PluginFactory)>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|(name, _)| name))
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginContext) -> Box<dyn HttpProxyPlugin> + Send + Sync + 'static,
    {
        self.factories.push((name.into(), Arc::new(factory)));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(name, _)| name.as_str())
    }

    /// Fresh plugin instances for one client connection, in registration order.
    pub fn build_chain(&self, context: &PluginContext) -> PluginChain {
        PluginChain {
            plugins: self
                .factories
                .iter()
                .map(|(_, factory)| factory(context))
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn HttpProxyPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Box<dyn HttpProxyPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn before_upstream_connection(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        for plugin in self.plugins.iter_mut() {
            if plugin.before_upstream_connection(request).is_break() {
                debug!("{} suppressed the upstream connection", plugin.name());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        for plugin in self.plugins.iter_mut() {
            if plugin.handle_client_request(request).is_break() {
                debug!("{} dropped the client request", plugin.name());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Bytes {
        self.plugins
            .iter_mut()
            .fold(chunk, |chunk, plugin| plugin.handle_upstream_chunk(chunk))
    }

    pub fn on_upstream_connection_close(&mut self) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_upstream_connection_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn record(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        label: &'static str,
        journal: Journal,
        stop_before: bool,
        stop_request: bool,
    }

    impl Recorder {
        fn boxed(label: &'static str, journal: &Journal) -> Box<Self> {
            Box::new(Self {
                label,
                journal: journal.clone(),
                stop_before: false,
                stop_request: false,
            })
        }
    }

    impl HttpProxyPlugin for Recorder {
        fn before_upstream_connection(&mut self, _request: &mut HttpParser) -> ControlFlow<()> {
            self.journal.record(format!("{}:before", self.label));
            if self.stop_before {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }

        fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
            self.journal.record(format!("{}:request", self.label));
            request.add_header("X-Seen-By", self.label);
            if self.stop_request {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }

        fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Bytes {
            let mut out = chunk.to_vec();
            out.extend_from_slice(self.label.as_bytes());
            Bytes::from(out)
        }

        fn on_upstream_connection_close(&mut self) {
            self.journal.record(format!("{}:close", self.label));
        }
    }

    fn request() -> HttpParser {
        HttpParser::parse_request(b"GET http://example.org/ HTTP/1.1\r\n\r\n").unwrap()
    }

    #[test]
    fn test_hooks_run_in_chain_order() {
        let journal = Journal::default();
        let mut chain = PluginChain::new();
        chain.push(Recorder::boxed("a", &journal));
        chain.push(Recorder::boxed("b", &journal));

        let mut req = request();
        assert!(chain.before_upstream_connection(&mut req).is_continue());
        assert!(chain.handle_client_request(&mut req).is_continue());
        chain.on_upstream_connection_close();

        assert_eq!(
            journal.entries(),
            vec!["a:before", "b:before", "a:request", "b:request", "a:close", "b:close"]
        );
        assert_eq!(req.headers().get_str("X-Seen-By"), Some("b"));
    }

    #[test]
    fn test_first_break_wins() {
        let journal = Journal::default();
        let mut chain = PluginChain::new();
        let mut first = Recorder::boxed("a", &journal);
        first.stop_before = true;
        first.stop_request = true;
        chain.push(first);
        chain.push(Recorder::boxed("b", &journal));

        let mut req = request();
        assert!(chain.before_upstream_connection(&mut req).is_break());
        assert!(chain.handle_client_request(&mut req).is_break());
        assert_eq!(journal.entries(), vec!["a:before", "a:request"]);
    }

    #[test]
    fn test_upstream_chunks_fold_through_chain() {
        let journal = Journal::default();
        let mut chain = PluginChain::new();
        chain.push(Recorder::boxed("1", &journal));
        chain.push(Recorder::boxed("2", &journal));

        assert_eq!(
            chain.handle_upstream_chunk(Bytes::from_static(b"data-")),
            Bytes::from_static(b"data-12")
        );
    }

    #[test]
    fn test_registry_builds_fresh_instances() {
        let journal = Journal::default();
        let mut registry = PluginRegistry::new();
        let shared = journal.clone();
        registry.register("recorder", move |_ctx| {
            Recorder::boxed("r", &shared) as Box<dyn HttpProxyPlugin>
        });
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["recorder"]);

        let (client, _outbox) = ClientHandle::new(None);
        let context = PluginContext {
            config: Arc::new(Config::default()),
            client,
        };
        let mut first = registry.build_chain(&context);
        let second = registry.build_chain(&context);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        first.on_upstream_connection_close();
        assert_eq!(journal.entries(), vec!["r:close"]);
    }

    #[test]
    fn test_client_handle_outbox() {
        let (client, mut outbox) = ClientHandle::new("127.0.0.1:9000".parse().ok());
        assert_eq!(client.queue(&b"HTTP/1.1 200 OK\r\n\r\n"[..]), 19);
        assert_eq!(client.queue(Bytes::from_static(b"!")), 1);

        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(outbox.drain().is_empty());

        drop(outbox);
        assert_eq!(client.queue(Bytes::from_static(b"late")), 0);
    }
}
