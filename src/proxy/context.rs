//! State shared by every handler of one proxy server.

use std::sync::Arc;

use tracing::info;

use crate::certs::CertificateAuthority;
use crate::config::Config;
use crate::events::EventQueue;
use crate::plugins;
use crate::proxy::plugin::PluginRegistry;
use crate::proxy::tunnel::{Interception, OpensslUpgrader};
use crate::proxy::upstream::{TcpConnector, UpstreamConnector};
use crate::Result;

/// Read-only after startup; handlers hold it behind an `Arc`.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub plugins: PluginRegistry,
    pub connector: Arc<dyn UpstreamConnector>,
    pub interception: Option<Interception>,
    pub events: Option<EventQueue>,
    proxy_authorization: Option<String>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("interception", &self.interception.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl Context {
    /// Plain forwarding context: direct TCP upstreams, no plugins, no interception.
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(TcpConnector::from_config(&config));
        let proxy_authorization = config.proxy_authorization();
        Self {
            config: Arc::new(config),
            plugins: PluginRegistry::new(),
            connector,
            interception: None,
            events: None,
            proxy_authorization,
        }
    }

    /// Everything the configuration asks for: named plugins, the CA and the event queue.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = plugins::registry(&config.plugins)?;
        let mut context = Self::new(config).with_plugins(registry);

        if context.config.tls_interception_enabled() {
            if let Some(ca) = CertificateAuthority::from_config(&context.config)? {
                info!("TLS interception enabled, certificates in {}", ca.cert_dir().display());
                let upgrader = OpensslUpgrader::from_config(&context.config)?;
                let interception = Interception::new(
                    Arc::new(ca),
                    Arc::new(upgrader),
                    context.config.ca_cert_file(),
                    context.config.cert_timeout(),
                );
                context = context.with_interception(interception);
            }
        }

        if context.config.enable_events {
            context = context.with_events(EventQueue::new());
        }
        Ok(context)
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_interception(mut self, interception: Interception) -> Self {
        self.interception = Some(interception);
        self
    }

    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Expected `Proxy-Authorization` header value when basic auth is on.
    pub fn proxy_authorization(&self) -> Option<&str> {
        self.proxy_authorization.as_deref()
    }
}
