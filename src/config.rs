use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::DEFAULT_RECVBUF_SIZE;
use crate::{Error, Result};

pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub client_recvbuf_size: usize,
    pub server_recvbuf_size: usize,
    pub connect_timeout_secs: u64,
    pub cert_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub ca_cert_file: Option<String>,
    pub ca_key_file: Option<String>,
    pub ca_signing_key_file: Option<String>,
    pub ca_cert_dir: Option<String>,
    /// Extra trust anchors for upstream TLS verification.
    pub upstream_ca_file: Option<String>,
    pub ssl_insecure: bool,
    /// Header names dropped from every forwarded request.
    pub disable_headers: Vec<String>,
    /// `user:pass` required in `Proxy-Authorization`.
    pub basic_auth: Option<String>,
    pub plugins: Vec<String>,
    pub enable_events: bool,
    /// Largest request body the proxy buffers; 0 disables the limit.
    pub max_body_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 8899,
            client_recvbuf_size: DEFAULT_RECVBUF_SIZE,
            server_recvbuf_size: DEFAULT_RECVBUF_SIZE,
            connect_timeout_secs: 10,
            cert_timeout_secs: 10,
            handshake_timeout_secs: 10,
            ca_cert_file: None,
            ca_key_file: None,
            ca_signing_key_file: None,
            ca_cert_dir: None,
            upstream_ca_file: None,
            ssl_insecure: false,
            disable_headers: Vec::new(),
            basic_auth: None,
            plugins: Vec::new(),
            enable_events: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| Error::Other(format!("config path is not UTF-8: {}", path.display())))?;

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    pub fn expand_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
        PathBuf::from(path)
    }

    pub fn ca_cert_file(&self) -> Option<PathBuf> {
        self.ca_cert_file.as_deref().map(|p| self.expand_path(p))
    }

    pub fn ca_key_file(&self) -> Option<PathBuf> {
        self.ca_key_file.as_deref().map(|p| self.expand_path(p))
    }

    pub fn ca_signing_key_file(&self) -> Option<PathBuf> {
        self.ca_signing_key_file.as_deref().map(|p| self.expand_path(p))
    }

    pub fn ca_cert_dir(&self) -> Option<PathBuf> {
        self.ca_cert_dir.as_deref().map(|p| self.expand_path(p))
    }

    pub fn upstream_ca_file(&self) -> Option<PathBuf> {
        self.upstream_ca_file.as_deref().map(|p| self.expand_path(p))
    }

    pub fn tls_interception_enabled(&self) -> bool {
        self.ca_cert_file.is_some() && self.ca_key_file.is_some() && self.ca_cert_dir.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cert_timeout(&self) -> Duration {
        Duration::from_secs(self.cert_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn body_limit(&self) -> Option<usize> {
        (self.max_body_size > 0).then_some(self.max_body_size)
    }

    /// Expected `Proxy-Authorization` value, if authentication is on.
    pub fn proxy_authorization(&self) -> Option<String> {
        use base64::Engine;

        self.basic_auth.as_ref().map(|credentials| {
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            )
        })
    }
}
