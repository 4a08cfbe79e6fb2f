//! CONNECT tunnel interception: certificate issuance and TLS upgrade of both legs.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssl::ssl::{
    Ssl, SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion,
};
use tokio_openssl::SslStream;
use tracing::debug;

use crate::certs::{CertificateIssuer, LeafCertificate};
use crate::config::Config;
use crate::connection::{BoxedStream, Connection};
use crate::{Error, Result};

/// Response written to the client once the upstream leg of a CONNECT is open.
pub const PROXY_TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Upgrading,
    Established,
}

/// Bookkeeping for one CONNECT tunnel while it is being intercepted.
#[derive(Debug)]
pub struct TunnelContext {
    pub host: String,
    pub port: u16,
    pub certificate: Option<LeafCertificate>,
    pub ca_cert: Option<PathBuf>,
    client_ready: bool,
    server_ready: bool,
}

impl TunnelContext {
    pub fn new(host: impl Into<String>, port: u16, ca_cert: Option<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            certificate: None,
            ca_cert,
            client_ready: false,
            server_ready: false,
        }
    }

    pub fn mark_client_ready(&mut self) {
        self.client_ready = true;
    }

    pub fn mark_server_ready(&mut self) {
        self.server_ready = true;
    }

    pub fn state(&self) -> TunnelState {
        match (self.client_ready, self.server_ready) {
            (true, true) => TunnelState::Established,
            _ if self.certificate.is_some() => TunnelState::Upgrading,
            _ => TunnelState::Connecting,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state() == TunnelState::Established
    }
}

/// Wraps plain streams in TLS for the two legs of an intercepted tunnel.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    /// Terminate the client's TLS session using `leaf`.
    async fn accept_client(&self, stream: BoxedStream, leaf: &LeafCertificate)
        -> Result<BoxedStream>;

    /// Open a TLS session to the upstream named `host`.
    async fn connect_server(&self, stream: BoxedStream, host: &str) -> Result<BoxedStream>;
}

pub struct OpensslUpgrader {
    connector: SslConnector,
    verify: bool,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for OpensslUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpensslUpgrader")
            .field("verify", &self.verify)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl OpensslUpgrader {
    pub fn new(
        upstream_ca_file: Option<&Path>,
        ssl_insecure: bool,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        if let Some(ca_file) = upstream_ca_file {
            builder.set_ca_file(ca_file)?;
        }
        if ssl_insecure {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(Self {
            connector: builder.build(),
            verify: !ssl_insecure,
            handshake_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.upstream_ca_file().as_deref(),
            config.ssl_insecure,
            config.handshake_timeout(),
        )
    }

    fn acceptor(leaf: &LeafCertificate) -> Result<SslAcceptor> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        builder.set_certificate_chain_file(&leaf.cert_path)?;
        builder.set_private_key_file(&leaf.key_path, SslFiletype::PEM)?;
        builder.check_private_key()?;
        Ok(builder.build())
    }
}

#[async_trait]
impl TlsUpgrader for OpensslUpgrader {
    async fn accept_client(
        &self,
        stream: BoxedStream,
        leaf: &LeafCertificate,
    ) -> Result<BoxedStream> {
        let acceptor = Self::acceptor(leaf)?;
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = SslStream::new(ssl, stream)?;

        tokio::time::timeout(self.handshake_timeout, Pin::new(&mut tls).accept())
            .await
            .map_err(|_| Error::timeout(format!("client TLS handshake for {}", leaf.host)))??;
        debug!("Client TLS handshake complete for {}", leaf.host);
        Ok(Box::new(tls))
    }

    async fn connect_server(&self, stream: BoxedStream, host: &str) -> Result<BoxedStream> {
        let ssl = self
            .connector
            .configure()?
            .verify_hostname(self.verify)
            .into_ssl(host)?;
        let mut tls = SslStream::new(ssl, stream)?;

        tokio::time::timeout(self.handshake_timeout, Pin::new(&mut tls).connect())
            .await
            .map_err(|_| Error::timeout(format!("server TLS handshake for {}", host)))??;
        debug!("Server TLS handshake complete for {}", host);
        Ok(Box::new(tls))
    }
}

/// Everything a handler needs to intercept CONNECT tunnels.
#[derive(Clone)]
pub struct Interception {
    issuer: Arc<dyn CertificateIssuer>,
    upgrader: Arc<dyn TlsUpgrader>,
    ca_cert: Option<PathBuf>,
    cert_timeout: Duration,
}

impl Interception {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        upgrader: Arc<dyn TlsUpgrader>,
        ca_cert: Option<PathBuf>,
        cert_timeout: Duration,
    ) -> Self {
        Self {
            issuer,
            upgrader,
            ca_cert,
            cert_timeout,
        }
    }

    pub fn ca_cert(&self) -> Option<&Path> {
        self.ca_cert.as_deref()
    }

    /// Issue (or reuse) the leaf certificate for `host`.
    ///
    /// Issuance blocks, so it runs on the blocking pool and is bounded by the
    /// configured certificate timeout.
    pub async fn issue_certificate(&self, host: &str) -> Result<LeafCertificate> {
        let issuer = Arc::clone(&self.issuer);
        let target = host.to_string();
        let task = tokio::task::spawn_blocking(move || issuer.issue(&target));

        match tokio::time::timeout(self.cert_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::certificate(format!(
                "certificate issuance for {} failed: {}",
                host, join
            ))),
            Err(_) => Err(Error::timeout(format!("certificate issuance for {}", host))),
        }
    }

    pub async fn upgrade_client(&self, client: &mut Connection, leaf: &LeafCertificate) -> Result<()> {
        let upgrader = Arc::clone(&self.upgrader);
        client
            .upgrade(|stream| async move { upgrader.accept_client(stream, leaf).await })
            .await
    }

    pub async fn upgrade_server(&self, server: &mut Connection, host: &str) -> Result<()> {
        let upgrader = Arc::clone(&self.upgrader);
        server
            .upgrade(|stream| async move { upgrader.connect_server(stream, host).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{generate_ca, CertificateAuthority, MockCertificateIssuer};
    use crate::connection::TransportKind;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Passthrough;

    #[async_trait]
    impl TlsUpgrader for Passthrough {
        async fn accept_client(
            &self,
            stream: BoxedStream,
            _leaf: &LeafCertificate,
        ) -> Result<BoxedStream> {
            Ok(stream)
        }

        async fn connect_server(&self, stream: BoxedStream, _host: &str) -> Result<BoxedStream> {
            Ok(stream)
        }
    }

    fn leaf(dir: &Path, host: &str) -> LeafCertificate {
        LeafCertificate {
            host: host.to_string(),
            cert_path: dir.join(format!("{}.pem", host)),
            key_path: dir.join("key.pem"),
        }
    }

    #[test]
    fn test_tunnel_context_states() {
        let mut tunnel = TunnelContext::new("uni.corn", 443, None);
        assert_eq!(tunnel.state(), TunnelState::Connecting);

        tunnel.certificate = Some(leaf(Path::new("/tmp"), "uni.corn"));
        tunnel.mark_client_ready();
        assert_eq!(tunnel.state(), TunnelState::Upgrading);

        tunnel.mark_server_ready();
        assert!(tunnel.is_established());
    }

    #[tokio::test]
    async fn test_issue_certificate_runs_issuer_once() {
        let mut issuer = MockCertificateIssuer::new();
        issuer
            .expect_issue()
            .withf(|host: &str| host == "uni.corn")
            .times(1)
            .returning(|host| Ok(leaf(Path::new("/certs"), host)));

        let interception = Interception::new(
            Arc::new(issuer),
            Arc::new(Passthrough),
            None,
            Duration::from_secs(5),
        );
        let issued = interception.issue_certificate("uni.corn").await.unwrap();
        assert_eq!(issued.cert_path, PathBuf::from("/certs/uni.corn.pem"));
    }

    #[tokio::test]
    async fn test_issue_certificate_propagates_failure() {
        let mut issuer = MockCertificateIssuer::new();
        issuer
            .expect_issue()
            .returning(|_| Err(Error::certificate("CA key unreadable")));

        let interception = Interception::new(
            Arc::new(issuer),
            Arc::new(Passthrough),
            None,
            Duration::from_secs(5),
        );
        let err = interception.issue_certificate("uni.corn").await.unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[tokio::test]
    async fn test_openssl_handshake_over_pipe() {
        let dir = TempDir::new().unwrap();
        let ca_cert = dir.path().join("ca-cert.pem");
        let ca_key = dir.path().join("ca-key.pem");
        generate_ca(&ca_cert, &ca_key, "mitm-relay test CA").unwrap();
        let ca = CertificateAuthority::load(&ca_cert, &ca_key, None, &dir.path().join("certs"))
            .unwrap();
        let leaf = ca.issue("localhost").unwrap();

        let upgrader = Arc::new(
            OpensslUpgrader::new(Some(&ca_cert), false, Duration::from_secs(10)).unwrap(),
        );
        let interception = Interception::new(
            Arc::new(ca),
            upgrader.clone(),
            Some(ca_cert.clone()),
            Duration::from_secs(10),
        );

        let (proxy_side, browser_side) = tokio::io::duplex(16 * 1024);
        let mut client = Connection::client(proxy_side, None);

        let browser = tokio::spawn(async move {
            let mut tls = upgrader
                .connect_server(Box::new(browser_side), "localhost")
                .await
                .unwrap();
            tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            let mut buf = [0u8; 2];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        interception.upgrade_client(&mut client, &leaf).await.unwrap();
        assert_eq!(client.transport(), TransportKind::Tls);

        let request = client.receive().await.unwrap().unwrap();
        assert_eq!(&request[..], b"GET / HTTP/1.1\r\n\r\n");
        client.enqueue(b"ok");
        client.flush_all().await.unwrap();

        assert_eq!(&browser.await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_leg() {
        let dir = TempDir::new().unwrap();
        let ca_cert = dir.path().join("ca-cert.pem");
        let ca_key = dir.path().join("ca-key.pem");
        generate_ca(&ca_cert, &ca_key, "mitm-relay test CA").unwrap();
        let ca = CertificateAuthority::load(&ca_cert, &ca_key, None, &dir.path().join("certs"))
            .unwrap();
        let leaf = ca.issue("localhost").unwrap();

        let upgrader = Arc::new(
            OpensslUpgrader::new(None, false, Duration::from_secs(10)).unwrap(),
        );
        let interception = Interception::new(Arc::new(ca), upgrader, None, Duration::from_secs(10));

        let (proxy_side, mut browser_side) = tokio::io::duplex(1024);
        let mut client = Connection::client(proxy_side, None);

        // plaintext where a ClientHello should be
        browser_side
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let result = interception.upgrade_client(&mut client, &leaf).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(client.is_closed());
    }
}
