use std::fmt;

use http::StatusCode;

use crate::http::{build_http_response, Headers, ParseError, PROXY_AGENT};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake error: {0}")]
    Handshake(#[from] openssl::ssl::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Unable to connect to upstream {host}:{port}: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Proxy authentication required")]
    ProxyAuthenticationRequired,

    #[error("Connection already closed ({0})")]
    ConnectionClosed(&'static str),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn certificate<T: fmt::Display>(msg: T) -> Self {
        Error::Certificate(msg.to_string())
    }

    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub fn timeout<T: fmt::Display>(msg: T) -> Self {
        Error::Timeout(msg.to_string())
    }

    pub fn upstream_connect(host: &str, port: u16, source: std::io::Error) -> Self {
        Error::UpstreamConnect {
            host: host.to_string(),
            port,
            source,
        }
    }

    /// True for reset, broken pipe and other conditions where the peer is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed(_))
    }

    /// Packet to send to the client before tearing the handler down, if any.
    pub fn client_response(&self) -> Option<Vec<u8>> {
        let status = match self {
            Error::Parse(ParseError::BodyTooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Parse(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamConnect { .. }
            | Error::Certificate(_)
            | Error::Tls(_)
            | Error::Handshake(_)
            | Error::Timeout(_) => StatusCode::BAD_GATEWAY,
            Error::ProxyAuthenticationRequired => {
                let headers: Headers = [
                    ("Proxy-Authenticate", "Basic realm=\"proxy\""),
                    ("Proxy-Agent", PROXY_AGENT),
                    ("Connection", "close"),
                ]
                .into_iter()
                .collect();
                return Some(build_http_response(
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED.as_u16(),
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED.canonical_reason(),
                    &headers,
                    None,
                ));
            }
            _ => return None,
        };

        let headers: Headers = [("Proxy-Agent", PROXY_AGENT), ("Connection", "close")]
            .into_iter()
            .collect();
        Some(build_http_response(
            status.as_u16(),
            status.canonical_reason(),
            &headers,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_maps_to_bad_request() {
        let err = Error::from(ParseError::MalformedHeader("nocolon".to_string()));
        let packet = err.client_response().unwrap();
        assert!(packet.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_upstream_error_maps_to_bad_gateway() {
        let err = Error::upstream_connect(
            "example.org",
            80,
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        let packet = err.client_response().unwrap();
        assert!(packet.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(err.to_string().contains("example.org:80"));
    }

    #[test]
    fn test_auth_error_carries_challenge() {
        let packet = Error::ProxyAuthenticationRequired.client_response().unwrap();
        let text = String::from_utf8(packet).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"proxy\"\r\n"));
    }

    #[test]
    fn test_transport_errors_have_no_response() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_transport());
        assert!(err.client_response().is_none());
    }

    #[test]
    fn test_oversized_body_maps_to_payload_too_large() {
        let err = Error::from(ParseError::BodyTooLarge(1 << 30));
        let packet = err.client_response().unwrap();
        assert!(packet.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }
}
