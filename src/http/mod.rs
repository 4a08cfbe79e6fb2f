//! HTTP/1.x message handling independent of the transport.

pub mod chunk;
pub mod headers;
pub mod parser;
pub mod utils;

pub use chunk::{ChunkParser, ChunkParserState};
pub use headers::Headers;
pub use parser::{HttpParser, ParseError, ParserRole, ParserState, StartLine};
pub use utils::{
    build_http_header, build_http_pkt, build_http_request, build_http_response,
    build_websocket_handshake_request, build_websocket_handshake_response,
};

pub const CRLF: &[u8] = b"\r\n";
pub const HTTP_1_1: &str = "HTTP/1.1";

/// Value used for the `Via` and `Proxy-Agent` headers.
pub const PROXY_AGENT: &str = concat!("mitm-relay/", env!("CARGO_PKG_VERSION"));

/// Locate the first CRLF-terminated line in `raw`.
///
/// Returns the line without its terminator together with the number of bytes
/// it occupies including the terminator, or `None` if no full line is buffered.
pub fn find_http_line(raw: &[u8]) -> Option<(&[u8], usize)> {
    raw.windows(CRLF.len())
        .position(|window| window == CRLF)
        .map(|pos| (&raw[..pos], pos + CRLF.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_http_line() {
        assert_eq!(
            find_http_line(b"GET / HTTP/1.1\r\nHost: a\r\n"),
            Some((&b"GET / HTTP/1.1"[..], 16))
        );
        assert_eq!(find_http_line(b"\r\nrest"), Some((&b""[..], 2)));
        assert_eq!(find_http_line(b"partial line"), None);
    }
}
