//! Raw packet builders.

use super::{Headers, CRLF, HTTP_1_1};

pub fn build_http_header(name: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + value.len() + 2);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out
}

/// Join a start line, a header block and an optional body into one packet.
pub fn build_http_pkt(line: &[&[u8]], headers: &Headers, body: Option<&[u8]>) -> Vec<u8> {
    let mut pkt = line.join(&b' ');
    pkt.extend_from_slice(CRLF);
    for (name, value) in headers.iter() {
        pkt.extend_from_slice(&build_http_header(name, value));
        pkt.extend_from_slice(CRLF);
    }
    pkt.extend_from_slice(CRLF);
    if let Some(body) = body {
        pkt.extend_from_slice(body);
    }
    pkt
}

pub fn build_http_request(
    method: &str,
    url: &str,
    headers: &Headers,
    body: Option<&[u8]>,
) -> Vec<u8> {
    build_http_pkt(
        &[method.as_bytes(), url.as_bytes(), HTTP_1_1.as_bytes()],
        headers,
        body,
    )
}

/// Build a response packet.
///
/// A `Content-Length` header is added for `body` unless the caller already
/// supplied `Content-Length` or `Transfer-Encoding`.
pub fn build_http_response(
    status: u16,
    reason: Option<&str>,
    headers: &Headers,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let status = status.to_string();
    let mut line: Vec<&[u8]> = vec![HTTP_1_1.as_bytes(), status.as_bytes()];
    if let Some(reason) = reason.filter(|reason| !reason.is_empty()) {
        line.push(reason.as_bytes());
    }

    let mut headers = headers.clone();
    if let Some(body) = body {
        if !headers.contains("Content-Length") && !headers.contains("Transfer-Encoding") {
            headers.append("Content-Length", body.len().to_string());
        }
    }
    build_http_pkt(&line, &headers, body)
}

pub fn build_websocket_handshake_request(key: &str, method: &str, url: &str) -> Vec<u8> {
    let headers: Headers = [
        ("Connection", "upgrade"),
        ("Upgrade", "websocket"),
        ("Sec-WebSocket-Key", key),
        ("Sec-WebSocket-Version", "13"),
    ]
    .into_iter()
    .collect();
    build_http_request(method, url, &headers, None)
}

pub fn build_websocket_handshake_response(accept: &str) -> Vec<u8> {
    let headers: Headers = [
        ("Upgrade", "websocket"),
        ("Connection", "Upgrade"),
        ("Sec-WebSocket-Accept", accept),
    ]
    .into_iter()
    .collect();
    build_http_response(101, Some("Switching Protocols"), &headers, None)
}
