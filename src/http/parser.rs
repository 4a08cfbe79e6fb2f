//! Incremental HTTP/1.x message parser.
//!
//! One state machine serves both roles; requests and responses differ only
//! in the shape of the first line:
//!
//! `Initialized -> LineReceived -> ReceivingHeaders -> HeadersComplete
//!  -> (ReceivingBody | Complete)`
//!
//! Malformed input moves the parser to the terminal `Error` state. Input that
//! simply ends early leaves the parser waiting for more bytes.

use super::chunk::{ChunkParser, DEFAULT_CHUNK_SIZE};
use super::{build_http_pkt, find_http_line, Headers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserRole {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Initialized,
    LineReceived,
    ReceivingHeaders,
    HeadersComplete,
    ReceivingBody,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("malformed chunk size line: {0}")]
    MalformedChunkSize(String),

    #[error("chunk data not terminated by CRLF")]
    MalformedChunk,

    #[error("body of {0} bytes exceeds the configured limit")]
    BodyTooLarge(usize),

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("message has no start line yet")]
    MissingStartLine,

    #[error("parser already failed")]
    Failed,
}

#[derive(Debug, Clone)]
pub struct HttpParser {
    role: ParserRole,
    state: ParserState,
    line: Option<StartLine>,
    headers: Headers,
    body: Option<Vec<u8>>,
    content_length: Option<usize>,
    chunk_parser: Option<ChunkParser>,
    /// Bytes received but not yet consumed by the state machine.
    buffer: Vec<u8>,
    total_size: usize,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    max_body_size: Option<usize>,
    /// Method of the request this response answers.
    request_method: Option<String>,
}

impl HttpParser {
    pub fn new(role: ParserRole) -> Self {
        Self {
            role,
            state: ParserState::Initialized,
            line: None,
            headers: Headers::new(),
            body: None,
            content_length: None,
            chunk_parser: None,
            buffer: Vec::new(),
            total_size: 0,
            host: None,
            port: None,
            path: None,
            max_body_size: None,
            request_method: None,
        }
    }

    /// Fail with [`ParseError::BodyTooLarge`] for bodies over `limit` bytes.
    pub fn with_max_body_size(mut self, limit: Option<usize>) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Responses to `HEAD` carry no body whatever their headers say.
    pub fn set_request_method(&mut self, method: impl Into<String>) {
        self.request_method = Some(method.into());
    }

    pub fn request_method(&self) -> Option<&str> {
        self.request_method.as_deref()
    }

    fn is_bodiless_response(&self) -> bool {
        let Some(StartLine::Response { status, .. }) = &self.line else {
            return false;
        };
        self.request_method.as_deref() == Some("HEAD")
            || (100..200).contains(status)
            || *status == 204
            || *status == 304
    }

    pub fn request() -> Self {
        Self::new(ParserRole::Request)
    }

    pub fn response() -> Self {
        Self::new(ParserRole::Response)
    }

    /// Parse a complete request packet in one go.
    pub fn parse_request(raw: &[u8]) -> Result<Self, ParseError> {
        let mut parser = Self::request();
        parser.parse(raw)?;
        Ok(parser)
    }

    /// Parse a complete response packet in one go.
    pub fn parse_response(raw: &[u8]) -> Result<Self, ParseError> {
        let mut parser = Self::response();
        parser.parse(raw)?;
        Ok(parser)
    }

    pub fn role(&self) -> ParserRole {
        self.role
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Feed bytes into the state machine.
    ///
    /// Bytes arriving after the message completed are kept for the next
    /// message and can be collected with [`HttpParser::take_remaining`].
    pub fn parse(&mut self, raw: &[u8]) -> Result<(), ParseError> {
        if self.state == ParserState::Error {
            return Err(ParseError::Failed);
        }
        self.total_size += raw.len();
        self.buffer.extend_from_slice(raw);

        if let Err(err) = self.advance() {
            self.state = ParserState::Error;
            return Err(err);
        }
        Ok(())
    }

    /// Leftover bytes that belong to the next message.
    pub fn remaining(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParserState::Initialized
                | ParserState::LineReceived
                | ParserState::ReceivingHeaders => {
                    let Some((line, consumed)) = find_http_line(&self.buffer) else {
                        return Ok(());
                    };
                    let line = line.to_vec();
                    self.buffer.drain(..consumed);
                    self.process_line(&line)?;
                }
                ParserState::HeadersComplete | ParserState::ReceivingBody => {
                    if !self.receive_body()? {
                        return Ok(());
                    }
                }
                ParserState::Complete | ParserState::Error => return Ok(()),
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if self.state == ParserState::Initialized {
            // stray CRLFs between pipelined messages
            if line.is_empty() {
                return Ok(());
            }
            self.process_start_line(line)?;
            self.state = ParserState::LineReceived;
            return Ok(());
        }

        self.state = ParserState::ReceivingHeaders;
        if line.iter().all(u8::is_ascii_whitespace) {
            return self.on_headers_complete();
        }
        self.process_header(line)
    }

    fn process_start_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = String::from_utf8_lossy(line).into_owned();
        let mut parts = text.split(' ').filter(|part| !part.is_empty());

        match self.role {
            ParserRole::Request => {
                let (Some(method), Some(target), Some(version), None) =
                    (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    return Err(ParseError::MalformedStartLine(text));
                };
                if !version.starts_with("HTTP/") {
                    return Err(ParseError::MalformedStartLine(text));
                }
                self.line = Some(StartLine::Request {
                    method: method.to_ascii_uppercase(),
                    target: target.to_string(),
                    version: version.to_string(),
                });
                self.update_target_attributes()
            }
            ParserRole::Response => {
                let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
                    return Err(ParseError::MalformedStartLine(text));
                };
                let status = match status.parse::<u16>() {
                    Ok(status) if version.starts_with("HTTP/") => status,
                    _ => return Err(ParseError::MalformedStartLine(text)),
                };
                self.line = Some(StartLine::Response {
                    version: version.to_string(),
                    status,
                    reason: parts.collect::<Vec<_>>().join(" "),
                });
                Ok(())
            }
        }
    }

    fn process_header(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(ParseError::MalformedHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        }
        self.headers.append(name, line[colon + 1..].trim_ascii().to_vec());
        Ok(())
    }

    fn on_headers_complete(&mut self) -> Result<(), ParseError> {
        self.state = ParserState::HeadersComplete;

        if self.is_bodiless_response() {
            self.state = ParserState::Complete;
            return Ok(());
        }

        if self.is_chunked_encoded() {
            self.chunk_parser = Some(ChunkParser::with_limit(self.max_body_size));
            self.state = ParserState::ReceivingBody;
            return Ok(());
        }

        if let Some(value) = self.headers.get("Content-Length") {
            let text = String::from_utf8_lossy(value).into_owned();
            let length = text
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(text))?;
            if self.max_body_size.is_some_and(|limit| length > limit) {
                return Err(ParseError::BodyTooLarge(length));
            }
            self.body = Some(Vec::with_capacity(length.min(64 * 1024)));
            self.content_length = Some(length);
            self.state = if length == 0 {
                ParserState::Complete
            } else {
                ParserState::ReceivingBody
            };
            return Ok(());
        }

        self.state = ParserState::Complete;
        Ok(())
    }

    /// Returns true once the body is complete.
    fn receive_body(&mut self) -> Result<bool, ParseError> {
        self.state = ParserState::ReceivingBody;

        if let Some(chunks) = self.chunk_parser.as_mut() {
            chunks.parse(&mut self.buffer)?;
            if chunks.is_complete() {
                self.body = Some(chunks.body().to_vec());
                self.state = ParserState::Complete;
                return Ok(true);
            }
            return Ok(false);
        }

        let expected = self.content_length.unwrap_or(0);
        let body = self.body.get_or_insert_with(Vec::new);
        let take = (expected - body.len()).min(self.buffer.len());
        body.extend_from_slice(&self.buffer[..take]);
        self.buffer.drain(..take);

        if body.len() == expected {
            self.state = ParserState::Complete;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_target_attributes(&mut self) -> Result<(), ParseError> {
        let Some(StartLine::Request { method, target, .. }) = &self.line else {
            return Ok(());
        };

        if method == "CONNECT" {
            let (host, port) = split_authority(target, 443)?;
            self.host = Some(host);
            self.port = Some(port);
            self.path = None;
        } else if target.starts_with('/') || target == "*" {
            self.host = None;
            self.port = None;
            self.path = Some(target.clone());
        } else {
            let url = url::Url::parse(target)
                .map_err(|_| ParseError::InvalidTarget(target.clone()))?;
            let host = url
                .host_str()
                .ok_or_else(|| ParseError::InvalidTarget(target.clone()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let mut path = url.path().to_string();
            if path.is_empty() {
                path.push('/');
            }
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            self.host = Some(host);
            self.port = url.port_or_known_default().or(Some(80));
            self.path = Some(path);
        }
        Ok(())
    }

    pub fn line(&self) -> Option<&StartLine> {
        self.line.as_ref()
    }

    pub fn method(&self) -> Option<&str> {
        match &self.line {
            Some(StartLine::Request { method, .. }) => Some(method),
            _ => None,
        }
    }

    pub fn set_method(&mut self, new_method: impl Into<String>) {
        if let Some(StartLine::Request { method, .. }) = &mut self.line {
            *method = new_method.into();
        }
    }

    /// The request target exactly as received.
    pub fn url(&self) -> Option<&str> {
        match &self.line {
            Some(StartLine::Request { target, .. }) => Some(target),
            _ => None,
        }
    }

    /// Replace the request target and recompute host, port and path.
    pub fn set_url(&mut self, url: impl Into<String>) -> Result<(), ParseError> {
        match &mut self.line {
            Some(StartLine::Request { target, .. }) => *target = url.into(),
            _ => return Err(ParseError::MissingStartLine),
        }
        self.update_target_attributes()
    }

    pub fn version(&self) -> Option<&str> {
        match &self.line {
            Some(StartLine::Request { version, .. }) | Some(StartLine::Response { version, .. }) => {
                Some(version)
            }
            None => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.line {
            Some(StartLine::Response { status, .. }) => Some(*status),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.line {
            Some(StartLine::Response { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method() == Some("CONNECT")
    }

    /// Upstream host named by the request target.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Origin-form path used when forwarding.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn has_upstream_server(&self) -> bool {
        self.host.is_some()
    }

    /// Upstream address from the request target, falling back to `Host`.
    pub fn upstream_address(&self) -> Option<(String, u16)> {
        if let (Some(host), Some(port)) = (&self.host, self.port) {
            return Some((host.clone(), port));
        }
        let authority = self.headers.get_str("Host")?.trim();
        split_authority(authority, 80).ok()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Set `name` to `value`, replacing any previous value.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.insert(name, value);
    }

    pub fn del_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn del_headers(&mut self, names: &[&str]) {
        for name in names {
            self.headers.remove(name);
        }
    }

    pub fn is_chunked_encoded(&self) -> bool {
        self.headers
            .get_str("Transfer-Encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Decoded body, if the message declared one.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Replace the body.
    ///
    /// For messages that are not chunked the `Content-Length` header is set to
    /// the new length. Chunked messages never get a `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        let body = body.into();
        if !self.is_chunked_encoded() {
            self.headers
                .insert("Content-Length", body.len().to_string());
        }
        self.body = Some(body);
    }

    /// Serialize the message, leaving out the headers named in `disable_headers`.
    ///
    /// Requests are written with their origin-form path. Chunked bodies are
    /// re-encoded as chunks.
    pub fn build(&self, disable_headers: &[String]) -> Result<Vec<u8>, ParseError> {
        let line = self.line.as_ref().ok_or(ParseError::MissingStartLine)?;

        let headers: Headers = self
            .headers
            .iter()
            .filter(|(name, _)| {
                !disable_headers
                    .iter()
                    .any(|disabled| disabled.eq_ignore_ascii_case(name))
            })
            .map(|(name, value)| (name.to_string(), value.to_vec()))
            .collect();

        let body = match &self.body {
            Some(body) if self.is_chunked_encoded() => {
                Some(ChunkParser::to_chunks(body, DEFAULT_CHUNK_SIZE))
            }
            Some(body) => Some(body.clone()),
            None => None,
        };

        let pkt = match line {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                let path = self.path.as_deref().unwrap_or(target);
                build_http_pkt(
                    &[method.as_bytes(), path.as_bytes(), version.as_bytes()],
                    &headers,
                    body.as_deref(),
                )
            }
            StartLine::Response {
                version,
                status,
                reason,
            } => {
                let status = status.to_string();
                let mut parts: Vec<&[u8]> = vec![version.as_bytes(), status.as_bytes()];
                if !reason.is_empty() {
                    parts.push(reason.as_bytes());
                }
                build_http_pkt(&parts, &headers, body.as_deref())
            }
        };
        Ok(pkt)
    }
}

/// Split `host[:port]` (IPv6 hosts in brackets) into its parts.
pub fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let invalid = || ParseError::InvalidTarget(authority.to_string());

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None if tail.is_empty() => (host, default_port),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}
