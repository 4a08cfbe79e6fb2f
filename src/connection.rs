//! Buffered bidirectional byte stream shared by the client and server legs.
//!
//! Writes are queued into a backlog and drained by [`Connection::flush`],
//! which performs exactly one write and removes only the bytes the transport
//! accepted. The underlying stream can be swapped for a TLS stream with
//! [`Connection::upgrade`] once the backlog is empty.

use std::fmt;
use std::future::{poll_fn, Future};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{Error, Result};

pub const DEFAULT_RECVBUF_SIZE: usize = 64 * 1024;

/// Any transport a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

pub struct Connection {
    role: Role,
    transport: TransportKind,
    stream: Option<BoxedStream>,
    peer: Option<SocketAddr>,
    backlog: Vec<u8>,
    read_buf: Vec<u8>,
    closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("transport", &self.transport)
            .field("peer", &self.peer)
            .field("backlog", &self.backlog.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    pub fn new<S>(role: Role, stream: S, peer: Option<SocketAddr>, recvbuf_size: usize) -> Self
    where
        S: Stream + 'static,
    {
        Self::from_boxed(role, Box::new(stream), peer, recvbuf_size)
    }

    pub fn from_boxed(
        role: Role,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
        recvbuf_size: usize,
    ) -> Self {
        Self {
            role,
            transport: TransportKind::Plain,
            stream: Some(stream),
            peer,
            backlog: Vec::new(),
            read_buf: vec![0; recvbuf_size.max(1)],
            closed: false,
        }
    }

    pub fn client<S: Stream + 'static>(stream: S, peer: Option<SocketAddr>) -> Self {
        Self::new(Role::Client, stream, peer, DEFAULT_RECVBUF_SIZE)
    }

    pub fn server<S: Stream + 'static>(stream: S, peer: Option<SocketAddr>) -> Self {
        Self::new(Role::Server, stream, peer, DEFAULT_RECVBUF_SIZE)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_buffer(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub fn backlog(&self) -> &[u8] {
        &self.backlog
    }

    /// Append `data` to the send backlog. Nothing is written until a flush.
    pub fn enqueue(&mut self, data: impl AsRef<[u8]>) -> usize {
        let data = data.as_ref();
        self.backlog.extend_from_slice(data);
        data.len()
    }

    fn stream_mut(&mut self) -> Result<&mut BoxedStream> {
        if self.closed {
            return Err(Error::ConnectionClosed(self.role.as_str()));
        }
        self.stream
            .as_mut()
            .ok_or(Error::ConnectionClosed(self.role.as_str()))
    }

    /// Attempt a single write of the backlog.
    ///
    /// Resolves to the number of bytes the transport accepted; only that
    /// prefix is removed from the backlog.
    pub fn poll_flush_once(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize>> {
        if self.closed || self.stream.is_none() {
            return Poll::Ready(Err(Error::ConnectionClosed(self.role.as_str())));
        }
        if self.backlog.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Poll::Ready(Err(Error::ConnectionClosed(self.role.as_str())));
        };

        let sent = match Pin::new(&mut *stream).poll_write(cx, &self.backlog) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(Error::Io(std::io::ErrorKind::WriteZero.into())))
            }
            Poll::Ready(Ok(sent)) => sent,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Pending => return Poll::Pending,
        };
        self.backlog.drain(..sent);

        if let Poll::Ready(Err(err)) = Pin::new(stream).poll_flush(cx) {
            return Poll::Ready(Err(err.into()));
        }
        Poll::Ready(Ok(sent))
    }

    pub async fn flush(&mut self) -> Result<usize> {
        poll_fn(|cx| self.poll_flush_once(cx)).await
    }

    /// Flush until the backlog is empty.
    pub async fn flush_all(&mut self) -> Result<usize> {
        let mut total = 0;
        while self.has_buffer() {
            total += self.flush().await?;
        }
        self.stream_mut()?.flush().await?;
        Ok(total)
    }

    /// Read whatever is available, up to the receive buffer size.
    ///
    /// `Ok(None)` means the peer closed its side.
    pub fn poll_receive(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        if self.closed {
            return Poll::Ready(Err(Error::ConnectionClosed(self.role.as_str())));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Poll::Ready(Err(Error::ConnectionClosed(self.role.as_str())));
        };

        let mut buf = ReadBuf::new(&mut self.read_buf);
        match Pin::new(stream).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) if buf.filled().is_empty() => Poll::Ready(Ok(None)),
            Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(Bytes::copy_from_slice(buf.filled())))),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    pub async fn receive(&mut self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.poll_receive(cx)).await
    }

    /// Drop the transport. Returns false if the connection was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.stream = None;
        true
    }

    /// Shut down the write half gracefully, then close.
    pub async fn shutdown(&mut self) -> bool {
        if let Ok(stream) = self.stream_mut() {
            let _ = stream.shutdown().await;
        }
        self.close()
    }

    /// Replace the transport with the stream produced by `wrap`.
    ///
    /// Refused while bytes are still queued. If `wrap` fails the connection
    /// is closed and the error returned.
    pub async fn upgrade<F, Fut>(&mut self, wrap: F) -> Result<()>
    where
        F: FnOnce(BoxedStream) -> Fut,
        Fut: Future<Output = Result<BoxedStream>>,
    {
        if self.has_buffer() {
            return Err(Error::protocol(format!(
                "cannot upgrade {} connection with {} bytes pending",
                self.role,
                self.backlog.len()
            )));
        }
        self.stream_mut()?;
        let Some(stream) = self.stream.take() else {
            return Err(Error::ConnectionClosed(self.role.as_str()));
        };

        match wrap(stream).await {
            Ok(upgraded) => {
                self.stream = Some(upgraded);
                self.transport = TransportKind::Tls;
                Ok(())
            }
            Err(err) => {
                self.closed = true;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_flush_sends_queued_bytes() {
        let mock = Builder::new().write(b"hello world").build();
        let mut conn = Connection::server(mock, None);

        assert_eq!(conn.enqueue(b"hello "), 6);
        assert_eq!(conn.enqueue(b"world"), 5);
        assert!(conn.has_buffer());

        assert_eq!(conn.flush().await.unwrap(), 11);
        assert!(!conn.has_buffer());
    }

    #[tokio::test]
    async fn test_flush_keeps_unsent_suffix() {
        let (near, mut far) = tokio::io::duplex(4);
        let mut conn = Connection::client(near, None);

        conn.enqueue(b"hello world");
        assert_eq!(conn.flush().await.unwrap(), 4);
        assert_eq!(conn.backlog(), b"o world");

        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hell");
    }

    #[tokio::test]
    async fn test_flush_all_drains_backlog() {
        let (near, mut far) = tokio::io::duplex(4);
        let mut conn = Connection::client(near, None);
        conn.enqueue(b"a longer message than the pipe");

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 30];
            far.read_exact(&mut buf).await.unwrap();
            buf
        });

        assert_eq!(conn.flush_all().await.unwrap(), 30);
        assert_eq!(reader.await.unwrap(), b"a longer message than the pipe".to_vec());
    }

    #[tokio::test]
    async fn test_receive_until_eof() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\n\r\n").build();
        let mut conn = Connection::client(mock, None);

        let data = conn.receive().await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"GET / HTTP/1.1\r\n\r\n"[..]));
        assert!(conn.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_respects_recvbuf_size() {
        let mock = Builder::new().read(b"abcdef").build();
        let mut conn = Connection::new(Role::Client, mock, None, 4);

        assert_eq!(conn.receive().await.unwrap().as_deref(), Some(&b"abcd"[..]));
        assert_eq!(conn.receive().await.unwrap().as_deref(), Some(&b"ef"[..]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Builder::new().build();
        let mut conn = Connection::client(mock, None);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());

        conn.enqueue(b"late");
        assert!(matches!(conn.flush().await, Err(Error::ConnectionClosed("client"))));
        assert!(matches!(conn.receive().await, Err(Error::ConnectionClosed("client"))));
    }

    #[tokio::test]
    async fn test_upgrade_requires_empty_backlog() {
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = Connection::client(near, None);
        conn.enqueue(b"pending");

        let result = conn.upgrade(|stream| async move { Ok(stream) }).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(!conn.is_closed());
        assert_eq!(conn.transport(), TransportKind::Plain);
    }

    #[tokio::test]
    async fn test_upgrade_swaps_transport() {
        let (near, mut far) = tokio::io::duplex(64);
        let (replacement, mut replacement_far) = tokio::io::duplex(64);
        let mut conn = Connection::client(near, None);

        conn.upgrade(move |_old| async move { Ok(Box::new(replacement) as BoxedStream) })
            .await
            .unwrap();
        assert_eq!(conn.transport(), TransportKind::Tls);

        conn.enqueue(b"secret");
        conn.flush_all().await.unwrap();

        let mut buf = [0u8; 6];
        replacement_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secret");

        // the old transport was dropped by the closure
        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upgrade_closes() {
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = Connection::server(near, None);

        let result = conn
            .upgrade(|_stream| async move { Err(Error::certificate("handshake refused")) })
            .await;
        assert!(matches!(result, Err(Error::Certificate(_))));
        assert!(conn.is_closed());
        assert!(!conn.close());
    }
}
