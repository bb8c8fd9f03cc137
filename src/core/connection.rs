/// Upstream connection establishment and the client stream abstraction
///
/// The connector is a trait so routing policies can be exercised against a
/// fake implementation; the real one resolves the address, connects with a
/// deadline and switches the socket to TCP_NODELAY, which is what the
/// database protocol wants for its small handshake packets.
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::{client_ip_array, TcpAddress};

/// Capability surface the destination policies need from the socket layer.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Connect to a backend within `connect_timeout`.
    async fn connect(
        &self,
        addr: &TcpAddress,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream>;
}

/// The production connector.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl ServerConnector for TcpConnector {
    async fn connect(
        &self,
        addr: &TcpAddress,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream> {
        let connect = TcpStream::connect((addr.addr.as_str(), addr.port));
        let stream = match timeout(connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("connecting to {} failed: {}", addr, e);
                return Err(e);
            }
            Err(_) => {
                debug!("connecting to {} timed out", addr);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ));
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// An accepted client connection, either TCP or a named socket.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    /// Printable peer identity for logging.
    pub fn peer(&self) -> String {
        match self {
            ClientStream::Tcp(_, addr) => addr.to_string(),
            #[cfg(unix)]
            ClientStream::Unix(_) => "local socket".to_string(),
        }
    }

    /// Error-accounting key. Named-socket clients share the all-zero key.
    pub fn client_key(&self) -> [u8; 16] {
        match self {
            ClientStream::Tcp(_, addr) => client_ip_array(addr),
            #[cfg(unix)]
            ClientStream::Unix(_) => [0u8; 16],
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s, _) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(s, _) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s, _) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ClientStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s, _) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ClientStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
