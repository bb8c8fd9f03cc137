/// Listener setup, admission and the per-connection splice worker
///
/// The acceptor owns the listening sockets and performs admission before a
/// worker is spawned; each accepted client gets exactly one worker that
/// runs the connection state machine to completion:
///
///   connect upstream -> handshake (timed) -> proxy (untimed) -> teardown
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::time::timeout;

use super::blocklist::ConnErrorCounters;
use super::destination::Destination;
use super::protocol::Protocol;
use super::LISTEN_BACKLOG;
use crate::core::connection::ClientStream;
use crate::core::TcpAddress;
use crate::error::{PuenteError, PuenteResult};

/// Validated per-route settings; ranges are enforced by the configuration
/// layer before a router is built.
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub name: String,
    pub bind_address: Option<TcpAddress>,
    #[cfg(unix)]
    pub bind_socket: Option<PathBuf>,
    pub max_connections: usize,
    pub destination_connect_timeout: Duration,
    pub client_connect_timeout: Duration,
    pub max_connect_errors: u64,
    pub max_connect_errors_timeout: u64,
    pub net_buffer_length: usize,
}

pub struct Router {
    settings: RouteSettings,
    destination: Arc<dyn Destination>,
    protocol: Arc<dyn Protocol>,
    conn_errors: Arc<ConnErrorCounters>,
    active_routes: Arc<AtomicUsize>,
    handled_routes: Arc<AtomicU64>,
    stop_rx: watch::Receiver<bool>,
}

/// Handle to a started router, exposing the observability counters.
pub struct RouterHandle {
    pub tcp_addr: Option<SocketAddr>,
    pub active_routes: Arc<AtomicUsize>,
    pub handled_routes: Arc<AtomicU64>,
    pub conn_errors: Arc<ConnErrorCounters>,
    pub join: tokio::task::JoinHandle<()>,
}

impl Router {
    pub fn new(
        settings: RouteSettings,
        destination: Arc<dyn Destination>,
        protocol: Arc<dyn Protocol>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let conn_errors = Arc::new(ConnErrorCounters::new(
            settings.max_connect_errors,
            settings.max_connect_errors_timeout,
        ));
        Self {
            settings,
            destination,
            protocol,
            conn_errors,
            active_routes: Arc::new(AtomicUsize::new(0)),
            handled_routes: Arc::new(AtomicU64::new(0)),
            stop_rx,
        }
    }

    /// Bind the configured listeners and spawn the acceptor.
    pub async fn start(self) -> PuenteResult<RouterHandle> {
        let name = self.settings.name.clone();

        let tcp_listener = match &self.settings.bind_address {
            Some(bind) => {
                let listener = bind_tcp(bind).await.map_err(|e| {
                    PuenteError::routing(format!(
                        "[{name}] Setting up TCP service using {bind}: {e}"
                    ))
                })?;
                info!("[{}] started: listening on {}", name, bind);
                Some(listener)
            }
            None => None,
        };

        #[cfg(unix)]
        let unix_listener = match &self.settings.bind_socket {
            Some(path) => {
                let listener = bind_named_socket(path).map_err(|e| {
                    PuenteError::routing(format!(
                        "[{name}] Setting up named socket service '{}': {e}",
                        path.display()
                    ))
                })?;
                info!("[{}] started: listening using {}", name, path.display());
                Some(listener)
            }
            None => None,
        };

        let tcp_addr = tcp_listener.as_ref().and_then(|l| l.local_addr().ok());
        let active_routes = Arc::clone(&self.active_routes);
        let handled_routes = Arc::clone(&self.handled_routes);
        let conn_errors = Arc::clone(&self.conn_errors);

        let join = tokio::spawn(async move {
            #[cfg(unix)]
            self.acceptor(tcp_listener, unix_listener).await;
            #[cfg(not(unix))]
            self.acceptor(tcp_listener).await;
        });

        Ok(RouterHandle {
            tcp_addr,
            active_routes,
            handled_routes,
            conn_errors,
            join,
        })
    }

    async fn acceptor(
        mut self,
        tcp_listener: Option<TcpListener>,
        #[cfg(unix)] unix_listener: Option<UnixListener>,
    ) {
        loop {
            let accept_any = async {
                #[cfg(unix)]
                {
                    tokio::select! {
                        accepted = accept_tcp(&tcp_listener) => accepted,
                        accepted = accept_unix(&unix_listener) => accepted,
                    }
                }
                #[cfg(not(unix))]
                {
                    accept_tcp(&tcp_listener).await
                }
            };

            let accepted = tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
                accepted = accept_any => accepted,
            };

            let client = match accepted {
                Ok(client) => client,
                Err(e) => {
                    if is_transient_accept_error(&e) {
                        warn!("[{}] Failed accepting connection: {}", self.settings.name, e);
                        continue;
                    }
                    error!(
                        "[{}] Listener failed, stopping acceptor: {}",
                        self.settings.name, e
                    );
                    break;
                }
            };

            self.admit(client).await;
        }

        #[cfg(unix)]
        if let Some(path) = &self.settings.bind_socket {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Failed removing socket file {} ({})",
                        path.display(),
                        e
                    );
                }
            }
        }

        info!("[{}] stopped", self.settings.name);
    }

    /// Admission checks, then hand the client to its own worker.
    async fn admit(&self, mut client: ClientStream) {
        let name = &self.settings.name;
        let client_key = client.client_key();

        if self.conn_errors.is_blocked(client_key) && !self.conn_errors.maybe_reset(client_key)
        {
            let message = format!("Too many connection errors from {}", client.peer());
            let _ = self
                .protocol
                .send_error(&mut client, 1129, &message, "HY000", name)
                .await;
            info!("{message}");
            return; // dropping the stream closes it, no shutdown first
        }

        if self.active_routes.load(Ordering::Relaxed) >= self.settings.max_connections {
            let _ = self
                .protocol
                .send_error(&mut client, 1040, "Too many connections", "HY000", name)
                .await;
            warn!(
                "[{}] reached max active connections ({} max={})",
                name,
                self.active_routes.load(Ordering::Relaxed),
                self.settings.max_connections
            );
            return;
        }

        let worker = SpliceWorker {
            settings: self.settings.clone(),
            destination: Arc::clone(&self.destination),
            protocol: Arc::clone(&self.protocol),
            conn_errors: Arc::clone(&self.conn_errors),
            active_routes: Arc::clone(&self.active_routes),
            handled_routes: Arc::clone(&self.handled_routes),
        };
        tokio::spawn(async move { worker.run(client).await });
    }
}

struct SpliceWorker {
    settings: RouteSettings,
    destination: Arc<dyn Destination>,
    protocol: Arc<dyn Protocol>,
    conn_errors: Arc<ConnErrorCounters>,
    active_routes: Arc<AtomicUsize>,
    handled_routes: Arc<AtomicU64>,
}

impl SpliceWorker {
    async fn run(self, mut client: ClientStream) {
        let name = &self.settings.name;

        // CONNECT_UPSTREAM
        let server = match self
            .destination
            .get_server_socket(self.settings.destination_connect_timeout)
            .await
        {
            Ok(server) => server,
            Err(e) => {
                let bound = self
                    .settings
                    .bind_address
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| client.peer());
                let message =
                    format!("Can't connect to remote MySQL server for client '{bound}'");
                warn!("[{name}] {message} ({e})");
                let _ = self
                    .protocol
                    .send_error(&mut client, 2003, &message, "HY000", name)
                    .await;
                let _ = client.shutdown().await;
                return;
            }
        };

        let client_peer = client.peer();
        let client_key = client.client_key();
        let server_peer = server
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("[{name}] source {client_peer} - dest {server_peer}");

        self.active_routes.fetch_add(1, Ordering::Relaxed);
        self.handled_routes.fetch_add(1, Ordering::Relaxed);

        let (bytes_up, bytes_down, handshake_done, extra_msg) =
            self.splice(client, server).await;

        // TEARDOWN bookkeeping; the streams were shut down by splice()
        if !handshake_done {
            debug!("[{name}] Routing failed for {client_peer}: {extra_msg}");
            self.conn_errors.maybe_reset(client_key);
            let blocked = self.conn_errors.record_error(client_key);
            if blocked {
                warn!("[{name}] blocking client host {client_peer}");
            } else {
                info!(
                    "[{name}] {} connection errors for {client_peer} (max {})",
                    self.conn_errors.error_count(client_key),
                    self.conn_errors.max_connect_errors()
                );
            }
        }

        self.active_routes.fetch_sub(1, Ordering::Relaxed);
        debug!("[{name}] Routing stopped (up:{bytes_up}b;down:{bytes_down}b) {extra_msg}");
    }

    /// HANDSHAKE and PROXY states. Returns the transfer totals, whether the
    /// handshake completed, and a description of why the loop ended.
    async fn splice(
        &self,
        client: ClientStream,
        server: TcpStream,
    ) -> (u64, u64, bool, String) {
        let name = &self.settings.name;
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        // one buffer per direction; a read is fully written to the other
        // side before that direction reads again
        let mut up_buffer = vec![0u8; self.settings.net_buffer_length];
        let mut down_buffer = vec![0u8; self.settings.net_buffer_length];

        let mut handshake_done = false;
        let mut bytes_up: u64 = 0; // server -> client
        let mut bytes_down: u64 = 0; // client -> server
        let mut extra_msg = String::new();

        loop {
            // race only the reads; forwarding happens after the wait so a
            // cancelled branch never loses bytes it already consumed
            let wait_readable = async {
                tokio::select! {
                    result = server_read.read(&mut up_buffer) => (result, true),
                    result = client_read.read(&mut down_buffer) => (result, false),
                }
            };

            let (result, from_server) = if handshake_done {
                wait_readable.await
            } else {
                match timeout(self.settings.client_connect_timeout, wait_readable).await {
                    Ok(result) => result,
                    Err(_) => {
                        extra_msg = "Wait timed out".to_string();
                        break;
                    }
                }
            };

            let n = match result {
                Ok(0) => break, // peer closed
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => {
                    extra_msg = format!("Wait failed: {e}");
                    break;
                }
            };

            // in this protocol the server always speaks first; the
            // protocol layer tracks the handshake as packets go by
            let forwarded = if from_server {
                self.protocol
                    .copy_packets(&up_buffer[..n], &mut client_write, handshake_done, true)
                    .await
            } else {
                self.protocol
                    .copy_packets(&down_buffer[..n], &mut server_write, handshake_done, false)
                    .await
            };

            match forwarded {
                Ok(handshake_complete) => {
                    if handshake_complete {
                        handshake_done = true;
                    }
                    if from_server {
                        bytes_up += n as u64;
                    } else {
                        bytes_down += n as u64;
                    }
                }
                Err(e) => {
                    extra_msg = format!(
                        "Copy {} failed: {e}",
                        if from_server {
                            "server-client"
                        } else {
                            "client-server"
                        }
                    );
                    break;
                }
            }
        }

        if !handshake_done {
            self.protocol
                .on_block_client_host(&mut server_write, name)
                .await;
        }

        let mut client = client_read.unsplit(client_write);
        let mut server = server_read.unsplit(server_write);
        let _ = client.shutdown().await;
        let _ = server.shutdown().await;

        (bytes_up, bytes_down, handshake_done, extra_msg)
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_tcp(listener: &Option<TcpListener>) -> io::Result<ClientStream> {
    match listener {
        Some(listener) => {
            let (stream, addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("client setsockopt error: {e}");
            }
            debug!("TCP connection from {addr} accepted");
            Ok(ClientStream::Tcp(stream, addr))
        }
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn accept_unix(listener: &Option<UnixListener>) -> io::Result<ClientStream> {
    match listener {
        Some(listener) => {
            let (stream, _) = listener.accept().await?;
            debug!("local socket connection accepted");
            Ok(ClientStream::Unix(stream))
        }
        None => std::future::pending().await,
    }
}

/// Address-family-agnostic bind with SO_REUSEADDR and the standard backlog.
async fn bind_tcp(bind: &TcpAddress) -> io::Result<TcpListener> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((bind.addr.as_str(), bind.port)).await? {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }?;
        #[cfg(not(windows))]
        socket.set_reuseaddr(true)?;
        match socket.bind(addr) {
            Ok(()) => return socket.listen(LISTEN_BACKLOG),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable bind address")
    }))
}

/// Bind the named socket. A stale socket file (nothing accepting on it) is
/// removed and rebound; a live one is an address-in-use failure.
#[cfg(unix)]
fn bind_named_socket(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => {
                error!(
                    "Socket file {} already in use by another process",
                    path.display()
                );
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "Socket file already in use",
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(
                    "Socket file {} already exists, but seems to be unused. Deleting and retrying...",
                    path.display()
                );
                std::fs::remove_file(path)?;
            }
            Err(_) => {
                std::fs::remove_file(path)?;
            }
        }
    }
    UnixListener::bind(path)
}
