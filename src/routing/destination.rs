/// Destination selection over a static address list
///
/// Each policy decides the iteration order over the configured addresses
/// and how failures move the cursor. Policies read shared state only under
/// short locks and never hold it across a connect.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::TcpStream;

use crate::core::connection::ServerConnector;
use crate::core::TcpAddress;

/// How long a freshly failed endpoint is skipped.
const QUARANTINE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no destinations available")]
    NoDestinations,

    #[error("all destinations failed; last error: {0}")]
    AllDown(std::io::Error),
}

/// The contract the router consumes: hand me a connected server socket.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn get_server_socket(&self, connect_timeout: Duration)
        -> Result<TcpStream, ConnectError>;
}

/// Shared plumbing for the static-list policies.
struct AddressList {
    addresses: Vec<TcpAddress>,
    connector: Arc<dyn ServerConnector>,
    recent_failures: Mutex<HashMap<usize, Instant>>,
}

impl AddressList {
    fn new(addresses: Vec<TcpAddress>, connector: Arc<dyn ServerConnector>) -> Self {
        Self {
            addresses,
            connector,
            recent_failures: Mutex::new(HashMap::new()),
        }
    }

    fn quarantined(&self, index: usize) -> bool {
        let failures = self.recent_failures.lock().unwrap();
        failures
            .get(&index)
            .is_some_and(|at| at.elapsed() < QUARANTINE_WINDOW)
    }

    async fn try_connect(
        &self,
        index: usize,
        connect_timeout: Duration,
    ) -> Result<TcpStream, std::io::Error> {
        let addr = &self.addresses[index];
        debug!("Trying server {} (index {})", addr, index);
        match self.connector.connect(addr, connect_timeout).await {
            Ok(stream) => {
                self.recent_failures.lock().unwrap().remove(&index);
                Ok(stream)
            }
            Err(e) => {
                self.recent_failures
                    .lock()
                    .unwrap()
                    .insert(index, Instant::now());
                Err(e)
            }
        }
    }
}

/// Round-robin over every address; used for read-only routes.
pub struct RoundRobinDestination {
    list: AddressList,
    cursor: Mutex<usize>,
}

impl RoundRobinDestination {
    pub fn new(addresses: Vec<TcpAddress>, connector: Arc<dyn ServerConnector>) -> Self {
        Self {
            list: AddressList::new(addresses, connector),
            cursor: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Destination for RoundRobinDestination {
    async fn get_server_socket(
        &self,
        connect_timeout: Duration,
    ) -> Result<TcpStream, ConnectError> {
        let len = self.list.addresses.len();
        if len == 0 {
            return Err(ConnectError::NoDestinations);
        }

        let start = {
            let mut cursor = self.cursor.lock().unwrap();
            let start = *cursor % len;
            *cursor = (start + 1) % len;
            start
        };

        let mut last_error = None;
        for step in 0..len {
            let index = (start + step) % len;
            if self.list.quarantined(index) {
                continue;
            }
            match self.list.try_connect(index, connect_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(ConnectError::AllDown(e)),
            None => Err(ConnectError::NoDestinations),
        }
    }
}

/// Stick with the first reachable address and fail forward, never back.
/// Once every address has failed the route has no more destinations.
pub struct FirstAvailableDestination {
    list: AddressList,
    current: Mutex<usize>,
}

impl FirstAvailableDestination {
    pub fn new(addresses: Vec<TcpAddress>, connector: Arc<dyn ServerConnector>) -> Self {
        Self {
            list: AddressList::new(addresses, connector),
            current: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Destination for FirstAvailableDestination {
    async fn get_server_socket(
        &self,
        connect_timeout: Duration,
    ) -> Result<TcpStream, ConnectError> {
        let len = self.list.addresses.len();
        let start = *self.current.lock().unwrap();
        if start >= len {
            return Err(ConnectError::NoDestinations);
        }

        let mut last_error = None;
        for index in start..len {
            match self.list.try_connect(index, connect_timeout).await {
                Ok(stream) => {
                    *self.current.lock().unwrap() = index;
                    return Ok(stream);
                }
                Err(e) => {
                    // failover is permanent: the next call starts here
                    *self.current.lock().unwrap() = index + 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(ConnectError::AllDown(e)),
            None => Err(ConnectError::NoDestinations),
        }
    }
}

/// Like first-available, but the list wraps and the start pointer keeps
/// moving after an exhausted pass so load spreads over calls.
pub struct RingDestination {
    list: AddressList,
    current: Mutex<usize>,
}

impl RingDestination {
    pub fn new(addresses: Vec<TcpAddress>, connector: Arc<dyn ServerConnector>) -> Self {
        Self {
            list: AddressList::new(addresses, connector),
            current: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Destination for RingDestination {
    async fn get_server_socket(
        &self,
        connect_timeout: Duration,
    ) -> Result<TcpStream, ConnectError> {
        let len = self.list.addresses.len();
        if len == 0 {
            return Err(ConnectError::NoDestinations);
        }
        let start = *self.current.lock().unwrap() % len;

        let mut last_error = None;
        for step in 0..len {
            let index = (start + step) % len;
            match self.list.try_connect(index, connect_timeout).await {
                Ok(stream) => {
                    *self.current.lock().unwrap() = index;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        // exhausted: shift the ring so the next call starts elsewhere
        *self.current.lock().unwrap() = (start + 1) % len;
        warn!("No reachable destination in ring after a full pass");
        match last_error {
            Some(e) => Err(ConnectError::AllDown(e)),
            None => Err(ConnectError::NoDestinations),
        }
    }
}
