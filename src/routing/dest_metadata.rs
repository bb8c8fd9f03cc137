/// Destination backed by the metadata cache
///
/// Every call walks the latest published snapshot; nothing about the
/// endpoint choice is cached across calls except the round-robin cursor.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::net::TcpStream;

use super::destination::{ConnectError, Destination};
use super::protocol::ProtocolKind;
use crate::core::connection::ServerConnector;
use crate::core::TcpAddress;
use crate::metadata::cache::MetadataCache;
use crate::metadata::{InstanceStatus, ServerMode};

/// When a client wants a primary and none exists, wait this long for the
/// cluster to elect one before giving up on the client.
const PRIMARY_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Which members of the replicaset this route may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPurpose {
    /// Writable members (role=PRIMARY).
    ReadWrite,
    /// Read-only members (role=SECONDARY).
    ReadOnly,
}

pub struct MetadataCacheDestination {
    cache: Arc<MetadataCache>,
    replicaset: String,
    purpose: RoutingPurpose,
    /// With role=SECONDARY, also offer the primary for reads.
    allow_primary_reads: bool,
    protocol: ProtocolKind,
    connector: Arc<dyn ServerConnector>,
    cursor: Mutex<usize>,
}

impl MetadataCacheDestination {
    pub fn new(
        cache: Arc<MetadataCache>,
        replicaset: impl Into<String>,
        purpose: RoutingPurpose,
        allow_primary_reads: bool,
        protocol: ProtocolKind,
        connector: Arc<dyn ServerConnector>,
    ) -> Self {
        if allow_primary_reads && purpose == RoutingPurpose::ReadWrite {
            warn!("allow_primary_reads only works with read-only routes");
        }
        Self {
            cache,
            replicaset: replicaset.into(),
            purpose,
            allow_primary_reads,
            protocol,
            connector,
            cursor: Mutex::new(0),
        }
    }

    /// Usable endpoints in snapshot order, with the owning server UUIDs.
    fn get_available(&self) -> (Vec<TcpAddress>, Vec<String>) {
        let members = self.cache.replicaset_lookup(&self.replicaset);
        let mut addresses = Vec::new();
        let mut server_uuids = Vec::new();
        for member in members {
            let wanted = match self.purpose {
                RoutingPurpose::ReadWrite => member.mode == ServerMode::ReadWrite,
                RoutingPurpose::ReadOnly => {
                    member.mode == ServerMode::ReadOnly
                        || (self.allow_primary_reads && member.mode == ServerMode::ReadWrite)
                }
            };
            if !wanted {
                continue;
            }
            let port = match self.protocol {
                ProtocolKind::Classic => member.port,
                ProtocolKind::X => member.xport,
            };
            addresses.push(TcpAddress::new(member.connect_host(), port));
            server_uuids.push(member.server_uuid.clone());
        }
        (addresses, server_uuids)
    }
}

#[async_trait]
impl Destination for MetadataCacheDestination {
    async fn get_server_socket(
        &self,
        connect_timeout: Duration,
    ) -> Result<TcpStream, ConnectError> {
        let mut retried_after_failover = false;
        loop {
            let (available, server_uuids) = self.get_available();
            if available.is_empty() {
                warn!(
                    "No available {} servers found for '{}'",
                    match self.purpose {
                        RoutingPurpose::ReadWrite => "RW",
                        RoutingPurpose::ReadOnly => "RO",
                    },
                    self.replicaset
                );
                return Err(ConnectError::NoDestinations);
            }

            let next_up = {
                let mut cursor = self.cursor.lock().unwrap();
                let next_up = if *cursor >= available.len() { 0 } else { *cursor };
                *cursor = (next_up + 1) % available.len();
                next_up
            };

            match self.connector.connect(&available[next_up], connect_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    self.cache.mark_instance_reachability(
                        &server_uuids[next_up],
                        InstanceStatus::Unreachable,
                    );
                    // a dead primary may mean a failover is in progress;
                    // give the cluster one chance to elect a new one
                    if self.purpose == RoutingPurpose::ReadWrite
                        && !retried_after_failover
                        && self
                            .cache
                            .wait_primary_failover(&self.replicaset, PRIMARY_FAILOVER_TIMEOUT)
                            .await
                    {
                        info!(
                            "Retrying connection for '{}' after possible failover",
                            self.replicaset
                        );
                        retried_after_failover = true;
                        continue;
                    }
                    return Err(ConnectError::AllDown(e));
                }
            }
        }
    }
}
