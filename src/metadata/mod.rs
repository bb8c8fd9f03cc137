/// Cluster membership model shared by the metadata cache and routing
pub mod cache;
pub mod fetch;
pub mod session;

use std::collections::HashMap;

/// What a backend may be used for, assigned by status reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    ReadWrite,
    ReadOnly,
    Unavailable,
}

/// Availability of a whole replicaset after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicasetStatus {
    AvailableWritable,
    AvailableReadOnly,
    Unavailable,
}

/// Reachability hint reported by routing back to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Reachable,
    Unreachable,
}

/// One configured backend instance as described by the metadata catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedInstance {
    pub replicaset_name: String,
    /// Stable server identity; opaque to the proxy.
    pub server_uuid: String,
    /// Informational role tag from the catalog.
    pub role: String,
    pub weight: f32,
    pub version_token: u32,
    pub location: String,
    pub host: String,
    /// Classic protocol port.
    pub port: u16,
    /// Extended protocol port; synthesised as `port * 10` when the catalog
    /// does not carry one.
    pub xport: u16,
    pub mode: ServerMode,
}

impl ManagedInstance {
    /// Host with `localhost` canonicalised, the form used for connecting.
    pub fn connect_host(&self) -> &str {
        if self.host == "localhost" {
            "127.0.0.1"
        } else {
            &self.host
        }
    }
}

/// A named group of instances in group replication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedReplicaSet {
    pub name: String,
    pub members: Vec<ManagedInstance>,
    pub single_primary: bool,
}

/// The full membership snapshot, keyed by replicaset name.
pub type ReplicaSetsByName = HashMap<String, ManagedReplicaSet>;

/// Per-member state as reported by a live node's group-replication tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReplicationState {
    Online,
    Recovering,
    Unreachable,
    Offline,
    Other,
}

impl GroupReplicationState {
    pub fn parse(value: &str) -> Self {
        match value {
            "ONLINE" => GroupReplicationState::Online,
            "RECOVERING" => GroupReplicationState::Recovering,
            "UNREACHABLE" => GroupReplicationState::Unreachable,
            "OFFLINE" => GroupReplicationState::Offline,
            _ => GroupReplicationState::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReplicationRole {
    Primary,
    Secondary,
}

/// A row from the live group-membership table.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReplicationMember {
    pub host: String,
    pub port: u16,
    pub state: GroupReplicationState,
    pub role: GroupReplicationRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_replication_state_parse() {
        assert_eq!(
            GroupReplicationState::parse("ONLINE"),
            GroupReplicationState::Online
        );
        assert_eq!(
            GroupReplicationState::parse("RECOVERING"),
            GroupReplicationState::Recovering
        );
        assert_eq!(
            GroupReplicationState::parse("UNREACHABLE"),
            GroupReplicationState::Unreachable
        );
        assert_eq!(
            GroupReplicationState::parse("OFFLINE"),
            GroupReplicationState::Offline
        );
        assert_eq!(
            GroupReplicationState::parse("ERROR"),
            GroupReplicationState::Other
        );
    }

    #[test]
    fn test_connect_host_canonicalises_localhost() {
        let mut instance = ManagedInstance {
            replicaset_name: "default".to_string(),
            server_uuid: "uuid-1".to_string(),
            role: "HA".to_string(),
            weight: 0.0,
            version_token: 0,
            location: String::new(),
            host: "localhost".to_string(),
            port: 3306,
            xport: 33060,
            mode: ServerMode::Unavailable,
        };
        assert_eq!(instance.connect_host(), "127.0.0.1");

        instance.host = "db1.example.com".to_string();
        assert_eq!(instance.connect_host(), "db1.example.com");
    }
}
