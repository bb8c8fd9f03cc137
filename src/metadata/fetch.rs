/// Topology acquisition and status reconciliation
///
/// A fetch is two phases: the configured topology comes from the metadata
/// catalog on a bootstrap server, the live per-member state from the
/// group-replication tables of one reachable member per replicaset. The
/// catalog is trusted for addressing, the member for liveness.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::session::{MetadataSession, RowAction, SessionFactory};
use super::{
    GroupReplicationMember, GroupReplicationRole, GroupReplicationState, ManagedInstance,
    ManagedReplicaSet, ReplicaSetsByName, ReplicasetStatus, ServerMode,
};
use crate::core::TcpAddress;
use crate::error::MetadataError;

const DEFAULT_CLASSIC_PORT: u16 = 3306;
const DEFAULT_X_PORT: u16 = 33060;

const GR_PRIMARY_QUERY: &str = "show status like 'group_replication_primary_member'";
const GR_MEMBERS_QUERY: &str = "SELECT member_id, member_host, member_port, member_state, \
     @@group_replication_single_primary_mode \
     FROM performance_schema.replication_group_members \
     WHERE channel_name = 'group_replication_applier'";

fn catalog_query(quoted_cluster_name: &str) -> String {
    format!(
        "SELECT \
         R.replicaset_name, \
         I.mysql_server_uuid, \
         I.role, \
         I.weight, \
         I.version_token, \
         H.location, \
         I.addresses->>'$.mysqlClassic', \
         I.addresses->>'$.mysqlX' \
         FROM \
         mysql_innodb_cluster_metadata.clusters AS F \
         JOIN mysql_innodb_cluster_metadata.replicasets AS R \
         ON F.cluster_id = R.cluster_id \
         JOIN mysql_innodb_cluster_metadata.instances AS I \
         ON R.replicaset_id = I.replicaset_id \
         JOIN mysql_innodb_cluster_metadata.hosts AS H \
         ON I.host_id = H.host_id \
         WHERE F.cluster_name = {quoted_cluster_name};"
    )
}

fn get_string(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Fetches cluster topology and reconciles it with live member state.
pub struct ClusterMetadata {
    user: String,
    password: String,
    connect_timeout: Duration,
    bootstrap_servers: Vec<TcpAddress>,
    sessions: Arc<dyn SessionFactory>,
    session: Option<Box<dyn MetadataSession>>,
}

impl ClusterMetadata {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        connect_timeout: Duration,
        bootstrap_servers: Vec<TcpAddress>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_timeout,
            bootstrap_servers,
            sessions,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Establish a session to the first bootstrap server that accepts one.
    pub fn connect(&mut self) -> bool {
        let mut session = self.sessions.create();
        for server in &self.bootstrap_servers {
            let host = canonical_host(&server.addr);
            match session.connect(
                host,
                server.port,
                &self.user,
                &self.password,
                self.connect_timeout,
            ) {
                Ok(()) => {
                    info!(
                        "Connected with metadata server running on {}:{}",
                        host, server.port
                    );
                    self.session = Some(session);
                    return true;
                }
                Err(e) => {
                    error!("Failed connecting with metadata server {server}: {e}");
                }
            }
        }
        error!("Failed connecting with any of the bootstrap servers");
        self.session = None;
        false
    }

    /// Produce a fresh, reconciled snapshot for `cluster_name`.
    pub fn fetch_instances(
        &mut self,
        cluster_name: &str,
    ) -> Result<ReplicaSetsByName, MetadataError> {
        debug!("Updating metadata information for cluster '{cluster_name}'");

        if !self.is_connected() && !self.connect() {
            return Err(MetadataError::NoBootstrapServer);
        }

        let mut replicasets = match self.fetch_instances_from_metadata_server(cluster_name) {
            Ok(replicasets) => replicasets,
            Err(e) => {
                // force a reconnect on the next refresh
                self.session = None;
                return Err(e);
            }
        };
        if replicasets.is_empty() {
            warn!("No replicasets defined for cluster '{cluster_name}'");
        }

        for (name, replicaset) in replicasets.iter_mut() {
            let name = name.clone();
            self.update_replicaset_status(&name, replicaset);
        }

        Ok(replicasets)
    }

    /// The expected topology, straight from the catalog.
    fn fetch_instances_from_metadata_server(
        &mut self,
        cluster_name: &str,
    ) -> Result<ReplicaSetsByName, MetadataError> {
        let session = self
            .session
            .as_mut()
            .ok_or(MetadataError::NoBootstrapServer)?;
        let query = catalog_query(&session.quote(cluster_name));

        let mut replicaset_map = ReplicaSetsByName::new();
        let mut row_error: Option<MetadataError> = None;

        session
            .query(&query, &mut |row| {
                if row.len() != 8 {
                    row_error = Some(MetadataError::UnexpectedRowArity {
                        expected: 8,
                        got: row.len(),
                    });
                    return RowAction::Stop;
                }

                let mut instance = ManagedInstance {
                    replicaset_name: get_string(&row[0]),
                    server_uuid: get_string(&row[1]),
                    role: get_string(&row[2]),
                    weight: row[3]
                        .as_deref()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0.0),
                    version_token: row[4]
                        .as_deref()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    location: get_string(&row[5]),
                    host: String::new(),
                    port: 0,
                    xport: 0,
                    mode: ServerMode::Unavailable,
                };

                let classic = get_string(&row[6]);
                match crate::core::split_addr_port(&classic) {
                    Ok((host, port)) => {
                        instance.host = host;
                        instance.port = if port == 0 { DEFAULT_CLASSIC_PORT } else { port };
                    }
                    Err(e) => {
                        warn!(
                            "Error parsing address in metadata for instance {}: '{}': {}",
                            instance.server_uuid, classic, e
                        );
                        return RowAction::Continue; // skip the row
                    }
                }

                match row[7].as_deref().filter(|v| !v.is_empty()) {
                    Some(x_addr) => match crate::core::split_addr_port(x_addr) {
                        Ok((_, port)) => {
                            instance.xport = if port == 0 { DEFAULT_X_PORT } else { port };
                        }
                        Err(e) => {
                            warn!(
                                "Error parsing address in metadata for instance {}: '{}': {}",
                                instance.server_uuid, x_addr, e
                            );
                            return RowAction::Continue;
                        }
                    },
                    None => instance.xport = instance.port.saturating_mul(10),
                }

                let replicaset = replicaset_map
                    .entry(instance.replicaset_name.clone())
                    .or_default();
                replicaset.name = instance.replicaset_name.clone();
                // actual value comes from the group-replication state
                replicaset.single_primary = true;
                replicaset.members.push(instance);

                RowAction::Continue
            })
            .map_err(|e| MetadataError::fetch(e.to_string()))?;

        if let Some(e) = row_error {
            return Err(e);
        }
        Ok(replicaset_map)
    }

    /// Find a member with a quorum view and reconcile the replicaset against
    /// it. With no quorum anywhere the member list is cleared so routing
    /// sends no traffic into a partitioned segment.
    fn update_replicaset_status(&mut self, name: &str, replicaset: &mut ManagedReplicaSet) {
        debug!("Updating replicaset status from group replication for '{name}'");

        let bootstrap_addr = self
            .session
            .as_ref()
            .and_then(|s| s.address().map(str::to_string));
        let candidates: Vec<(String, u16)> = replicaset
            .members
            .iter()
            .map(|m| (m.connect_host().to_string(), m.port))
            .collect();

        let mut found_quorum = false;
        for (host, port) in candidates {
            let endpoint = format!("{host}:{port}");

            // share the bootstrap connection when the candidate is the
            // metadata server itself
            let members_result = if bootstrap_addr.as_deref() == Some(endpoint.as_str()) {
                let session = self.session.as_mut().expect("bootstrap session is open");
                fetch_group_replication_members(session.as_mut())
            } else {
                let mut session = self.sessions.create();
                if let Err(e) = session.connect(
                    &host,
                    port,
                    &self.user,
                    &self.password,
                    self.connect_timeout,
                ) {
                    warn!(
                        "While updating metadata, could not establish a connection to \
                         replicaset '{name}' through {endpoint}: {e}"
                    );
                    continue;
                }
                fetch_group_replication_members(session.as_mut())
            };

            let (member_status, single_primary) = match members_result {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        "Unable to fetch live group replication member data from {endpoint} \
                         from replicaset '{name}': {e}"
                    );
                    continue;
                }
            };
            debug!(
                "Replicaset '{}' has {} members in metadata, {} in status table",
                name,
                replicaset.members.len(),
                member_status.len()
            );

            match check_replicaset_status(&mut replicaset.members, &member_status) {
                ReplicasetStatus::AvailableWritable | ReplicasetStatus::AvailableReadOnly => {
                    replicaset.single_primary = single_primary;
                    found_quorum = true;
                }
                ReplicasetStatus::Unavailable => {
                    warn!("{endpoint} is not part of quorum for replicaset '{name}'");
                    continue;
                }
            }

            if found_quorum {
                break;
            }
        }

        if !found_quorum {
            error!(
                "Unable to fetch live group replication member data from any server in \
                 replicaset '{name}'"
            );
            replicaset.members.clear();
        }
    }
}

fn canonical_host(host: &str) -> &str {
    if host == "localhost" {
        "127.0.0.1"
    } else {
        host
    }
}

/// Ask one live node for its view: the elected primary and the state of
/// every member it can see.
fn fetch_group_replication_members(
    session: &mut dyn MetadataSession,
) -> Result<(HashMap<String, GroupReplicationMember>, bool), MetadataError> {
    let mut primary_uuid: Option<String> = None;
    session
        .query(GR_PRIMARY_QUERY, &mut |row| {
            if row.len() == 2 {
                primary_uuid = row[1].clone().filter(|v| !v.is_empty());
            }
            RowAction::Continue
        })
        .map_err(|e| MetadataError::fetch(e.to_string()))?;

    let mut members = HashMap::new();
    let mut single_primary = true;
    let mut row_error: Option<MetadataError> = None;
    session
        .query(GR_MEMBERS_QUERY, &mut |row| {
            if row.len() != 5 {
                row_error = Some(MetadataError::UnexpectedRowArity {
                    expected: 5,
                    got: row.len(),
                });
                return RowAction::Stop;
            }
            let member_id = get_string(&row[0]);
            let member = GroupReplicationMember {
                host: get_string(&row[1]),
                port: row[2].as_deref().and_then(|v| v.parse().ok()).unwrap_or(0),
                state: GroupReplicationState::parse(&get_string(&row[3])),
                role: GroupReplicationRole::Secondary,
            };
            if let Some(flag) = row[4].as_deref() {
                single_primary = flag == "1" || flag.eq_ignore_ascii_case("on");
            }
            members.insert(member_id, member);
            RowAction::Continue
        })
        .map_err(|e| MetadataError::fetch(e.to_string()))?;
    if let Some(e) = row_error {
        return Err(e);
    }

    if let Some(primary_uuid) = primary_uuid {
        if let Some(primary) = members.get_mut(&primary_uuid) {
            primary.role = GroupReplicationRole::Primary;
        }
    }

    Ok((members, single_primary))
}

/// Set each member's mode from the observed group-replication state and
/// derive the replicaset's availability.
///
/// Addressing from the catalog wins over what the status table reports;
/// the assumption is that every status member is present in the catalog.
/// Violations are logged but do not fail the fetch.
pub fn check_replicaset_status(
    members: &mut [ManagedInstance],
    member_status: &HashMap<String, GroupReplicationMember>,
) -> ReplicasetStatus {
    for (uuid, status) in member_status {
        if !members.iter().any(|m| &m.server_uuid == uuid) {
            error!(
                "Member {}:{} ({}) found in replicaset, yet is not defined in metadata!",
                status.host, status.port, uuid
            );
        }
    }

    let mut online_count = 0usize;
    let mut have_primary_instance = false;
    for member in members.iter_mut() {
        match member_status.get(&member.server_uuid) {
            Some(status) => match status.state {
                GroupReplicationState::Online => match status.role {
                    GroupReplicationRole::Primary => {
                        have_primary_instance = true;
                        member.mode = ServerMode::ReadWrite;
                        online_count += 1;
                    }
                    GroupReplicationRole::Secondary => {
                        member.mode = ServerMode::ReadOnly;
                        online_count += 1;
                    }
                },
                GroupReplicationState::Recovering
                | GroupReplicationState::Unreachable
                | GroupReplicationState::Offline
                | GroupReplicationState::Other => {
                    member.mode = ServerMode::Unavailable;
                }
            },
            None => {
                member.mode = ServerMode::Unavailable;
                warn!(
                    "Member {}:{} ({}) defined in metadata not found in actual replicaset",
                    member.host, member.port, member.server_uuid
                );
            }
        }
    }

    // quorum is a strict majority of the observed group membership
    if online_count > member_status.len() / 2 {
        if have_primary_instance {
            ReplicasetStatus::AvailableWritable
        } else {
            // temporary state during primary election
            ReplicasetStatus::AvailableReadOnly
        }
    } else {
        ReplicasetStatus::Unavailable
    }
}
