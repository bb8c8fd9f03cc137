/// The metadata cache: periodic refresh and the published snapshot
///
/// A long-lived refresh loop fetches the reconciled topology every TTL and
/// publishes it as an immutable snapshot. Readers load the current snapshot
/// without blocking the publisher; waiters for a primary are woken on every
/// publish.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;

use super::fetch::ClusterMetadata;
use super::{InstanceStatus, ManagedInstance, ReplicaSetsByName, ServerMode};

pub struct MetadataCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    cluster_name: String,
    ttl: Duration,
    metadata: Mutex<ClusterMetadata>,
    snapshot: RwLock<Arc<ReplicaSetsByName>>,
    /// Replicasets whose primary was reported unreachable, with the
    /// unreachable primary's UUID. Entries clear once a refresh shows a
    /// different writable member.
    lost_primaries: Mutex<HashMap<String, String>>,
    published: Notify,
    stopping: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Mutex<Receiver<()>>,
}

impl MetadataCache {
    pub fn new(cluster_name: impl Into<String>, ttl: Duration, metadata: ClusterMetadata) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel();
        Self {
            inner: Arc::new(CacheInner {
                cluster_name: cluster_name.into(),
                ttl,
                metadata: Mutex::new(metadata),
                snapshot: RwLock::new(Arc::new(ReplicaSetsByName::new())),
                lost_primaries: Mutex::new(HashMap::new()),
                published: Notify::new(),
                stopping: AtomicBool::new(false),
                wake_tx,
                wake_rx: Mutex::new(wake_rx),
            }),
        }
    }

    /// Start the refresh loop on its own thread. The metadata session is a
    /// blocking client, so the loop does not live on the async runtime.
    pub fn start(&self) -> thread::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("md:{}", inner.cluster_name))
            .spawn(move || {
                info!(
                    "Starting metadata cache refresh for cluster '{}' (ttl {:?})",
                    inner.cluster_name, inner.ttl
                );
                while !inner.stopping.load(Ordering::Relaxed) {
                    inner.refresh();

                    let wake = inner.wake_rx.lock().unwrap();
                    match wake.recv_timeout(inner.ttl) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(
                    "Metadata cache refresh for cluster '{}' stopped",
                    inner.cluster_name
                );
            })
            .expect("spawning metadata cache thread")
    }

    /// Out-of-band fetch; also what the refresh loop runs every TTL.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// A copy of the current member list for `name`; empty when the
    /// replicaset is unknown or no snapshot was ever published.
    pub fn replicaset_lookup(&self, name: &str) -> Vec<ManagedInstance> {
        let snapshot = self.inner.snapshot.read().unwrap();
        snapshot
            .get(name)
            .map(|rs| rs.members.clone())
            .unwrap_or_default()
    }

    /// Record a reachability hint from routing. The published snapshot is
    /// left untouched; the hint wakes the refresh loop so the next fetch
    /// happens sooner, and an unreachable primary is remembered so that
    /// [`MetadataCache::wait_primary_failover`] holds out for a new one.
    pub fn mark_instance_reachability(&self, instance_uuid: &str, status: InstanceStatus) {
        match status {
            InstanceStatus::Unreachable => {
                warn!(
                    "Instance {} reported unreachable, scheduling metadata refresh",
                    instance_uuid
                );
                let snapshot = Arc::clone(&self.inner.snapshot.read().unwrap());
                for replicaset in snapshot.values() {
                    let is_lost_primary = replicaset.single_primary
                        && replicaset.members.iter().any(|m| {
                            m.server_uuid == instance_uuid
                                && m.mode == ServerMode::ReadWrite
                        });
                    if is_lost_primary {
                        self.inner
                            .lost_primaries
                            .lock()
                            .unwrap()
                            .insert(replicaset.name.clone(), instance_uuid.to_string());
                    }
                }
                let _ = self.inner.wake_tx.send(());
            }
            InstanceStatus::Reachable => {
                debug!("Instance {} reported reachable again", instance_uuid);
            }
        }
    }

    /// Wait until `name` contains a usable writable member, up to
    /// `timeout`. A primary that routing reported unreachable does not
    /// count until a refresh shows a different one.
    pub async fn wait_primary_failover(&self, name: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.published.notified();
            if self.has_writable_member(name)
                && !self.inner.lost_primaries.lock().unwrap().contains_key(name)
            {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }

    fn has_writable_member(&self, name: &str) -> bool {
        let snapshot = self.inner.snapshot.read().unwrap();
        snapshot
            .get(name)
            .map(|rs| rs.members.iter().any(|m| m.mode == ServerMode::ReadWrite))
            .unwrap_or(false)
    }

    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Relaxed);
        let _ = self.inner.wake_tx.send(());
    }
}

impl CacheInner {
    /// Drop lost-primary marks for replicasets where the cluster no longer
    /// reports the marked instance as the (sole) writable member.
    fn clear_recovered_primaries(&self, replicasets: &ReplicaSetsByName) {
        let mut lost = self.lost_primaries.lock().unwrap();
        lost.retain(|name, lost_uuid| {
            let Some(replicaset) = replicasets.get(name) else {
                return false;
            };
            let marked_still_primary = replicaset.members.iter().any(|m| {
                &m.server_uuid == lost_uuid && m.mode == ServerMode::ReadWrite
            });
            let new_primary_available = replicaset
                .members
                .iter()
                .any(|m| &m.server_uuid != lost_uuid && m.mode == ServerMode::ReadWrite);
            marked_still_primary && !new_primary_available
        });
    }

    fn refresh(&self) {
        let fetched = {
            let mut metadata = self.metadata.lock().unwrap();
            metadata.fetch_instances(&self.cluster_name)
        };
        match fetched {
            Ok(replicasets) => {
                self.clear_recovered_primaries(&replicasets);
                *self.snapshot.write().unwrap() = Arc::new(replicasets);
                self.published.notify_waiters();
            }
            Err(e) => {
                // keep serving the previous snapshot
                warn!(
                    "Failed fetching metadata for cluster '{}': {}",
                    self.cluster_name, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::testing::{row, ReplayFactory, ReplayScript};
    use super::*;
    use crate::core::TcpAddress;
    use std::time::Instant;

    fn expect_catalog(script: &ReplayScript) {
        script.expect_query(
            "SELECT R.replicaset_name",
            vec![
                row(&[
                    Some("default"),
                    Some("uuid-1"),
                    Some("HA"),
                    None,
                    None,
                    Some(""),
                    Some("localhost:3000"),
                    Some("localhost:30000"),
                ]),
                row(&[
                    Some("default"),
                    Some("uuid-2"),
                    Some("HA"),
                    None,
                    None,
                    Some(""),
                    Some("localhost:3001"),
                    Some("localhost:30010"),
                ]),
                row(&[
                    Some("default"),
                    Some("uuid-3"),
                    Some("HA"),
                    None,
                    None,
                    Some(""),
                    Some("localhost:3002"),
                    Some("localhost:30020"),
                ]),
            ],
        );
    }

    fn expect_group_members(script: &ReplayScript, rows: Vec<Vec<Option<String>>>, primary: &str) {
        script.expect_query(
            "show status like 'group_replication_primary_member'",
            vec![row(&[
                Some("group_replication_primary_member"),
                Some(primary),
            ])],
        );
        script.expect_query(
            "SELECT member_id, member_host, member_port, member_state",
            rows,
        );
    }

    fn all_online(script: &ReplayScript) {
        expect_group_members(
            script,
            vec![
                row(&[
                    Some("uuid-1"),
                    Some("somehost"),
                    Some("3000"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
                row(&[
                    Some("uuid-2"),
                    Some("somehost"),
                    Some("3001"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
                row(&[
                    Some("uuid-3"),
                    Some("somehost"),
                    Some("3002"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
            ],
            "uuid-1",
        );
    }

    fn cache_with(script: &ReplayScript) -> MetadataCache {
        let metadata = ClusterMetadata::new(
            "admin",
            "admin",
            Duration::from_secs(1),
            vec![TcpAddress::new("127.0.0.1", 3000)],
            Arc::new(ReplayFactory::new(script.clone())),
        );
        MetadataCache::new("cluster-1", Duration::from_secs(10), metadata)
    }

    #[tokio::test]
    async fn test_steady_state_lookup_and_wait() {
        let script = ReplayScript::new();
        expect_catalog(&script);
        all_online(&script);

        let cache = cache_with(&script);
        cache.refresh();

        let instances = cache.replicaset_lookup("default");
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].server_uuid, "uuid-1");
        assert_eq!(instances[0].mode, ServerMode::ReadWrite);
        assert_eq!(instances[1].mode, ServerMode::ReadOnly);
        assert_eq!(instances[2].mode, ServerMode::ReadOnly);

        let started = Instant::now();
        assert!(cache.wait_primary_failover("default", Duration::from_secs(2)).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(script.all_consumed());
    }

    #[tokio::test]
    async fn test_primary_down_but_cluster_has_not_noticed() {
        let script = ReplayScript::new();
        expect_catalog(&script);
        all_online(&script);

        let cache = cache_with(&script);
        cache.refresh();

        // the cluster replays the same (stale) view
        expect_catalog(&script);
        all_online(&script);
        cache.refresh();

        cache.mark_instance_reachability("uuid-1", InstanceStatus::Unreachable);

        // no failover has happened, so waiting for a primary times out
        let started = Instant::now();
        assert!(
            !cache
                .wait_primary_failover("default", Duration::from_secs(1))
                .await
        );
        assert!(started.elapsed() >= Duration::from_secs(1));

        // the marked instance is not demoted in place; the snapshot stays
        // as the cluster reported it
        let instances = cache.replicaset_lookup("default");
        assert_eq!(instances[0].server_uuid, "uuid-1");
        assert_eq!(instances[0].mode, ServerMode::ReadWrite);
        assert_eq!(instances[1].mode, ServerMode::ReadOnly);
        assert_eq!(instances[2].mode, ServerMode::ReadOnly);
    }

    #[tokio::test]
    async fn test_wait_primary_failover_times_out_without_primary() {
        let script = ReplayScript::new();
        expect_catalog(&script);
        // no primary elected: all secondaries
        expect_group_members(
            &script,
            vec![
                row(&[
                    Some("uuid-2"),
                    Some("somehost"),
                    Some("3001"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
                row(&[
                    Some("uuid-3"),
                    Some("somehost"),
                    Some("3002"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
            ],
            "",
        );

        let cache = cache_with(&script);
        cache.refresh();

        let started = Instant::now();
        assert!(
            !cache
                .wait_primary_failover("default", Duration::from_secs(1))
                .await
        );
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_primary_failover_to_second_member() {
        let script = ReplayScript::new();
        expect_catalog(&script);
        all_online(&script);

        let cache = cache_with(&script);
        cache.refresh();

        cache.mark_instance_reachability("uuid-1", InstanceStatus::Unreachable);

        // group replication noticed: uuid-1 gone, uuid-2 elected
        expect_catalog(&script);
        expect_group_members(
            &script,
            vec![
                row(&[
                    Some("uuid-2"),
                    Some("somehost"),
                    Some("3001"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
                row(&[
                    Some("uuid-3"),
                    Some("somehost"),
                    Some("3002"),
                    Some("ONLINE"),
                    Some("1"),
                ]),
            ],
            "uuid-2",
        );
        cache.refresh();

        let instances = cache.replicaset_lookup("default");
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].mode, ServerMode::Unavailable);
        assert_eq!(instances[1].mode, ServerMode::ReadWrite);
        assert_eq!(instances[2].mode, ServerMode::ReadOnly);

        let started = Instant::now();
        assert!(cache.wait_primary_failover("default", Duration::from_secs(2)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_fetch_retains_previous_snapshot() {
        let script = ReplayScript::new();
        expect_catalog(&script);
        all_online(&script);

        let cache = cache_with(&script);
        cache.refresh();
        assert_eq!(cache.replicaset_lookup("default").len(), 3);

        script.expect_query_error("SELECT R.replicaset_name", 2013, "Lost connection");
        cache.refresh();

        // previous snapshot still served
        assert_eq!(cache.replicaset_lookup("default").len(), 3);
    }

    #[tokio::test]
    async fn test_lookup_before_first_publish_is_empty() {
        let script = ReplayScript::new();
        let cache = cache_with(&script);
        assert!(cache.replicaset_lookup("default").is_empty());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_publish() {
        let script = ReplayScript::new();
        let cache = cache_with(&script);

        expect_catalog(&script);
        all_online(&script);

        let waiter = {
            let script = script.clone();
            let cache_inner = Arc::clone(&cache.inner);
            tokio::spawn(async move {
                let _ = script; // keep alive
                let cache = MetadataCache { inner: cache_inner };
                cache
                    .wait_primary_failover("default", Duration::from_secs(5))
                    .await
            })
        };

        // publish from outside the waiter
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.refresh();

        assert!(waiter.await.unwrap());
    }
}
