pub mod config;
/// Puente - transparent TCP reverse proxy for MySQL group-replication
/// clusters
///
/// Clients connect to a local listener; a destination policy picks a live
/// backend from the metadata cache's view of the cluster (or from a static
/// list) and the router splices bytes between the two sockets for the
/// lifetime of the session.
pub mod core;
pub mod error;
pub mod keyring;
pub mod metadata;
pub mod routing;
pub mod utils;

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

use crate::config::{Config, DestinationsSpec};
use crate::core::connection::{ServerConnector, TcpConnector};
use crate::error::{PuenteError, PuenteResult};
use crate::keyring::KeyringManager;
use crate::metadata::cache::MetadataCache;
use crate::metadata::fetch::ClusterMetadata;
use crate::metadata::session::MySqlSessionFactory;
use crate::routing::dest_metadata::MetadataCacheDestination;
use crate::routing::destination::{
    Destination, FirstAvailableDestination, RingDestination, RoundRobinDestination,
};
use crate::routing::protocol::create_protocol;
use crate::routing::router::{Router, RouterHandle};
use crate::routing::AccessMode;

/// The proxy application: configuration in, running routes out.
pub struct Puente {
    config: Config,
}

/// A started proxy; dropping it does not stop the routes, call
/// [`PuenteHandle::shutdown`].
pub struct PuenteHandle {
    pub routers: Vec<RouterHandle>,
    cache: Option<Arc<MetadataCache>>,
    cache_thread: Option<std::thread::JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl Puente {
    pub fn new(config: Config) -> PuenteResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring up the metadata cache and every configured route.
    pub async fn start(&self) -> PuenteResult<PuenteHandle> {
        let keyring = match &self.config.keyring {
            Some(section) => Some(KeyringManager::init(
                &section.keyring_path,
                &section.master_key_path,
                true,
            )?),
            None => None,
        };

        let mut cache = None;
        let mut cache_thread = None;
        if let Some(section) = &self.config.metadata_cache {
            let metadata_config = section.validate()?;
            let password = keyring
                .as_ref()
                .map(|k| k.fetch_or_empty(&metadata_config.user))
                .unwrap_or_default();
            let sessions = Arc::new(MySqlSessionFactory::new(metadata_config.ssl.clone()));
            let metadata = ClusterMetadata::new(
                metadata_config.user.clone(),
                password,
                metadata_config.connect_timeout,
                metadata_config.bootstrap_servers.clone(),
                sessions,
            );
            let metadata_cache = Arc::new(MetadataCache::new(
                metadata_config.cluster_name.clone(),
                metadata_config.ttl,
                metadata,
            ));
            cache_thread = Some(metadata_cache.start());
            cache = Some(metadata_cache);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let connector: Arc<dyn ServerConnector> = Arc::new(TcpConnector);

        let mut routers = Vec::new();
        for (index, section) in self.config.routing.iter().enumerate() {
            let route = section.validate(index)?;

            let destination: Arc<dyn Destination> = match route.destinations {
                DestinationsSpec::Static(addresses) => match route.mode {
                    AccessMode::ReadOnly => Arc::new(RoundRobinDestination::new(
                        addresses,
                        Arc::clone(&connector),
                    )),
                    AccessMode::ReadWrite => Arc::new(FirstAvailableDestination::new(
                        addresses,
                        Arc::clone(&connector),
                    )),
                    AccessMode::ReadWriteRing => {
                        Arc::new(RingDestination::new(addresses, Arc::clone(&connector)))
                    }
                },
                DestinationsSpec::MetadataCache {
                    replicaset,
                    role,
                    allow_primary_reads,
                } => {
                    let cache = cache.as_ref().ok_or_else(|| {
                        PuenteError::routing(
                            "metadata-cache destinations need a [metadata_cache] section",
                        )
                    })?;
                    Arc::new(MetadataCacheDestination::new(
                        Arc::clone(cache),
                        replicaset,
                        role,
                        allow_primary_reads,
                        route.protocol,
                        Arc::clone(&connector),
                    ))
                }
            };

            let protocol = Arc::from(create_protocol(route.protocol));
            let router = Router::new(route.settings, destination, protocol, stop_rx.clone());
            routers.push(router.start().await?);
        }

        info!("puente started with {} route(s)", routers.len());
        Ok(PuenteHandle {
            routers,
            cache,
            cache_thread,
            stop_tx,
        })
    }

    /// Run until interrupted, then shut down cleanly.
    pub async fn run(&self) -> PuenteResult<()> {
        let handle = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        handle.shutdown().await;
        Ok(())
    }
}

impl PuenteHandle {
    /// Stop accepting, let in-flight connections finish, stop the cache.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Some(cache) = &self.cache {
            cache.stop();
        }
        for router in self.routers {
            let _ = router.join.await;
        }
        if let Some(thread) = self.cache_thread {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn static_config(bind_port: u16, backend_port: u16) -> Config {
        Config {
            routing: vec![RoutingConfig {
                name: Some("static_rw".to_string()),
                bind_address: Some("127.0.0.1".to_string()),
                bind_port: Some(i64::from(bind_port)),
                destinations: Some(format!("127.0.0.1:{backend_port}")),
                mode: Some("read-write".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = Config::default();
        assert!(Puente::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_static_route() {
        // a backend that greets, then echoes
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(&[1u8, 0, 0, 0, 0x0a]).await;
                    let mut buf = [0u8; 256];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let config = static_config(free_port().await, backend_port);
        let puente = Puente::new(config).unwrap();
        let handle = puente.start().await.unwrap();
        let addr = handle.routers[0].tcp_addr.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut greeting = [0u8; 5];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[4], 0x0a);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown finishes");
    }
}
