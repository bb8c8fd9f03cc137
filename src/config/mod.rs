/// Configuration loading and validation
///
/// TOML file with a `[metadata_cache]` section, one or more `[[routing]]`
/// sections, and optional `[keyring]` / `[logging]` sections. Numeric
/// options are range-checked here so a router never sees an out-of-range
/// value; violations fail startup with the standard message shape.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{split_addr_port, TcpAddress};
use crate::error::ConfigError;
use crate::metadata::session::{SslConfig, SslMode};
use crate::routing::dest_metadata::RoutingPurpose;
use crate::routing::protocol::ProtocolKind;
use crate::routing::router::RouteSettings;
use crate::routing::{
    AccessMode, DEFAULT_BIND_ADDRESS, DEFAULT_CLIENT_CONNECT_TIMEOUT,
    DEFAULT_DESTINATION_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECT_ERRORS,
    DEFAULT_MAX_CONNECT_ERRORS_TIMEOUT, DEFAULT_NET_BUFFER_LENGTH,
};

const DEFAULT_METADATA_PORT: u16 = 3306;
const DEFAULT_METADATA_TTL: u64 = 300;
const DEFAULT_METADATA_CONNECT_TIMEOUT: u64 = 15;

/// Main proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster metadata source; required when any route uses
    /// metadata-cache destinations
    pub metadata_cache: Option<MetadataCacheConfig>,
    /// Routing instances
    #[serde(default)]
    pub routing: Vec<RoutingConfig>,
    /// Keyring file pair for operator secrets
    pub keyring: Option<KeyringConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCacheConfig {
    /// Servers to bootstrap the metadata connection from, as
    /// `mysql://host[:port]` or plain `host[:port]`
    pub bootstrap_server_addresses: Vec<String>,
    /// User for authenticating with the metadata servers
    pub user: String,
    /// Refresh period in seconds
    pub ttl: Option<u64>,
    /// Cluster name in the metadata schema
    pub metadata_cluster: String,
    /// Per-query connect timeout in seconds
    pub connect_timeout: Option<u64>,
    pub ssl_mode: Option<String>,
    pub tls_version: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_ca: Option<PathBuf>,
    pub ssl_capath: Option<PathBuf>,
    pub ssl_crl: Option<PathBuf>,
    pub ssl_crlpath: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Route name used in logs; defaults to `routing:<index>`
    pub name: Option<String>,
    pub bind_address: Option<String>,
    pub bind_port: Option<i64>,
    /// Named-socket path (not supported on Windows)
    pub socket: Option<PathBuf>,
    /// Comma separated `host:port` list or a `metadata-cache://` URI
    pub destinations: Option<String>,
    pub mode: Option<String>,
    pub protocol: Option<String>,
    pub connect_timeout: Option<i64>,
    pub max_connections: Option<i64>,
    pub max_connect_errors: Option<u64>,
    pub max_connect_errors_timeout: Option<u64>,
    pub client_connect_timeout: Option<i64>,
    pub net_buffer_length: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringConfig {
    pub keyring_path: PathBuf,
    pub master_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Where a route's traffic goes.
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationsSpec {
    Static(Vec<TcpAddress>),
    MetadataCache {
        replicaset: String,
        role: RoutingPurpose,
        allow_primary_reads: bool,
    },
}

/// A routing section after validation.
#[derive(Debug, Clone)]
pub struct ValidatedRoute {
    pub settings: RouteSettings,
    pub mode: AccessMode,
    pub protocol: ProtocolKind,
    pub destinations: DestinationsSpec,
}

/// The metadata section after validation.
#[derive(Debug, Clone)]
pub struct ValidatedMetadata {
    pub bootstrap_servers: Vec<TcpAddress>,
    pub user: String,
    pub ttl: Duration,
    pub cluster_name: String,
    pub connect_timeout: Duration,
    pub ssl: SslConfig,
}

fn range_error(
    option: &str,
    section: &str,
    lo: impl std::fmt::Display,
    hi: impl std::fmt::Display,
    value: impl std::fmt::Display,
) -> ConfigError {
    ConfigError::ValidationError(format!(
        "option {option} in [{section}] needs value between {lo} and {hi} inclusive, was '{value}'"
    ))
}

fn check_range_i64(
    option: &str,
    section: &str,
    value: i64,
    lo: i64,
    hi: i64,
) -> Result<i64, ConfigError> {
    if value < lo || value > hi {
        return Err(range_error(option, section, lo, hi, value));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[routing]] section is required".to_string(),
            ));
        }

        let metadata = match &self.metadata_cache {
            Some(section) => Some(section.validate()?),
            None => None,
        };

        for (index, route) in self.routing.iter().enumerate() {
            let validated = route.validate(index)?;
            if matches!(validated.destinations, DestinationsSpec::MetadataCache { .. })
                && metadata.is_none()
            {
                return Err(ConfigError::ValidationError(
                    "destinations 'metadata-cache' requires a [metadata_cache] section"
                        .to_string(),
                ));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )))
            }
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "cluster" => Config {
                metadata_cache: Some(MetadataCacheConfig {
                    bootstrap_server_addresses: vec![
                        "mysql://10.0.1.10:3306".to_string(),
                        "mysql://10.0.1.11:3306".to_string(),
                    ],
                    user: "proxy_metadata".to_string(),
                    ttl: Some(DEFAULT_METADATA_TTL),
                    metadata_cluster: "mycluster".to_string(),
                    connect_timeout: None,
                    ssl_mode: None,
                    tls_version: None,
                    ssl_cipher: None,
                    ssl_ca: None,
                    ssl_capath: None,
                    ssl_crl: None,
                    ssl_crlpath: None,
                }),
                routing: vec![
                    RoutingConfig {
                        name: Some("cluster_rw".to_string()),
                        bind_port: Some(6446),
                        destinations: Some(
                            "metadata-cache://mycluster/default?role=PRIMARY".to_string(),
                        ),
                        mode: Some("read-write".to_string()),
                        ..Default::default()
                    },
                    RoutingConfig {
                        name: Some("cluster_ro".to_string()),
                        bind_port: Some(6447),
                        destinations: Some(
                            "metadata-cache://mycluster/default?role=SECONDARY".to_string(),
                        ),
                        mode: Some("read-only".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            "static" => Config {
                routing: vec![RoutingConfig {
                    name: Some("static_rw".to_string()),
                    bind_port: Some(7001),
                    destinations: Some(
                        "10.0.1.20:3306,10.0.1.21:3306,10.0.1.22:3306".to_string(),
                    ),
                    mode: Some("read-write".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'cluster' or 'static'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

impl MetadataCacheConfig {
    pub fn validate(&self) -> Result<ValidatedMetadata, ConfigError> {
        const SECTION: &str = "metadata_cache";

        if self.user.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "option user in [{SECTION}] is required"
            )));
        }
        if self.metadata_cluster.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "option metadata_cluster in [{SECTION}] is required"
            )));
        }
        if self.bootstrap_server_addresses.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "option bootstrap_server_addresses in [{SECTION}] is required"
            )));
        }

        let mut bootstrap_servers = Vec::new();
        for address in &self.bootstrap_server_addresses {
            let bare = address
                .strip_prefix("mysql://")
                .unwrap_or(address.as_str());
            let (host, port) = split_addr_port(bare).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "option bootstrap_server_addresses in [{SECTION}] is incorrect ({e})"
                ))
            })?;
            let port = if port == 0 { DEFAULT_METADATA_PORT } else { port };
            bootstrap_servers.push(TcpAddress::new(host, port));
        }

        let ttl = self.ttl.unwrap_or(DEFAULT_METADATA_TTL);
        if ttl > u64::from(u32::MAX) {
            return Err(range_error("ttl", SECTION, 0u64, u32::MAX, ttl));
        }

        let connect_timeout = self
            .connect_timeout
            .unwrap_or(DEFAULT_METADATA_CONNECT_TIMEOUT);
        if !(1..=65535).contains(&connect_timeout) {
            return Err(range_error(
                "connect_timeout",
                SECTION,
                1,
                65535,
                connect_timeout,
            ));
        }

        let mode = match &self.ssl_mode {
            Some(value) => SslMode::parse(value)?,
            None => SslMode::default(),
        };
        let ssl = SslConfig {
            mode,
            tls_version: self.tls_version.clone(),
            cipher: self.ssl_cipher.clone(),
            ca: self.ssl_ca.clone(),
            capath: self.ssl_capath.clone(),
            crl: self.ssl_crl.clone(),
            crlpath: self.ssl_crlpath.clone(),
        };

        Ok(ValidatedMetadata {
            bootstrap_servers,
            user: self.user.clone(),
            ttl: Duration::from_secs(ttl),
            cluster_name: self.metadata_cluster.clone(),
            connect_timeout: Duration::from_secs(connect_timeout),
            ssl,
        })
    }
}

impl RoutingConfig {
    pub fn validate(&self, index: usize) -> Result<ValidatedRoute, ConfigError> {
        const SECTION: &str = "routing";

        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("routing:{index}"));

        let protocol = match &self.protocol {
            Some(value) => ProtocolKind::parse(value).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "option protocol in [{SECTION}] is invalid; valid are classic, x \
                     (was '{value}')"
                ))
            })?,
            None => ProtocolKind::Classic,
        };

        let mode = match &self.mode {
            Some(value) => AccessMode::parse(value).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "option mode in [{SECTION}] is invalid; valid are {} (was '{value}')",
                    AccessMode::valid_names()
                ))
            })?,
            None => {
                return Err(ConfigError::ValidationError(format!(
                    "option mode in [{SECTION}] needs to be specified; valid are {}",
                    AccessMode::valid_names()
                )))
            }
        };

        let destinations_value = self.destinations.as_ref().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "option destinations in [{SECTION}] is required"
            ))
        })?;
        let destinations = parse_destinations(destinations_value, protocol)?;
        if mode == AccessMode::ReadWriteRing
            && matches!(destinations, DestinationsSpec::MetadataCache { .. })
        {
            return Err(ConfigError::ValidationError(format!(
                "option mode in [{SECTION}]: read-write-ring is not supported with \
                 metadata-cache destinations"
            )));
        }

        let bind_port = match self.bind_port {
            Some(port) => Some(check_range_i64("bind_port", SECTION, port, 1, 65535)? as u16),
            None => None,
        };
        let bind_host = self
            .bind_address
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let (bind_host, host_port) = split_addr_port(&bind_host).map_err(|e| {
            ConfigError::ValidationError(format!(
                "option bind_address in [{SECTION}] is incorrect ({e})"
            ))
        })?;
        let effective_port = if host_port != 0 { Some(host_port) } else { bind_port };

        let bind_address = effective_port.map(|port| TcpAddress::new(bind_host, port));
        #[cfg(unix)]
        let bind_socket = self.socket.clone();
        #[cfg(not(unix))]
        if self.socket.is_some() {
            return Err(ConfigError::ValidationError(format!(
                "option socket in [{SECTION}] is not supported on this platform"
            )));
        }
        if bind_address.is_none() && self.socket.is_none() {
            return Err(ConfigError::ValidationError(
                "either bind_address or socket option needs to be supplied, or both"
                    .to_string(),
            ));
        }

        let connect_timeout = check_range_i64(
            "connect_timeout",
            SECTION,
            self.connect_timeout
                .unwrap_or(i64::from(DEFAULT_DESTINATION_CONNECT_TIMEOUT)),
            1,
            65535,
        )?;
        let max_connections = check_range_i64(
            "max_connections",
            SECTION,
            self.max_connections
                .unwrap_or(i64::from(DEFAULT_MAX_CONNECTIONS)),
            1,
            65535,
        )?;
        let max_connect_errors = self
            .max_connect_errors
            .unwrap_or(DEFAULT_MAX_CONNECT_ERRORS);
        if max_connect_errors == 0 {
            return Err(range_error(
                "max_connect_errors",
                SECTION,
                1u64,
                u64::MAX,
                max_connect_errors,
            ));
        }
        let max_connect_errors_timeout = self
            .max_connect_errors_timeout
            .unwrap_or(DEFAULT_MAX_CONNECT_ERRORS_TIMEOUT);
        let client_connect_timeout = check_range_i64(
            "client_connect_timeout",
            SECTION,
            self.client_connect_timeout
                .unwrap_or(i64::from(DEFAULT_CLIENT_CONNECT_TIMEOUT)),
            2,
            31_536_000,
        )?;
        let net_buffer_length = check_range_i64(
            "net_buffer_length",
            SECTION,
            self.net_buffer_length
                .unwrap_or(i64::from(DEFAULT_NET_BUFFER_LENGTH)),
            1024,
            1_048_576,
        )?;

        Ok(ValidatedRoute {
            settings: RouteSettings {
                name,
                bind_address,
                #[cfg(unix)]
                bind_socket,
                max_connections: max_connections as usize,
                destination_connect_timeout: Duration::from_secs(connect_timeout as u64),
                client_connect_timeout: Duration::from_secs(client_connect_timeout as u64),
                max_connect_errors,
                max_connect_errors_timeout,
                net_buffer_length: net_buffer_length as usize,
            },
            mode,
            protocol,
            destinations,
        })
    }
}

/// Parse the `destinations` option: a `metadata-cache://` URI or a comma
/// separated address list.
fn parse_destinations(
    value: &str,
    protocol: ProtocolKind,
) -> Result<DestinationsSpec, ConfigError> {
    const SECTION: &str = "routing";

    if let Some((scheme, rest)) = value.split_once("://") {
        if scheme != "metadata-cache" {
            return Err(ConfigError::ValidationError(format!(
                "option destinations in [{SECTION}] has an invalid URI scheme '{scheme}' \
                 for URI {value}"
            )));
        }

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        // metadata-cache://<instance>/<replicaset>?role=...
        let mut segments = path.split('/');
        let _instance = segments.next().unwrap_or_default();
        let replicaset = match segments.next() {
            Some(segment) if !segment.is_empty() => segment.to_string(),
            _ => "default".to_string(),
        };

        let mut role = None;
        let mut allow_primary_reads = false;
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, v) = pair.split_once('=').unwrap_or((pair, ""));
                match key {
                    "role" => {
                        role = Some(match v {
                            "PRIMARY" => RoutingPurpose::ReadWrite,
                            "SECONDARY" => RoutingPurpose::ReadOnly,
                            other => {
                                return Err(ConfigError::ValidationError(format!(
                                    "invalid role '{other}' in routing destination \
                                     specification; valid are PRIMARY, SECONDARY"
                                )))
                            }
                        });
                    }
                    "allow_primary_reads" => {
                        allow_primary_reads = v.eq_ignore_ascii_case("yes");
                    }
                    _ => {}
                }
            }
        }

        let role = role.ok_or_else(|| {
            ConfigError::ValidationError(
                "Missing 'role' in routing destination specification".to_string(),
            )
        })?;

        return Ok(DestinationsSpec::MetadataCache {
            replicaset,
            role,
            allow_primary_reads,
        });
    }

    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.starts_with(',') || trimmed.ends_with(',') {
        return Err(ConfigError::ValidationError(format!(
            "option destinations in [{SECTION}]: empty address found in destination list \
             (was '{value}')"
        )));
    }

    let mut addresses = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "option destinations in [{SECTION}]: empty address found in destination \
                 list (was '{value}')"
            )));
        }
        let (host, port) = split_addr_port(part).map_err(|e| {
            ConfigError::ValidationError(format!(
                "option destinations in [{SECTION}]: address in destination list '{part}' \
                 is invalid: {e}"
            ))
        })?;
        let port = if port == 0 { protocol.default_port() } else { port };
        addresses.push(TcpAddress::new(host, port));
    }

    Ok(DestinationsSpec::Static(addresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn static_route() -> RoutingConfig {
        RoutingConfig {
            bind_port: Some(7001),
            destinations: Some("127.0.0.1:3306,127.0.0.1:3307".to_string()),
            mode: Some("read-write".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_route_gets_defaults() {
        let route = static_route().validate(0).unwrap();
        assert_eq!(route.settings.name, "routing:0");
        assert_eq!(
            route.settings.bind_address,
            Some(TcpAddress::new("0.0.0.0", 7001))
        );
        assert_eq!(route.settings.max_connections, 512);
        assert_eq!(
            route.settings.destination_connect_timeout,
            Duration::from_secs(1)
        );
        assert_eq!(
            route.settings.client_connect_timeout,
            Duration::from_secs(9)
        );
        assert_eq!(route.settings.max_connect_errors, 100);
        assert_eq!(route.settings.max_connect_errors_timeout, 600);
        assert_eq!(route.settings.net_buffer_length, 16384);
        assert_eq!(route.protocol, ProtocolKind::Classic);
        assert_eq!(route.mode, AccessMode::ReadWrite);
    }

    #[test]
    fn test_connect_timeout_zero_rejected() {
        let mut config = static_route();
        config.connect_timeout = Some(0);
        let err = config.validate(0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option connect_timeout in [routing] needs value between 1 and 65535 \
             inclusive, was '0'"
        );
    }

    #[test]
    fn test_out_of_range_options_rejected() {
        let mut config = static_route();
        config.bind_port = Some(99999);
        assert_eq!(
            config.validate(0).unwrap_err().to_string(),
            "option bind_port in [routing] needs value between 1 and 65535 inclusive, \
             was '99999'"
        );

        let mut config = static_route();
        config.net_buffer_length = Some(512);
        assert_eq!(
            config.validate(0).unwrap_err().to_string(),
            "option net_buffer_length in [routing] needs value between 1024 and 1048576 \
             inclusive, was '512'"
        );

        let mut config = static_route();
        config.client_connect_timeout = Some(1);
        assert_eq!(
            config.validate(0).unwrap_err().to_string(),
            "option client_connect_timeout in [routing] needs value between 2 and \
             31536000 inclusive, was '1'"
        );
    }

    #[test]
    fn test_mode_is_required_and_validated() {
        let mut config = static_route();
        config.mode = None;
        assert!(config
            .validate(0)
            .unwrap_err()
            .to_string()
            .contains("needs to be specified"));

        let mut config = static_route();
        config.mode = Some("read-mostly".to_string());
        let message = config.validate(0).unwrap_err().to_string();
        assert!(message.contains("is invalid"));
        assert!(message.contains("read-mostly"));
    }

    #[test]
    fn test_destinations_csv_default_port_per_protocol() {
        let mut config = static_route();
        config.destinations = Some("db1,db2:6447".to_string());
        let route = config.validate(0).unwrap();
        assert_eq!(
            route.destinations,
            DestinationsSpec::Static(vec![
                TcpAddress::new("db1", 3306),
                TcpAddress::new("db2", 6447),
            ])
        );

        let mut config = static_route();
        config.destinations = Some("db1".to_string());
        config.protocol = Some("x".to_string());
        let route = config.validate(0).unwrap();
        assert_eq!(
            route.destinations,
            DestinationsSpec::Static(vec![TcpAddress::new("db1", 33060)])
        );
    }

    #[test]
    fn test_destinations_empty_member_rejected() {
        for bad in ["a:3306,,b:3306", ",a:3306", "a:3306,"] {
            let mut config = static_route();
            config.destinations = Some(bad.to_string());
            assert!(config
                .validate(0)
                .unwrap_err()
                .to_string()
                .contains("empty address found in destination list"));
        }
    }

    #[test]
    fn test_destinations_metadata_cache_uri() {
        let mut config = static_route();
        config.destinations =
            Some("metadata-cache://mycluster/default?role=PRIMARY".to_string());
        let route = config.validate(0).unwrap();
        assert_eq!(
            route.destinations,
            DestinationsSpec::MetadataCache {
                replicaset: "default".to_string(),
                role: RoutingPurpose::ReadWrite,
                allow_primary_reads: false,
            }
        );

        let mut config = static_route();
        config.mode = Some("read-only".to_string());
        config.destinations = Some(
            "metadata-cache://mycluster/rs1?role=SECONDARY&allow_primary_reads=yes"
                .to_string(),
        );
        let route = config.validate(0).unwrap();
        assert_eq!(
            route.destinations,
            DestinationsSpec::MetadataCache {
                replicaset: "rs1".to_string(),
                role: RoutingPurpose::ReadOnly,
                allow_primary_reads: true,
            }
        );
    }

    #[test]
    fn test_destinations_uri_requires_role() {
        let mut config = static_route();
        config.destinations = Some("metadata-cache://mycluster/default".to_string());
        assert_eq!(
            config.validate(0).unwrap_err().to_string(),
            "Missing 'role' in routing destination specification"
        );
    }

    #[test]
    fn test_destinations_rejects_other_schemes() {
        let mut config = static_route();
        config.destinations = Some("mailto://foo@example.org?role=PRIMARY".to_string());
        assert!(config
            .validate(0)
            .unwrap_err()
            .to_string()
            .contains("invalid URI scheme 'mailto'"));
    }

    #[test]
    fn test_bind_address_with_inline_port() {
        let mut config = static_route();
        config.bind_address = Some("127.0.0.1:7777".to_string());
        config.bind_port = None;
        let route = config.validate(0).unwrap();
        assert_eq!(
            route.settings.bind_address,
            Some(TcpAddress::new("127.0.0.1", 7777))
        );
    }

    #[test]
    fn test_bind_or_socket_required() {
        let mut config = static_route();
        config.bind_port = None;
        assert_eq!(
            config.validate(0).unwrap_err().to_string(),
            "either bind_address or socket option needs to be supplied, or both"
        );
    }

    #[test]
    fn test_bootstrap_impossible_port_rejected() {
        let metadata = MetadataCacheConfig {
            bootstrap_server_addresses: vec!["mysql://host:99999".to_string()],
            user: "admin".to_string(),
            ttl: None,
            metadata_cluster: "mycluster".to_string(),
            connect_timeout: None,
            ssl_mode: None,
            tls_version: None,
            ssl_cipher: None,
            ssl_ca: None,
            ssl_capath: None,
            ssl_crl: None,
            ssl_crlpath: None,
        };
        let message = metadata.validate().unwrap_err().to_string();
        assert!(message.contains("bootstrap_server_addresses"));
        assert!(message.contains("impossible port number"));
    }

    #[test]
    fn test_bootstrap_default_port() {
        let metadata = MetadataCacheConfig {
            bootstrap_server_addresses: vec!["mysql://host".to_string(), "other".to_string()],
            user: "admin".to_string(),
            ttl: Some(10),
            metadata_cluster: "mycluster".to_string(),
            connect_timeout: None,
            ssl_mode: None,
            tls_version: None,
            ssl_cipher: None,
            ssl_ca: None,
            ssl_capath: None,
            ssl_crl: None,
            ssl_crlpath: None,
        };
        let validated = metadata.validate().unwrap();
        assert_eq!(
            validated.bootstrap_servers,
            vec![TcpAddress::new("host", 3306), TcpAddress::new("other", 3306)]
        );
        assert_eq!(validated.ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_ssl_mode_rejected() {
        let metadata = MetadataCacheConfig {
            bootstrap_server_addresses: vec!["host".to_string()],
            user: "admin".to_string(),
            ttl: None,
            metadata_cluster: "mycluster".to_string(),
            connect_timeout: None,
            ssl_mode: Some("sometimes".to_string()),
            tls_version: None,
            ssl_cipher: None,
            ssl_ca: None,
            ssl_capath: None,
            ssl_crl: None,
            ssl_crlpath: None,
        };
        assert!(metadata
            .validate()
            .unwrap_err()
            .to_string()
            .contains("ssl_mode=sometimes"));
    }

    #[test]
    fn test_metadata_cache_destinations_require_section() {
        let config = Config {
            routing: vec![RoutingConfig {
                bind_port: Some(6446),
                destinations: Some(
                    "metadata-cache://mycluster/default?role=PRIMARY".to_string(),
                ),
                mode: Some("read-write".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("requires a [metadata_cache] section"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_text = r#"
[metadata_cache]
bootstrap_server_addresses = ["mysql://127.0.0.1:3306"]
user = "proxy_metadata"
ttl = 10
metadata_cluster = "mycluster"

[[routing]]
name = "cluster_rw"
bind_port = 6446
destinations = "metadata-cache://mycluster/default?role=PRIMARY"
mode = "read-write"

[[routing]]
name = "cluster_ro"
bind_address = "0.0.0.0"
bind_port = 6447
destinations = "metadata-cache://mycluster/default?role=SECONDARY"
mode = "read-only"
max_connections = 128

[logging]
level = "debug"
"#;
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), toml_text).unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.routing.len(), 2);
        let ro = config.routing[1].validate(1).unwrap();
        assert_eq!(ro.settings.name, "cluster_ro");
        assert_eq!(ro.settings.max_connections, 128);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_example_configs_validate() {
        for mode in ["cluster", "static"] {
            let file = NamedTempFile::new().unwrap();
            Config::create_example_config(file.path(), mode).unwrap();
            let config = Config::load_from_file(file.path()).unwrap();
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_ring_mode_needs_static_destinations() {
        let mut config = static_route();
        config.mode = Some("read-write-ring".to_string());
        assert!(config.validate(0).is_ok());

        config.destinations =
            Some("metadata-cache://mycluster/default?role=PRIMARY".to_string());
        assert!(config
            .validate(0)
            .unwrap_err()
            .to_string()
            .contains("read-write-ring"));
    }
}
