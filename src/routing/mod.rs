/// Routing: destination selection, admission and the per-connection splice
pub mod blocklist;
pub mod dest_metadata;
pub mod destination;
pub mod protocol;
pub mod router;

use std::fmt;

/// How long an idle client may keep its connection; enforced by the
/// backend's own wait timeout, not by the proxy.
pub const DEFAULT_WAIT_TIMEOUT: u64 = 0;
/// Max number of active routes per routing instance.
pub const DEFAULT_MAX_CONNECTIONS: u16 = 512;
/// Seconds to wait when connecting to a destination.
pub const DEFAULT_DESTINATION_CONNECT_TIMEOUT: u16 = 1;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
/// Matches the server's default net_buffer_length.
pub const DEFAULT_NET_BUFFER_LENGTH: u32 = 16384;
/// Connect or handshake errors after which a client host is blocked.
pub const DEFAULT_MAX_CONNECT_ERRORS: u64 = 100;
/// 0 disables resetting the per-host error counter.
pub const DEFAULT_MAX_CONNECT_ERRORS_TIMEOUT: u64 = 600;
/// Seconds the proxy waits for the handshake exchange; server default
/// connect_timeout minus one.
pub const DEFAULT_CLIENT_CONNECT_TIMEOUT: u32 = 9;
pub const LISTEN_BACKLOG: u32 = 1024;

/// Routing mode of one routing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    ReadWriteRing,
}

impl AccessMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read-write" => Some(AccessMode::ReadWrite),
            "read-only" => Some(AccessMode::ReadOnly),
            "read-write-ring" => Some(AccessMode::ReadWriteRing),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "read-write",
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWriteRing => "read-write-ring",
        }
    }

    pub fn valid_names() -> &'static str {
        "read-write, read-only, read-write-ring"
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_parse() {
        assert_eq!(AccessMode::parse("read-write"), Some(AccessMode::ReadWrite));
        assert_eq!(AccessMode::parse("read-only"), Some(AccessMode::ReadOnly));
        assert_eq!(
            AccessMode::parse("read-write-ring"),
            Some(AccessMode::ReadWriteRing)
        );
        assert_eq!(AccessMode::parse("read-mostly"), None);
    }

    #[test]
    fn test_access_mode_round_trip() {
        for mode in [
            AccessMode::ReadWrite,
            AccessMode::ReadOnly,
            AccessMode::ReadWriteRing,
        ] {
            assert_eq!(AccessMode::parse(mode.name()), Some(mode));
        }
    }
}
