/// Synchronous request/response client for the metadata and status queries
///
/// The session is a thin RPC facade: no retry logic, owned exclusively by
/// its caller. It is a trait so the fetcher can be exercised against a
/// scripted replayer instead of a live server.
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, SslOpts, Value};

use crate::error::ConfigError;

/// One result row; columns are nullable strings in wire order.
pub type Row = Vec<Option<String>>;

/// What the row consumer wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Continue,
    Stop,
}

/// Error from a session operation, carrying the server error code when one
/// exists.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code})")]
pub struct SessionError {
    pub code: u32,
    pub message: String,
}

impl SessionError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// TLS requirements towards metadata servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disabled,
    #[default]
    Preferred,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl SslMode {
    /// Parse the configuration value; unknown modes are a validation error.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "disabled" => Ok(SslMode::Disabled),
            "preferred" => Ok(SslMode::Preferred),
            "required" => Ok(SslMode::Required),
            "verify_ca" => Ok(SslMode::VerifyCa),
            "verify_identity" => Ok(SslMode::VerifyIdentity),
            other => Err(ConfigError::ValidationError(format!(
                "invalid configuration item 'ssl_mode={other}'"
            ))),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SslMode::Disabled => "DISABLED",
            SslMode::Preferred => "PREFERRED",
            SslMode::Required => "REQUIRED",
            SslMode::VerifyCa => "VERIFY_CA",
            SslMode::VerifyIdentity => "VERIFY_IDENTITY",
        };
        f.write_str(name)
    }
}

/// TLS options for metadata sessions.
#[derive(Debug, Clone, Default)]
pub struct SslConfig {
    pub mode: SslMode,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub ca: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub crl: Option<PathBuf>,
    pub crlpath: Option<PathBuf>,
}

/// The session surface the fetcher consumes.
pub trait MetadataSession: Send {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(), SessionError>;

    /// Run `sql`, invoking `consumer` once per row in receipt order.
    /// Returning [`RowAction::Stop`] closes the cursor.
    fn query(
        &mut self,
        sql: &str,
        consumer: &mut dyn FnMut(&Row) -> RowAction,
    ) -> Result<(), SessionError>;

    /// Quote a string value for inclusion in a statement.
    fn quote(&self, value: &str) -> String {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('\'');
        for c in value.chars() {
            match c {
                '\'' => quoted.push_str("\\'"),
                '"' => quoted.push_str("\\\""),
                '\\' => quoted.push_str("\\\\"),
                '\n' => quoted.push_str("\\n"),
                '\r' => quoted.push_str("\\r"),
                '\0' => quoted.push_str("\\0"),
                '\x1a' => quoted.push_str("\\Z"),
                c => quoted.push(c),
            }
        }
        quoted.push('\'');
        quoted
    }

    fn is_connected(&self) -> bool;

    /// `host:port` of the connected server, used to share the bootstrap
    /// connection when reconciling its own replicaset.
    fn address(&self) -> Option<&str>;

    fn last_error(&self) -> Option<&SessionError>;
}

/// Creates fresh sessions; injected so tests can substitute a replayer.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Box<dyn MetadataSession>;
}

/// Production session backed by the blocking MySQL client.
pub struct MySqlSession {
    ssl: SslConfig,
    conn: Option<Conn>,
    address: Option<String>,
    last_error: Option<SessionError>,
}

impl MySqlSession {
    pub fn new(ssl: SslConfig) -> Self {
        Self {
            ssl,
            conn: None,
            address: None,
            last_error: None,
        }
    }

    // The client library cannot downgrade mid-handshake, so `Preferred`
    // behaves like `Disabled` here and the verifying modes map onto the
    // certificate options the library exposes.
    fn ssl_opts(&self) -> Option<SslOpts> {
        match self.ssl.mode {
            SslMode::Disabled | SslMode::Preferred => None,
            SslMode::Required => Some(
                SslOpts::default()
                    .with_danger_accept_invalid_certs(true)
                    .with_danger_skip_domain_validation(true),
            ),
            SslMode::VerifyCa => Some(
                SslOpts::default()
                    .with_root_cert_path(self.ssl.ca.clone())
                    .with_danger_skip_domain_validation(true),
            ),
            SslMode::VerifyIdentity => {
                Some(SslOpts::default().with_root_cert_path(self.ssl.ca.clone()))
            }
        }
    }

    fn record_error(&mut self, error: &mysql::Error) -> SessionError {
        let session_error = classify_error(error);
        self.last_error = Some(session_error.clone());
        session_error
    }
}

fn classify_error(error: &mysql::Error) -> SessionError {
    match error {
        mysql::Error::MySqlError(server) => {
            SessionError::new(u32::from(server.code), server.message.clone())
        }
        other => SessionError::new(2003, other.to_string()),
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        other => Some(other.as_sql(true)),
    }
}

impl MetadataSession for MySqlSession {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password))
            .tcp_connect_timeout(Some(timeout))
            .prefer_socket(false)
            .ssl_opts(self.ssl_opts());

        match Conn::new(opts) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.address = Some(format!("{host}:{port}"));
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                let err = self.record_error(&e);
                self.conn = None;
                self.address = None;
                Err(err)
            }
        }
    }

    fn query(
        &mut self,
        sql: &str,
        consumer: &mut dyn FnMut(&Row) -> RowAction,
    ) -> Result<(), SessionError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SessionError::new(2006, "not connected"));
        };

        let outcome = match conn.query_iter(sql) {
            Ok(mut result) => {
                loop {
                    match result.next() {
                        None => break,
                        Some(Ok(row)) => {
                            let values: Row =
                                row.unwrap().into_iter().map(value_to_string).collect();
                            if consumer(&values) == RowAction::Stop {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            drop(result);
                            let session_error = classify_error(&e);
                            self.last_error = Some(session_error.clone());
                            return Err(session_error);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                let session_error = classify_error(&e);
                self.last_error = Some(session_error.clone());
                Err(session_error)
            }
        };
        outcome
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }
}

/// Factory for production sessions.
pub struct MySqlSessionFactory {
    ssl: SslConfig,
}

impl MySqlSessionFactory {
    pub fn new(ssl: SslConfig) -> Self {
        Self { ssl }
    }
}

impl SessionFactory for MySqlSessionFactory {
    fn create(&self) -> Box<dyn MetadataSession> {
        Box::new(MySqlSession::new(self.ssl.clone()))
    }
}

/// Scripted session for tests: expected queries paired with canned result
/// sets, shared by every session the factory hands out.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    pub enum Reply {
        Rows(Vec<Row>),
        Error(u32, String),
    }

    pub struct Expectation {
        pub query_prefix: String,
        pub reply: Reply,
    }

    #[derive(Clone, Default)]
    pub struct ReplayScript {
        expectations: Arc<Mutex<VecDeque<Expectation>>>,
        refuse_hosts: Arc<Mutex<HashSet<String>>>,
    }

    impl ReplayScript {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect_query(&self, query_prefix: &str, rows: Vec<Row>) {
            self.expectations.lock().unwrap().push_back(Expectation {
                query_prefix: query_prefix.to_string(),
                reply: Reply::Rows(rows),
            });
        }

        pub fn expect_query_error(&self, query_prefix: &str, code: u32, message: &str) {
            self.expectations.lock().unwrap().push_back(Expectation {
                query_prefix: query_prefix.to_string(),
                reply: Reply::Error(code, message.to_string()),
            });
        }

        /// Simulate a host that refuses session connects.
        pub fn refuse_connect_to(&self, endpoint: &str) {
            self.refuse_hosts
                .lock()
                .unwrap()
                .insert(endpoint.to_string());
        }

        pub fn all_consumed(&self) -> bool {
            self.expectations.lock().unwrap().is_empty()
        }
    }

    pub struct ReplaySession {
        script: ReplayScript,
        address: Option<String>,
        last_error: Option<SessionError>,
    }

    impl MetadataSession for ReplaySession {
        fn connect(
            &mut self,
            host: &str,
            port: u16,
            _user: &str,
            _password: &str,
            _timeout: Duration,
        ) -> Result<(), SessionError> {
            let endpoint = format!("{host}:{port}");
            if self.script.refuse_hosts.lock().unwrap().contains(&endpoint) {
                let err = SessionError::new(2003, format!("Can't connect to {endpoint}"));
                self.last_error = Some(err.clone());
                return Err(err);
            }
            self.address = Some(endpoint);
            Ok(())
        }

        fn query(
            &mut self,
            sql: &str,
            consumer: &mut dyn FnMut(&Row) -> RowAction,
        ) -> Result<(), SessionError> {
            let expectation = self
                .script
                .expectations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected query: {sql}"));
            assert!(
                sql.starts_with(&expectation.query_prefix),
                "query mismatch:\n  expected prefix: {}\n  got: {sql}",
                expectation.query_prefix
            );
            match expectation.reply {
                Reply::Rows(rows) => {
                    for row in &rows {
                        if consumer(row) == RowAction::Stop {
                            break;
                        }
                    }
                    Ok(())
                }
                Reply::Error(code, message) => {
                    let err = SessionError::new(code, message);
                    self.last_error = Some(err.clone());
                    Err(err)
                }
            }
        }

        fn is_connected(&self) -> bool {
            self.address.is_some()
        }

        fn address(&self) -> Option<&str> {
            self.address.as_deref()
        }

        fn last_error(&self) -> Option<&SessionError> {
            self.last_error.as_ref()
        }
    }

    pub struct ReplayFactory {
        pub script: ReplayScript,
    }

    impl ReplayFactory {
        pub fn new(script: ReplayScript) -> Self {
            Self { script }
        }
    }

    impl SessionFactory for ReplayFactory {
        fn create(&self) -> Box<dyn MetadataSession> {
            Box::new(ReplaySession {
                script: self.script.clone(),
                address: None,
                last_error: None,
            })
        }
    }

    /// Helper to build a nullable-string row from literals.
    pub fn row(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("preferred").unwrap(), SslMode::Preferred);
        assert_eq!(SslMode::parse("DISABLED").unwrap(), SslMode::Disabled);
        assert_eq!(
            SslMode::parse("verify_identity").unwrap(),
            SslMode::VerifyIdentity
        );
        assert!(SslMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_default_ssl_mode_is_preferred() {
        assert_eq!(SslConfig::default().mode, SslMode::Preferred);
    }

    #[test]
    fn test_quote_escapes_metacharacters() {
        let session = MySqlSession::new(SslConfig::default());
        assert_eq!(session.quote("plain"), "'plain'");
        assert_eq!(session.quote("it's"), "'it\\'s'");
        assert_eq!(session.quote("a\\b"), "'a\\\\b'");
        assert_eq!(session.quote("line\nbreak"), "'line\\nbreak'");
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(Value::NULL), None);
        assert_eq!(
            value_to_string(Value::Bytes(b"abc".to_vec())),
            Some("abc".to_string())
        );
        assert_eq!(value_to_string(Value::Int(-7)), Some("-7".to_string()));
        assert_eq!(value_to_string(Value::UInt(42)), Some("42".to_string()));
    }

    #[test]
    fn test_query_without_connection_fails() {
        let mut session = MySqlSession::new(SslConfig::default());
        let result = session.query("SELECT 1", &mut |_| RowAction::Continue);
        assert!(result.is_err());
        assert!(!session.is_connected());
    }
}
