//! Connection configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{capabilities, collations};

/// SSL negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never use TLS
    #[default]
    Disabled,
    /// Use TLS when the server advertises it, plain otherwise
    Preferred,
    /// Fail the connection when TLS is unavailable
    Required,
    /// Require TLS and verify the server certificate against a CA
    VerifyCa,
    /// Require TLS, verify the certificate and the hostname
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try(self) -> bool {
        !matches!(self, SslMode::Disabled)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    pub const fn verifies_certificate(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyIdentity)
    }
}

/// What to do when a temporal column decodes to the all-zero date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroDate {
    /// Fail the field decode
    #[default]
    Exception,
    /// Produce NULL
    UseNull,
    /// Round to 0001-01-01
    UseRound,
}

/// TLS material paths and overrides.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle used for `VerifyCa`/`VerifyIdentity`
    pub ca_cert_path: Option<PathBuf>,
    /// SNI name override (defaults to the connect host)
    pub server_name: Option<String>,
    /// Accept any server certificate. Testing only.
    pub danger_skip_verify: bool,
}

/// MySQL connection configuration, builder style.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Initial schema, selected during the handshake when set
    pub database: Option<String>,
    /// Collation id sent in the handshake response (also fixes the charset)
    pub collation: u8,
    pub connect_timeout: Duration,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Opt in to semicolon-joined multi-statement batches
    pub multi_statements: bool,
    pub zero_date: ZeroDate,
    /// Key/value pairs advertised via CONNECT_ATTRS
    pub attributes: HashMap<String, String>,
    /// Max-packet-size field of the handshake response
    pub max_packet_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            collation: collations::DEFAULT,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            multi_statements: false,
            zero_date: ZeroDate::default(),
            attributes: HashMap::new(),
            max_packet_size: 16_777_216,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn collation(mut self, collation: u8) -> Self {
        self.collation = collation;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    pub fn multi_statements(mut self, enabled: bool) -> Self {
        self.multi_statements = enabled;
        self
    }

    pub fn zero_date(mut self, behavior: ZeroDate) -> Self {
        self.zero_date = behavior;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Capabilities this client asks for; the handshake intersects them
    /// with the server's advertised set. `LOCAL_FILES` is never requested.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::PROTOCOL_41
            | capabilities::SECURE_CONNECTION
            | capabilities::LONG_PASSWORD
            | capabilities::TRANSACTIONS
            | capabilities::PLUGIN_AUTH
            | capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA
            | capabilities::DEPRECATE_EOF;

        if self.database.as_deref().is_some_and(|db| !db.is_empty()) {
            flags |= capabilities::CONNECT_WITH_DB;
        }

        if self.multi_statements {
            flags |= capabilities::MULTI_STATEMENTS | capabilities::MULTI_RESULTS;
        }

        // PREFERRED only upgrades when trust material is configured; a
        // bare PREFERRED connection stays in cleartext.
        if self.ssl_mode.is_required()
            || (self.ssl_mode == SslMode::Preferred && self.tls.ca_cert_path.is_some())
        {
            flags |= capabilities::SSL;
        }

        if !self.attributes.is_empty() {
            flags |= capabilities::CONNECT_ATTRS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = Config::new()
            .host("db.example.com")
            .port(3307)
            .user("app")
            .password("secret")
            .database("inventory")
            .connect_timeout(Duration::from_secs(5))
            .ssl_mode(SslMode::Required)
            .multi_statements(true)
            .zero_date(ZeroDate::UseNull)
            .attribute("program_name", "myflux");

        assert_eq!(config.socket_addr(), "db.example.com:3307");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.zero_date, ZeroDate::UseNull);
    }

    #[test]
    fn capability_flags_reflect_options() {
        let base = Config::new().capability_flags();
        assert!(base & capabilities::PROTOCOL_41 != 0);
        assert!(base & capabilities::SECURE_CONNECTION != 0);
        assert!(base & capabilities::DEPRECATE_EOF != 0);
        assert!(base & capabilities::CONNECT_WITH_DB == 0);
        assert!(base & capabilities::MULTI_STATEMENTS == 0);
        assert!(base & capabilities::SSL == 0);
        assert!(base & capabilities::LOCAL_FILES == 0);

        let with_db = Config::new().database("d").capability_flags();
        assert!(with_db & capabilities::CONNECT_WITH_DB != 0);

        let empty_db = Config::new().database("").capability_flags();
        assert!(empty_db & capabilities::CONNECT_WITH_DB == 0);

        let multi = Config::new().multi_statements(true).capability_flags();
        assert!(multi & capabilities::MULTI_STATEMENTS != 0);

        // PREFERRED without trust material stays plain; with a CA or a
        // required mode the SSL capability is requested.
        let preferred = Config::new().ssl_mode(SslMode::Preferred).capability_flags();
        assert!(preferred & capabilities::SSL == 0);

        let preferred_ca = Config::new()
            .ssl_mode(SslMode::Preferred)
            .ca_cert("/etc/ssl/ca.pem")
            .capability_flags();
        assert!(preferred_ca & capabilities::SSL != 0);

        let required = Config::new().ssl_mode(SslMode::Required).capability_flags();
        assert!(required & capabilities::SSL != 0);

        let attrs = Config::new().attribute("k", "v").capability_flags();
        assert!(attrs & capabilities::CONNECT_ATTRS != 0);
    }

    #[test]
    fn ssl_mode_predicates() {
        assert!(!SslMode::Disabled.should_try());
        assert!(SslMode::Preferred.should_try());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::Required.is_required());
        assert!(SslMode::VerifyCa.verifies_certificate());
        assert!(SslMode::VerifyIdentity.verifies_certificate());
    }
}
