//! Per-connection mutable session state.

use crate::auth::AuthPlugin;

/// Parsed server version, tolerant of vendor suffixes.
///
/// `8.0.34`, `5.7.31-log`, `10.6.12-MariaDB-1:10.6.12+maria~ubu2004` all
/// parse; anything unparseable compares as `0.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub fn parse(version: &str) -> Self {
        let mut numbers = version.split(&['.', '-', '+', '~'][..]).map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u16>().ok()
        });

        Self {
            major: numbers.next().unwrap_or(0),
            minor: numbers.next().unwrap_or(0),
            patch: numbers.next().unwrap_or(0),
        }
    }

    pub fn at_least(self, major: u16, minor: u16, patch: u16) -> bool {
        self >= ServerVersion {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Mutable session state for one connection.
///
/// Invariants: negotiated capabilities are a subset of the server's set;
/// the collation id is non-zero during the command phase; credentials and
/// the scramble are cleared once authentication completes.
#[derive(Debug, Default)]
pub struct Session {
    pub connection_id: u32,
    pub server_version: ServerVersion,
    pub server_version_text: String,
    pub server_capabilities: u32,
    /// Negotiated set: client desires intersected with the server's
    pub capabilities: u32,
    pub collation: u8,
    pub status_flags: u16,
    /// Active plugin, `None` after authentication completes
    pub auth_plugin: Option<AuthPlugin>,
    /// Server salt, released after authentication
    pub scramble: Vec<u8>,
    /// Credentials, released after authentication
    pub username: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Session {
    pub fn new(username: String, password: Option<String>, database: Option<String>) -> Self {
        Self {
            username,
            password,
            database,
            ..Self::default()
        }
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn deprecate_eof(&self) -> bool {
        self.has_capability(crate::protocol::capabilities::DEPRECATE_EOF)
    }

    /// Transition into the command phase: wipe credentials, salt and the
    /// plugin reference.
    pub fn finish_authentication(&mut self) {
        self.scramble.clear();
        self.password = None;
        self.auth_plugin = None;
    }
}
