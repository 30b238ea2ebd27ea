//! Error types for the myflux driver.

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Connection lifecycle errors (connect, authenticate, disconnect, TLS)
    Connection(ConnectionError),
    /// Wire-level protocol errors
    Protocol(ProtocolError),
    /// An ERR message received during the command phase
    Server(ServerError),
    /// API misuse detected before anything was sent to the server
    Misuse(String),
    /// A field value could not be converted to the requested shape
    Decode(String),
    /// I/O errors
    Io(std::io::Error),
    /// Connect timeout elapsed
    Timeout,
    /// The exchange was cancelled before it completed
    Cancelled,
}

/// Connection-phase error with a classification kind.
#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the TCP connection
    Connect,
    /// Server refused credentials or the auth policy cannot be satisfied
    Authentication,
    /// Transport ended while the connection was in use
    Disconnected,
    /// TLS negotiation failed or is unavailable
    Ssl,
    /// Connection refused by the peer
    Refused,
}

/// Wire protocol violation.
///
/// All kinds are fatal to the connection except `UnknownHeader` raised in a
/// result phase, which terminates only the current exchange.
#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Protocol version or capability the driver cannot speak
    NotSupported,
    /// A header byte the active decode context cannot interpret
    UnknownHeader,
    /// Expected NUL terminator missing from a C-string field
    TerminateNotFound,
    /// Envelope sequence id did not match the expected value
    SequenceMismatch,
}

/// An ERR message from the server, surfaced to the active exchange.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// MySQL error code (e.g. 1062 for ER_DUP_ENTRY)
    pub code: u16,
    /// Five-character SQL state, empty when the server omitted it
    pub sql_state: String,
    /// Human-readable message in the client collation
    pub message: String,
    /// The SQL that produced the error, when known
    pub sql: Option<String>,
}

impl ServerError {
    /// Unique constraint violation (ER_DUP_ENTRY).
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Foreign key constraint violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl Error {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(p) => p.kind != ProtocolErrorKind::UnknownHeader,
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::Authentication),
            Error::Io(_) | Error::Timeout => true,
            Error::Server(_) | Error::Misuse(_) | Error::Decode(_) | Error::Cancelled => false,
        }
    }

    /// SQL state of the underlying server error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) if !e.sql_state.is_empty() => Some(&e.sql_state),
            _ => None,
        }
    }

    /// Shorthand constructor for protocol violations.
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand constructor for connection-phase failures.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Server(e) => {
                if e.sql_state.is_empty() {
                    write!(f, "Server error {}: {}", e.code, e.message)
                } else {
                    write!(f, "Server error {} ({}): {}", e.code, e.sql_state, e.message)
                }
            }
            Error::Misuse(msg) => write!(f, "Client misuse: {}", msg),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Exchange cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{} [{}]", self.message, self.code)
        } else {
            write!(f, "{} [{}] ({})", self.message, self.code, self.sql_state)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
