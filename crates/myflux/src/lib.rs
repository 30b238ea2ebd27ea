//! Reactive MySQL wire-protocol client driver.
//!
//! The driver speaks protocol version 10 over a single full-duplex
//! connection and is built from three subsystems:
//!
//! - the envelope framing codec: length-prefixed packet reassembly,
//!   outbound slicing into 16 MiB - 1 windows, sequence-id discipline;
//! - the connection-phase state machine: handshake negotiation, capability
//!   intersection and pluggable authentication
//!   (`mysql_native_password`, `caching_sha2_password`, `sha256_password`,
//!   `mysql_clear_password`);
//! - the command-phase exchange engine: one task per connection serializes
//!   logical exchanges, pushes server messages to the active subscriber
//!   with back-pressure, and drains cancelled exchanges.
//!
//! # Example
//!
//! ```rust,ignore
//! use myflux::{Client, Config};
//!
//! let config = Config::new()
//!     .host("localhost")
//!     .user("app")
//!     .password("secret")
//!     .database("inventory");
//!
//! let client = Client::connect(config).await?;
//! let results = client.query("SELECT id, name FROM parts").await?;
//! for row in results[0].rows() {
//!     let id: i64 = row.get_named("id")?;
//! }
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod flow;
pub mod message;
pub mod protocol;
pub mod result;
pub mod row;
pub mod session;
pub mod statement;
pub mod tls;
pub mod types;

mod handshake;

pub use config::{Config, SslMode, TlsConfig, ZeroDate};
pub use engine::{ConnectionInfo, Transport};
pub use flow::{Client, PreparedStatement, QueryStream};
pub use result::ResultSet;
pub use session::ServerVersion;
pub use statement::{Bindings, ParsedQuery};

pub use myflux_core::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, ProtocolErrorKind, Result, Row,
    ServerError, Value,
};
