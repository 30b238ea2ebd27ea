//! Shared types for the myflux MySQL driver.
//!
//! This crate holds the driver-independent pieces: the error taxonomy, the
//! `Value` sum type produced by field decoding, and the `Row` type with its
//! collated (case-insensitive) column-name index.

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, ProtocolErrorKind, Result,
    ServerError,
};
pub use row::{FromValue, Row, RowMetadata};
pub use value::Value;
