//! Typed client and server protocol messages.
//!
//! Both directions are closed sum types: encoding and decoding are match
//! statements over the variant set, not an open registry.

pub mod client;
pub mod server;

pub use client::ClientMessage;
pub use server::{
    AuthChange, AuthMoreData, ColumnCount, EofMessage, ErrMessage, HandshakeV10, OkMessage,
    PreparedOk, RowPayload, ServerMessage,
};
