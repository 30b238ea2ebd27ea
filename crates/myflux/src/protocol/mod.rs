//! MySQL wire protocol primitives.
//!
//! Every packet ("envelope") on the wire carries a 4-byte header: a 3-byte
//! little-endian payload length and a 1-byte sequence id. A payload length
//! of 2^24 - 1 marks a continuation; the logical message ends at the first
//! envelope with a shorter (possibly zero-length) payload.

pub mod context;
pub mod cursor;
pub mod envelope;

pub use context::DecodeContext;
pub use cursor::Cursor;
pub use envelope::{write_envelopes, EnvelopeAssembler};

/// Maximum payload of a single envelope (2^24 - 1 bytes).
pub const MAX_ENVELOPE_SIZE: usize = 0xFF_FF_FF;

/// Envelope header size in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 4;

/// Client/server capability flags.
#[allow(dead_code)]
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 1 << 1;
    pub const LONG_FLAG: u32 = 1 << 2;
    pub const CONNECT_WITH_DB: u32 = 1 << 3;
    pub const NO_SCHEMA: u32 = 1 << 4;
    pub const COMPRESS: u32 = 1 << 5;
    pub const LOCAL_FILES: u32 = 1 << 7;
    pub const IGNORE_SPACE: u32 = 1 << 8;
    pub const PROTOCOL_41: u32 = 1 << 9;
    pub const INTERACTIVE: u32 = 1 << 10;
    pub const SSL: u32 = 1 << 11;
    pub const TRANSACTIONS: u32 = 1 << 13;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;
}

/// Command codes sent as the first payload byte of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the connection (fire-and-forget)
    Quit = 0x01,
    /// Switch the default schema
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Liveness probe
    Ping = 0x0E,
    /// Prepare a statement
    StmtPrepare = 0x16,
    /// Execute a prepared statement (binary protocol)
    StmtExecute = 0x17,
    /// Close a prepared statement (fire-and-forget)
    StmtClose = 0x19,
    /// Reset a prepared statement
    StmtReset = 0x1A,
}

/// Server status flags carried by OK and EOF messages.
#[allow(dead_code)]
pub mod server_status {
    pub const IN_TRANSACTION: u16 = 0x0001;
    pub const AUTOCOMMIT: u16 = 0x0002;
    pub const MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const NO_INDEX_USED: u16 = 0x0020;
    pub const CURSOR_EXISTS: u16 = 0x0040;
    pub const LAST_ROW_SENT: u16 = 0x0080;
    pub const NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const METADATA_CHANGED: u16 = 0x0400;
    pub const SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Collation ids the driver knows by name.
#[allow(dead_code)]
pub mod collations {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default collation for new connections (utf8mb4).
    pub const DEFAULT: u8 = UTF8MB4_0900_AI_CI;
}

/// First-byte message headers. Interpretation depends on the decode context.
#[allow(dead_code)]
pub mod headers {
    pub const OK: u8 = 0x00;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const NULL_VALUE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERROR: u8 = 0xFF;
}

/// A parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Payload length, at most `MAX_ENVELOPE_SIZE`
    pub payload_length: u32,
    /// Sequence id, wrapping at 255
    pub sequence_id: u8,
}

impl EnvelopeHeader {
    /// Parse from the 4 header bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode to the 4 header bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }

    /// Whether the logical message continues in the next envelope.
    pub fn is_continuation(self) -> bool {
        self.payload_length as usize == MAX_ENVELOPE_SIZE
    }
}
