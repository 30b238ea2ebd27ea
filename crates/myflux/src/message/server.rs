//! Server-to-client messages and the context-aware decoder.
//!
//! A single leading byte discriminates messages, but its meaning depends on
//! the active decode context: 0xFE is an EOF, an OK (with DEPRECATE_EOF), a
//! column-count varint header or an auth-change request depending on where
//! the exchange stands. The tie-breaks live here; the decode context only
//! carries state.

#![allow(clippy::cast_possible_truncation)]

use bytes::Bytes;
use myflux_core::{Error, ProtocolErrorKind, Result, ServerError};

use crate::protocol::envelope::join_fragments;
use crate::protocol::{headers, server_status, Cursor, DecodeContext};
use crate::types::ColumnDefinition;

/// Minimal OK payload: header + two lenenc ints + status + warnings.
const MIN_OK_SIZE: usize = 7;
/// EOF payloads are shorter than 9 bytes.
const MAX_EOF_SIZE: usize = 9;

/// Initial HandshakeV10 from the server.
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Concatenated scramble (salt part 1 + part 2)
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub collation: u8,
    pub status_flags: u16,
    pub auth_plugin_name: Option<String>,
}

/// OK message: completion of a statement or result window.
#[derive(Debug, Clone, Default)]
pub struct OkMessage {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkMessage {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::MORE_RESULTS_EXISTS != 0
    }
}

/// ERR message.
#[derive(Debug, Clone)]
pub struct ErrMessage {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrMessage {
    /// Convert into the user-visible server error.
    pub fn into_server_error(self, sql: Option<String>) -> ServerError {
        ServerError {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.message,
            sql,
        }
    }
}

/// EOF message (pre-DEPRECATE_EOF delimiters).
#[derive(Debug, Clone, Copy, Default)]
pub struct EofMessage {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofMessage {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::MORE_RESULTS_EXISTS != 0
    }
}

/// Opaque auth continuation, consumed by the active plugin.
#[derive(Debug, Clone)]
pub struct AuthMoreData {
    pub data: Bytes,
}

/// Request to switch authentication plugins mid-exchange.
#[derive(Debug, Clone)]
pub struct AuthChange {
    pub plugin_name: String,
    pub salt: Vec<u8>,
}

/// Column count announcing a result set.
#[derive(Debug, Clone, Copy)]
pub struct ColumnCount(pub u64);

/// COM_STMT_PREPARE acknowledgement.
#[derive(Debug, Clone, Copy)]
pub struct PreparedOk {
    pub statement_id: u32,
    pub columns: u16,
    pub parameters: u16,
    pub warnings: u16,
}

/// An undecoded row; fragments stay refcounted until fields are consumed.
#[derive(Debug, Clone)]
pub struct RowPayload {
    pub fragments: Vec<Bytes>,
}

/// A decoded server message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Handshake(HandshakeV10),
    Ok(OkMessage),
    Err(ErrMessage),
    Eof(EofMessage),
    AuthMoreData(AuthMoreData),
    AuthChange(AuthChange),
    ColumnCount(ColumnCount),
    ColumnDefinition(Box<ColumnDefinition>),
    PreparedOk(PreparedOk),
    Row(RowPayload),
}

/// Decode one logical message under the given context.
///
/// `deprecate_eof` settles the 0xFE OK-vs-EOF tie-breaks: an OK-sized
/// 0xFE payload is an OK message only under that capability. Row messages
/// keep their fragments; everything else is joined and parsed into owned
/// fields.
pub fn decode(
    fragments: Vec<Bytes>,
    context: &DecodeContext,
    deprecate_eof: bool,
) -> Result<ServerMessage> {
    let first = fragments
        .iter()
        .find_map(|f| f.first().copied());

    match context {
        DecodeContext::ResultRows { binary, .. } => {
            decode_result_row(fragments, first, *binary, deprecate_eof)
        }
        _ => {
            let payload = join_fragments(fragments);
            let header = match first {
                Some(b) => b,
                None => {
                    return Err(unknown_header(0, 0, context));
                }
            };
            match context {
                DecodeContext::Connection => decode_connection(payload, header),
                DecodeContext::Command => decode_command(payload, header, deprecate_eof),
                DecodeContext::WaitPrepare => {
                    decode_wait_prepare(payload, header, deprecate_eof)
                }
                DecodeContext::PrepMetadata { .. } | DecodeContext::ResultMetadata { .. } => {
                    decode_metadata(payload, header)
                }
                DecodeContext::ResultRows { .. } => unreachable!("handled above"),
            }
        }
    }
}

fn unknown_header(header: u8, len: usize, context: &DecodeContext) -> Error {
    Error::protocol(
        ProtocolErrorKind::UnknownHeader,
        format!(
            "unknown message header 0x{:02X} ({} bytes) in {:?} context",
            header, len, context
        ),
    )
}

// === Connection phase ===

fn decode_connection(payload: Bytes, header: u8) -> Result<ServerMessage> {
    let len = payload.len();
    match header {
        headers::OK if len >= MIN_OK_SIZE => decode_ok(payload).map(ServerMessage::Ok),
        headers::AUTH_MORE_DATA => {
            let mut cursor = Cursor::new(payload);
            cursor.skip(1);
            Ok(ServerMessage::AuthMoreData(AuthMoreData {
                data: cursor.read_rest(),
            }))
        }
        headers::ERROR => decode_err(payload).map(ServerMessage::Err),
        headers::EOF => {
            if len <= MAX_EOF_SIZE {
                decode_eof(payload).map(ServerMessage::Eof)
            } else {
                decode_auth_change(payload).map(ServerMessage::AuthChange)
            }
        }
        0x09 => Err(Error::protocol(
            ProtocolErrorKind::NotSupported,
            "server offered legacy handshake V9",
        )),
        0x0A => decode_handshake(payload),
        // Connection-phase decode errors always close the connection.
        other => Err(Error::protocol(
            ProtocolErrorKind::NotSupported,
            format!(
                "unknown message header 0x{:02X} ({} bytes) in connection phase",
                other, len
            ),
        )),
    }
}

fn decode_handshake(payload: Bytes) -> Result<ServerMessage> {
    use crate::protocol::capabilities::{PLUGIN_AUTH, SECURE_CONNECTION};

    let mut cursor = Cursor::new(payload);
    let protocol_version = cursor
        .read_u8()
        .ok_or_else(|| truncated("protocol version"))?;
    if protocol_version != 10 {
        return Err(Error::protocol(
            ProtocolErrorKind::NotSupported,
            format!("unsupported protocol version {}", protocol_version),
        ));
    }

    let server_version = cursor.read_cstr_string()?;
    let connection_id = cursor
        .read_u32_le()
        .ok_or_else(|| truncated("connection id"))?;

    let salt1 = cursor.read_bytes(8).ok_or_else(|| truncated("salt"))?;
    cursor.skip(1); // filler

    let caps_low = cursor
        .read_u16_le()
        .ok_or_else(|| truncated("capability flags"))?;

    // Everything past the low capability bits is optional in V10.
    let collation = cursor.read_u8().unwrap_or(0);
    let status_flags = cursor.read_u16_le().unwrap_or(0);
    let caps_high = cursor.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_low) | (u32::from(caps_high) << 16);

    let auth_data_len = if capabilities & PLUGIN_AUTH != 0 {
        cursor.read_u8().unwrap_or(0) as usize
    } else {
        cursor.skip(1);
        0
    };
    cursor.skip(10); // reserved

    let mut scramble = salt1.to_vec();
    if capabilities & SECURE_CONNECTION != 0 {
        let salt2_len = auth_data_len.saturating_sub(9).max(12);
        if let Some(salt2) = cursor.read_bytes(salt2_len) {
            scramble.extend_from_slice(&salt2);
        }
        cursor.skip(1); // trailing NUL padding
    }

    let auth_plugin_name = if capabilities & PLUGIN_AUTH != 0 {
        // Some servers omit the trailing NUL on the plugin name.
        match cursor.read_cstr_string() {
            Ok(name) => Some(name),
            Err(_) => {
                let rest = cursor.read_rest_string();
                (!rest.is_empty()).then_some(rest)
            }
        }
    } else {
        None
    };

    Ok(ServerMessage::Handshake(HandshakeV10 {
        protocol_version,
        server_version,
        connection_id,
        scramble,
        capabilities,
        collation,
        status_flags,
        auth_plugin_name,
    }))
}

fn decode_auth_change(payload: Bytes) -> Result<AuthChange> {
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0xFE header
    let plugin_name = cursor.read_cstr_string()?;
    let mut salt = cursor.read_rest().to_vec();
    // Strip the trailing NUL servers append to the new salt.
    if salt.last() == Some(&0) {
        salt.pop();
    }
    Ok(AuthChange { plugin_name, salt })
}

// === Command phase ===

fn decode_command(payload: Bytes, header: u8, deprecate_eof: bool) -> Result<ServerMessage> {
    let len = payload.len();
    match header {
        headers::ERROR => return decode_err(payload).map(ServerMessage::Err),
        headers::OK if len >= MIN_OK_SIZE => return decode_ok(payload).map(ServerMessage::Ok),
        headers::EOF => {
            // Under DEPRECATE_EOF an OK-sized 0xFE payload is an OK; a
            // 9-byte lenenc column count would need a 16M-column result,
            // which cannot exist. Otherwise short payloads are plain EOFs.
            if deprecate_eof && len >= MIN_OK_SIZE && len < crate::protocol::MAX_ENVELOPE_SIZE {
                return decode_ok(payload).map(ServerMessage::Ok);
            }
            if len <= MAX_EOF_SIZE {
                return decode_eof(payload).map(ServerMessage::Eof);
            }
        }
        _ => {}
    }

    // Otherwise the payload must be exactly one varint: the column count.
    let mut cursor = Cursor::new(payload.clone());
    match cursor.read_lenenc_int() {
        Some(count) if cursor.is_empty() => {
            Ok(ServerMessage::ColumnCount(ColumnCount(count)))
        }
        _ => Err(unknown_header(header, len, &DecodeContext::Command)),
    }
}

fn decode_wait_prepare(payload: Bytes, header: u8, deprecate_eof: bool) -> Result<ServerMessage> {
    let len = payload.len();
    match header {
        headers::ERROR => decode_err(payload).map(ServerMessage::Err),
        headers::OK => {
            if looks_like_prepared_ok(&payload) {
                decode_prepared_ok(payload).map(ServerMessage::PreparedOk)
            } else if len >= MIN_OK_SIZE {
                decode_ok(payload).map(ServerMessage::Ok)
            } else {
                Err(unknown_header(header, len, &DecodeContext::WaitPrepare))
            }
        }
        headers::EOF
            if deprecate_eof && len >= MIN_OK_SIZE && len < crate::protocol::MAX_ENVELOPE_SIZE =>
        {
            decode_ok(payload).map(ServerMessage::Ok)
        }
        headers::EOF if len <= MAX_EOF_SIZE => decode_eof(payload).map(ServerMessage::Eof),
        other => Err(unknown_header(other, len, &DecodeContext::WaitPrepare)),
    }
}

/// PreparedOk is 12 bytes with a zero filler at offset 9.
fn looks_like_prepared_ok(payload: &Bytes) -> bool {
    payload.len() == 12 && payload[9] == 0
}

fn decode_prepared_ok(payload: Bytes) -> Result<PreparedOk> {
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0x00 status
    let statement_id = cursor
        .read_u32_le()
        .ok_or_else(|| truncated("statement id"))?;
    let columns = cursor
        .read_u16_le()
        .ok_or_else(|| truncated("column count"))?;
    let parameters = cursor
        .read_u16_le()
        .ok_or_else(|| truncated("parameter count"))?;
    cursor.skip(1); // filler
    let warnings = cursor.read_u16_le().unwrap_or(0);
    Ok(PreparedOk {
        statement_id,
        columns,
        parameters,
        warnings,
    })
}

// === Metadata phase ===

fn decode_metadata(payload: Bytes, header: u8) -> Result<ServerMessage> {
    let len = payload.len();
    match header {
        headers::ERROR => decode_err(payload).map(ServerMessage::Err),
        headers::EOF if len <= MAX_EOF_SIZE => decode_eof(payload).map(ServerMessage::Eof),
        _ if looks_like_column_definition(&payload) => {
            let mut cursor = Cursor::new(payload);
            ColumnDefinition::decode(&mut cursor)
                .map(|def| ServerMessage::ColumnDefinition(Box::new(def)))
        }
        other => Err(unknown_header(
            other,
            len,
            &DecodeContext::ResultMetadata {
                col_total: 0,
                remaining_cols: 0,
            },
        )),
    }
}

/// Column definitions open with the lenenc catalog string "def".
fn looks_like_column_definition(payload: &Bytes) -> bool {
    payload.len() > 4 && payload[0] == 3 && &payload[1..4] == b"def"
}

// === Result rows ===

fn decode_result_row(
    fragments: Vec<Bytes>,
    first: Option<u8>,
    binary: bool,
    deprecate_eof: bool,
) -> Result<ServerMessage> {
    let header = match first {
        Some(b) => b,
        None => {
            // An empty logical payload cannot be a row or a terminator.
            return Err(unknown_header(0, 0, &DecodeContext::ResultRows { cols: 0, binary }));
        }
    };
    let total_len: usize = fragments.iter().map(Bytes::len).sum();

    if header == headers::ERROR {
        return decode_err(join_fragments(fragments)).map(ServerMessage::Err);
    }

    if binary {
        // Binary rows always open with 0x00; server OKs in result context
        // always open with 0xFE.
        if header == headers::OK {
            return Ok(ServerMessage::Row(RowPayload { fragments }));
        }
    } else if is_text_row(&fragments, header, total_len) {
        return Ok(ServerMessage::Row(RowPayload { fragments }));
    }

    if header == headers::EOF {
        let payload = join_fragments(fragments);
        let len = payload.len();
        if deprecate_eof && len >= MIN_OK_SIZE && len < crate::protocol::MAX_ENVELOPE_SIZE {
            return decode_ok(payload).map(ServerMessage::Ok);
        }
        if len <= MAX_EOF_SIZE {
            return decode_eof(payload).map(ServerMessage::Eof);
        }
    }

    Err(unknown_header(
        header,
        total_len,
        &DecodeContext::ResultRows { cols: 0, binary },
    ))
}

/// Text-row vs terminator discrimination for an 0xFE-or-other first byte.
fn is_text_row(fragments: &[Bytes], header: u8, total_len: usize) -> bool {
    match header {
        // NULL first field: not a varint header, not OK/EOF
        headers::NULL_VALUE => true,
        headers::EOF => {
            // 0xFE may open an 8-byte lenenc for a huge first field. Treat
            // as a row only when the advertised field size is consistent
            // with the accumulated payload.
            let first = &fragments[0];
            if first.len() > 9 {
                let needed = u64::from_le_bytes([
                    first[1], first[2], first[3], first[4], first[5], first[6], first[7], first[8],
                ]);
                (total_len as u64) >= needed.saturating_add(9)
            } else {
                false
            }
        }
        // 0x00 first byte is a one-byte lenenc (empty first field), not an
        // OK: result-set OKs open with 0xFE.
        _ => true,
    }
}

// === Shared field parsers ===

fn decode_ok(payload: Bytes) -> Result<OkMessage> {
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0x00 or 0xFE header
    let affected_rows = cursor
        .read_lenenc_int()
        .ok_or_else(|| truncated("affected rows"))?;
    let last_insert_id = cursor
        .read_lenenc_int()
        .ok_or_else(|| truncated("last insert id"))?;
    let status_flags = cursor
        .read_u16_le()
        .ok_or_else(|| truncated("status flags"))?;
    let warnings = cursor.read_u16_le().ok_or_else(|| truncated("warnings"))?;

    let info = if status_flags & server_status::SESSION_STATE_CHANGED != 0 {
        // Session-state-tracking servers length-prefix the info string.
        cursor.read_lenenc_string().unwrap_or_default()
    } else {
        cursor.read_rest_string()
    };

    Ok(OkMessage {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

fn decode_err(payload: Bytes) -> Result<ErrMessage> {
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0xFF header
    let error_code = cursor
        .read_u16_le()
        .ok_or_else(|| truncated("error code"))?;

    let sql_state = if cursor.peek() == Some(b'#') {
        cursor.skip(1);
        cursor.read_string(5).unwrap_or_default()
    } else {
        String::new()
    };

    Ok(ErrMessage {
        error_code,
        sql_state,
        message: cursor.read_rest_string(),
    })
}

fn decode_eof(payload: Bytes) -> Result<EofMessage> {
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0xFE header
    // Pre-4.1 EOFs carry no fields at all.
    let warnings = cursor.read_u16_le().unwrap_or(0);
    let status_flags = cursor.read_u16_le().unwrap_or(0);
    Ok(EofMessage {
        warnings,
        status_flags,
    })
}

fn truncated(what: &str) -> Error {
    Error::protocol(
        ProtocolErrorKind::NotSupported,
        format!("message truncated at {}", what),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(payload: &[u8], ctx: DecodeContext) -> Result<ServerMessage> {
        decode_with(payload, ctx, true)
    }

    fn decode_with(payload: &[u8], ctx: DecodeContext, deprecate_eof: bool) -> Result<ServerMessage> {
        decode(vec![Bytes::copy_from_slice(payload)], &ctx, deprecate_eof)
    }

    fn ok_payload(header: u8, affected: u8, insert_id: u8, status: u16) -> Vec<u8> {
        let mut p = vec![header, affected, insert_id];
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        p
    }

    #[test]
    fn command_ok() {
        let msg = decode_one(&ok_payload(0x00, 1, 42, 2), DecodeContext::Command).unwrap();
        match msg {
            ServerMessage::Ok(ok) => {
                assert_eq!(ok.affected_rows, 1);
                assert_eq!(ok.last_insert_id, 42);
                assert_eq!(ok.status_flags, 2);
            }
            other => panic!("expected OK, got {:?}", other),
        }
    }

    #[test]
    fn command_err() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied");
        let msg = decode_one(&payload, DecodeContext::Command).unwrap();
        match msg {
            ServerMessage::Err(err) => {
                assert_eq!(err.error_code, 1045);
                assert_eq!(err.sql_state, "28000");
                assert_eq!(err.message, "Access denied");
            }
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    #[test]
    fn command_column_count() {
        let msg = decode_one(&[0x03], DecodeContext::Command).unwrap();
        assert!(matches!(msg, ServerMessage::ColumnCount(ColumnCount(3))));

        // Lenenc-16 column count
        let msg = decode_one(&[0xFC, 0x00, 0x01], DecodeContext::Command).unwrap();
        assert!(matches!(msg, ServerMessage::ColumnCount(ColumnCount(256))));
    }

    #[test]
    fn command_fe_nine_bytes_depends_on_deprecate_eof() {
        // With DEPRECATE_EOF a 9-byte 0xFE payload is an OK message,
        // never a column count; without the capability it is an EOF.
        let mut payload = ok_payload(0xFE, 5, 0, 0);
        payload.extend_from_slice(&[0, 0]);
        assert_eq!(payload.len(), 9);

        let msg = decode_with(&payload, DecodeContext::Command, true).unwrap();
        assert!(matches!(msg, ServerMessage::Ok(_)));

        let msg = decode_with(&payload, DecodeContext::Command, false).unwrap();
        assert!(matches!(msg, ServerMessage::Eof(_)));
    }

    #[test]
    fn command_fe_short_payload_is_eof() {
        let payload = [0xFE, 0x00, 0x00, 0x02, 0x00];
        let msg = decode_one(&payload, DecodeContext::Command).unwrap();
        match msg {
            ServerMessage::Eof(eof) => assert_eq!(eof.status_flags, 2),
            other => panic!("expected EOF, got {:?}", other),
        }
    }

    #[test]
    fn command_unknown_header() {
        // 0xFB is never valid in command context (LOCAL INFILE is not
        // negotiated).
        let err = decode_one(&[0xFB, 0x01, 0x02], DecodeContext::Command).unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::UnknownHeader
        ));
    }

    #[test]
    fn connection_handshake_v10() {
        let mut payload = vec![0x0A];
        payload.extend_from_slice(b"5.7.31\0");
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // salt1
        payload.push(0); // filler
        payload.extend_from_slice(&0xF7FFu16.to_le_bytes()); // caps low
        payload.push(0x21); // collation
        payload.extend_from_slice(&2u16.to_le_bytes()); // status
        payload.extend_from_slice(&0x81FFu16.to_le_bytes()); // caps high
        payload.push(0x15); // auth data len = 21
        payload.extend_from_slice(&[0; 10]); // reserved
        payload.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]); // salt2
        payload.push(0); // NUL pad
        payload.extend_from_slice(b"mysql_native_password\0");

        let msg = decode_one(&payload, DecodeContext::Connection).unwrap();
        match msg {
            ServerMessage::Handshake(h) => {
                assert_eq!(h.protocol_version, 10);
                assert_eq!(h.server_version, "5.7.31");
                assert_eq!(h.connection_id, 10);
                assert_eq!(h.scramble.len(), 20);
                assert_eq!(&h.scramble[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
                assert_eq!(h.capabilities, 0x81FF_F7FF);
                assert_eq!(h.collation, 0x21);
                assert_eq!(h.status_flags, 2);
                assert_eq!(h.auth_plugin_name.as_deref(), Some("mysql_native_password"));
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn connection_rejects_other_protocol_versions() {
        let err = decode_one(&[0x09, b'x', 0], DecodeContext::Connection).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::NotSupported
        ));

        let mut payload = vec![0x0B];
        payload.extend_from_slice(b"9.9.9\0");
        let err = decode_one(&payload, DecodeContext::Connection).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn connection_auth_more_data() {
        let msg = decode_one(&[0x01, 0x04], DecodeContext::Connection).unwrap();
        match msg {
            ServerMessage::AuthMoreData(more) => assert_eq!(&more.data[..], &[0x04]),
            other => panic!("expected auth more data, got {:?}", other),
        }
    }

    #[test]
    fn connection_auth_change_vs_eof() {
        // Long 0xFE payload: auth change with plugin and salt
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"caching_sha2_password\0");
        payload.extend_from_slice(&[9u8; 20]);
        payload.push(0);
        let msg = decode_one(&payload, DecodeContext::Connection).unwrap();
        match msg {
            ServerMessage::AuthChange(change) => {
                assert_eq!(change.plugin_name, "caching_sha2_password");
                assert_eq!(change.salt, vec![9u8; 20]);
            }
            other => panic!("expected auth change, got {:?}", other),
        }

        // Short 0xFE payload: plain EOF
        let msg = decode_one(&[0xFE, 0, 0, 0, 0], DecodeContext::Connection).unwrap();
        assert!(matches!(msg, ServerMessage::Eof(_)));
    }

    #[test]
    fn wait_prepare_discrimination() {
        // PreparedOk: 12 bytes, filler at offset 9
        let payload = [0x00, 7, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0];
        let msg = decode_one(&payload, DecodeContext::WaitPrepare).unwrap();
        match msg {
            ServerMessage::PreparedOk(ok) => {
                assert_eq!(ok.statement_id, 7);
                assert_eq!(ok.columns, 0);
                assert_eq!(ok.parameters, 2);
            }
            other => panic!("expected prepared ok, got {:?}", other),
        }

        // Plain OK shape falls back to an OK message
        let msg = decode_one(&ok_payload(0x00, 0, 0, 2), DecodeContext::WaitPrepare).unwrap();
        assert!(matches!(msg, ServerMessage::Ok(_)));

        let mut err_payload = vec![0xFF, 0x30, 0x04, b'#'];
        err_payload.extend_from_slice(b"42000");
        err_payload.extend_from_slice(b"syntax error");
        let msg = decode_one(&err_payload, DecodeContext::WaitPrepare).unwrap();
        assert!(matches!(msg, ServerMessage::Err(_)));
    }

    fn column_def_payload(name: &str) -> Vec<u8> {
        let mut p = Vec::new();
        for field in ["def", "db", "t", "t", name, name] {
            p.push(field.len() as u8);
            p.extend_from_slice(field.as_bytes());
        }
        p.push(0x0C); // fixed-length block
        p.extend_from_slice(&33u16.to_le_bytes()); // charset
        p.extend_from_slice(&11u32.to_le_bytes()); // column length
        p.push(0x03); // LONG
        p.extend_from_slice(&0u16.to_le_bytes()); // flags
        p.push(0); // decimals
        p.extend_from_slice(&[0, 0]); // filler
        p
    }

    #[test]
    fn metadata_column_definition_and_eof() {
        let ctx = DecodeContext::result_metadata(1);
        let msg = decode_one(&column_def_payload("id"), ctx).unwrap();
        match msg {
            ServerMessage::ColumnDefinition(def) => {
                assert_eq!(def.name, "id");
                assert_eq!(def.field_type, crate::types::FieldType::Long);
            }
            other => panic!("expected column definition, got {:?}", other),
        }

        let msg = decode_one(&[0xFE, 0, 0, 2, 0], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Eof(_)));

        let err = decode_one(&[0x42, 0x42, 0x42, 0x42, 0x42], ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::UnknownHeader
        ));
    }

    #[test]
    fn text_rows_and_terminators() {
        let ctx = DecodeContext::ResultRows {
            cols: 1,
            binary: false,
        };

        // Ordinary row: one lenenc field "1"
        let msg = decode_one(&[0x01, b'1'], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));

        // NULL first field
        let msg = decode_one(&[0xFB], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));

        // 0x00 first byte is an empty first field, not an OK
        let msg = decode_one(&[0x00, 0x01, b'x'], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));

        // Terminating EOF
        let msg = decode_one(&[0xFE, 0, 0, 2, 0], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Eof(_)));

        // Terminating OK (DEPRECATE_EOF)
        let msg = decode_one(&ok_payload(0xFE, 0, 0, 2), ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Ok(_)));
    }

    #[test]
    fn text_row_with_huge_first_field_marker() {
        // 0xFE + 8-byte length, consistent with the accumulated payload:
        // a row whose first field is 16 bytes.
        let mut payload = vec![0xFE];
        payload.extend_from_slice(&16u64.to_le_bytes());
        payload.extend_from_slice(&[b'a'; 16]);
        let ctx = DecodeContext::ResultRows {
            cols: 1,
            binary: false,
        };
        let msg = decode_one(&payload, ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));

        // Inconsistent length: not a row. Without DEPRECATE_EOF nothing
        // else matches a 10-byte 0xFE payload and the exchange fails.
        let mut payload = vec![0xFE];
        payload.extend_from_slice(&1_000_000u64.to_le_bytes());
        payload.push(b'a');
        let err = decode_with(&payload, ctx, false).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn binary_rows_start_with_zero() {
        let ctx = DecodeContext::ResultRows {
            cols: 1,
            binary: true,
        };

        let msg = decode_one(&[0x00, 0x00, 0x2A, 0x00, 0x00, 0x00], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));

        let msg = decode_one(&ok_payload(0xFE, 0, 0, 0), ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Ok(_)));

        let err = decode_one(&[0x01, 0x02], ctx).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn null_first_field_with_eof_shaped_tail_is_a_row() {
        // A 0xFB payload is always a row even when the next logical
        // message would look like an EOF.
        let ctx = DecodeContext::ResultRows {
            cols: 2,
            binary: false,
        };
        let msg = decode_one(&[0xFB, 0x01, b'7'], ctx).unwrap();
        assert!(matches!(msg, ServerMessage::Row(_)));
    }

    #[test]
    fn session_track_ok_reads_lenenc_info() {
        let mut payload = vec![0x00, 0, 0];
        payload.extend_from_slice(&server_status::SESSION_STATE_CHANGED.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.push(2);
        payload.extend_from_slice(b"ok");
        payload.extend_from_slice(&[0x00]); // state-change block (ignored)
        let msg = decode_one(&payload, DecodeContext::Command).unwrap();
        match msg {
            ServerMessage::Ok(ok) => assert_eq!(ok.info, "ok"),
            other => panic!("expected OK, got {:?}", other),
        }
    }
}
