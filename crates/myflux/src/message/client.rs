//! Client-to-server messages and their payload encoding.

#![allow(clippy::cast_possible_truncation)]

use myflux_core::{Error, Result, Value};

use crate::protocol::cursor::{write_cstr, write_lenenc_bytes, write_lenenc_int};
use crate::protocol::{capabilities, Command};
use crate::types::{encode_binary_value, value_param_type, FieldType};

/// The handshake response sent after (optionally) upgrading to TLS.
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub attributes: Vec<(String, String)>,
}

/// A client request, encoded to one logical payload.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// 32-byte TLS upgrade request sent before the handshake response
    SslRequest {
        capabilities: u32,
        max_packet_size: u32,
        collation: u8,
    },
    HandshakeResponse(HandshakeResponse41),
    /// Raw authentication continuation (scramble, password, key request)
    AuthResponse(Vec<u8>),
    /// COM_QUERY
    Query(String),
    /// COM_INIT_DB
    InitDb(String),
    /// COM_PING
    Ping,
    /// COM_QUIT, fire-and-forget
    Quit,
    /// COM_STMT_PREPARE
    StmtPrepare(String),
    /// COM_STMT_EXECUTE with one bound parameter row
    StmtExecute {
        statement_id: u32,
        params: Vec<Value>,
        /// Re-send parameter types (first execution or changed types)
        send_types: bool,
    },
    /// COM_STMT_CLOSE, fire-and-forget
    StmtClose { statement_id: u32 },
    /// COM_STMT_RESET
    StmtReset { statement_id: u32 },
}

impl ClientMessage {
    /// Whether sending this message restarts the sequence id at 0.
    pub fn resets_sequence(&self) -> bool {
        !matches!(
            self,
            ClientMessage::SslRequest { .. }
                | ClientMessage::HandshakeResponse(_)
                | ClientMessage::AuthResponse(_)
        )
    }

    /// Whether the server sends no reply to this message.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            ClientMessage::Quit | ClientMessage::StmtClose { .. }
        )
    }

    /// Encode to a logical payload (before envelope slicing).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        match self {
            ClientMessage::SslRequest {
                capabilities,
                max_packet_size,
                collation,
            } => {
                buf.extend_from_slice(&capabilities.to_le_bytes());
                buf.extend_from_slice(&max_packet_size.to_le_bytes());
                buf.push(*collation);
                buf.resize(buf.len() + 23, 0);
            }
            ClientMessage::HandshakeResponse(response) => encode_handshake_response(&mut buf, response)?,
            ClientMessage::AuthResponse(data) => buf.extend_from_slice(data),
            ClientMessage::Query(sql) => {
                buf.push(Command::Query as u8);
                buf.extend_from_slice(sql.as_bytes());
            }
            ClientMessage::InitDb(database) => {
                buf.push(Command::InitDb as u8);
                buf.extend_from_slice(database.as_bytes());
            }
            ClientMessage::Ping => buf.push(Command::Ping as u8),
            ClientMessage::Quit => buf.push(Command::Quit as u8),
            ClientMessage::StmtPrepare(sql) => {
                buf.push(Command::StmtPrepare as u8);
                buf.extend_from_slice(sql.as_bytes());
            }
            ClientMessage::StmtExecute {
                statement_id,
                params,
                send_types,
            } => encode_stmt_execute(&mut buf, *statement_id, params, *send_types),
            ClientMessage::StmtClose { statement_id } => {
                buf.push(Command::StmtClose as u8);
                buf.extend_from_slice(&statement_id.to_le_bytes());
            }
            ClientMessage::StmtReset { statement_id } => {
                buf.push(Command::StmtReset as u8);
                buf.extend_from_slice(&statement_id.to_le_bytes());
            }
        }
        Ok(buf)
    }
}

fn encode_handshake_response(buf: &mut Vec<u8>, response: &HandshakeResponse41) -> Result<()> {
    let caps = response.capabilities;

    buf.extend_from_slice(&caps.to_le_bytes());
    buf.extend_from_slice(&response.max_packet_size.to_le_bytes());
    buf.push(response.collation);
    buf.resize(buf.len() + 23, 0);

    write_cstr(buf, &response.username);

    if caps & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        write_lenenc_bytes(buf, &response.auth_response);
    } else {
        // Without the lenenc capability the length field is a single byte.
        let len = response.auth_response.len();
        if len > 255 {
            return Err(Error::Misuse(format!(
                "auth response of {} bytes requires PLUGIN_AUTH_LENENC_CLIENT_DATA",
                len
            )));
        }
        buf.push(len as u8);
        buf.extend_from_slice(&response.auth_response);
    }

    if caps & capabilities::CONNECT_WITH_DB != 0 {
        write_cstr(buf, response.database.as_deref().unwrap_or(""));
    }

    if caps & capabilities::PLUGIN_AUTH != 0 {
        write_cstr(buf, response.auth_plugin_name.as_deref().unwrap_or(""));
    }

    if caps & capabilities::CONNECT_ATTRS != 0 {
        let mut attrs = Vec::new();
        for (key, value) in &response.attributes {
            write_lenenc_bytes(&mut attrs, key.as_bytes());
            write_lenenc_bytes(&mut attrs, value.as_bytes());
        }
        write_lenenc_int(buf, attrs.len() as u64);
        buf.extend_from_slice(&attrs);
    }

    Ok(())
}

fn encode_stmt_execute(buf: &mut Vec<u8>, statement_id: u32, params: &[Value], send_types: bool) {
    buf.push(Command::StmtExecute as u8);
    buf.extend_from_slice(&statement_id.to_le_bytes());
    // No cursor
    buf.push(0x00);
    // Iteration count, always 1
    buf.extend_from_slice(&1u32.to_le_bytes());

    if params.is_empty() {
        return;
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    buf.extend_from_slice(&null_bitmap);

    buf.push(u8::from(send_types));
    if send_types {
        for param in params {
            let (field_type, unsigned) = value_param_type(param);
            buf.push(field_type as u8);
            buf.push(if unsigned { 0x80 } else { 0x00 });
        }
    }

    for param in params {
        if !param.is_null() {
            encode_binary_value(buf, param);
        }
    }
}

/// Parameter type descriptors for one binding, used to decide whether the
/// next execution must re-send types.
pub fn param_type_signature(params: &[Value]) -> Vec<(FieldType, bool)> {
    params.iter().map(value_param_type).collect()
}
