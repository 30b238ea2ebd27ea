//! Row payload decoding.
//!
//! Row messages keep their envelope fragments unjoined until fields are
//! consumed. The `FieldReader` walks the fragment chain and hands out
//! refcounted slices: a field wholly inside one fragment comes out as a
//! single slice, a field spanning fragments as a chain of slices. Slices
//! are released as fields are consumed; a parsed row owns no wire bytes.

#![allow(clippy::cast_possible_truncation)]

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use myflux_core::{Error, Result, Row, RowMetadata, Value};

use crate::config::ZeroDate;
use crate::protocol::envelope::join_fragments;
use crate::protocol::Cursor;
use crate::types::{decode_binary_value, decode_text_value, ColumnDefinition};

/// One field of a result row.
#[derive(Debug, Clone)]
pub enum Field {
    Null,
    /// Field contained in a single fragment
    Small(Bytes),
    /// Field spanning fragment boundaries
    Large(Vec<Bytes>),
}

impl Field {
    pub fn len(&self) -> usize {
        match self {
            Field::Null => 0,
            Field::Small(bytes) => bytes.len(),
            Field::Large(parts) => parts.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous view of the field; joins the chain for large fields.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Field::Null => None,
            Field::Small(bytes) => Some(bytes),
            Field::Large(parts) => Some(join_fragments(parts)),
        }
    }
}

/// Sequential reader over a row's fragment chain.
#[derive(Debug)]
pub struct FieldReader {
    parts: VecDeque<Bytes>,
}

impl FieldReader {
    pub fn new(fragments: Vec<Bytes>) -> Self {
        Self {
            parts: fragments.into(),
        }
    }

    fn remaining(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Bytes::is_empty)
    }

    fn read_u8(&mut self) -> Option<u8> {
        loop {
            let front = self.parts.front_mut()?;
            if front.is_empty() {
                self.parts.pop_front();
                continue;
            }
            return Some(front.get_u8());
        }
    }

    /// Read `len` bytes as a field, slicing rather than copying.
    fn read_run(&mut self, len: usize) -> Result<Field> {
        if self.remaining() < len {
            return Err(Error::Decode(format!(
                "row field of {} bytes exceeds remaining payload",
                len
            )));
        }

        let mut needed = len;
        let mut chain: Vec<Bytes> = Vec::new();
        while needed > 0 {
            let front = self
                .parts
                .front_mut()
                .ok_or_else(|| Error::Decode("row payload exhausted".into()))?;
            if front.is_empty() {
                self.parts.pop_front();
                continue;
            }
            let take = needed.min(front.len());
            chain.push(front.split_to(take));
            needed -= take;
        }

        Ok(match chain.len() {
            0 => Field::Small(Bytes::new()),
            1 => Field::Small(chain.into_iter().next().unwrap_or_default()),
            _ => Field::Large(chain),
        })
    }

    /// Read the next length-encoded field of a text row.
    pub fn read_field(&mut self) -> Result<Field> {
        let first = self
            .read_u8()
            .ok_or_else(|| Error::Decode("row payload exhausted".into()))?;

        let len = match first {
            0xFB => return Ok(Field::Null),
            0x00..=0xFA => u64::from(first),
            0xFC => self.read_int_le(2)?,
            0xFD => self.read_int_le(3)?,
            0xFE => self.read_int_le(8)?,
            0xFF => return Err(Error::Decode("invalid field length header 0xFF".into())),
        };

        self.read_run(len as usize)
    }

    fn read_int_le(&mut self, width: usize) -> Result<u64> {
        let mut value = 0u64;
        for shift in 0..width {
            let byte = self
                .read_u8()
                .ok_or_else(|| Error::Decode("row field length truncated".into()))?;
            value |= u64::from(byte) << (8 * shift);
        }
        Ok(value)
    }
}

/// Decode a text-protocol row into values.
pub fn decode_text_row(
    fragments: Vec<Bytes>,
    columns: &[ColumnDefinition],
    metadata: &Arc<RowMetadata>,
    zero_date: ZeroDate,
) -> Result<Row> {
    let mut reader = FieldReader::new(fragments);
    let mut values = Vec::with_capacity(columns.len());

    for column in columns {
        let value = match reader.read_field()? {
            Field::Null => Value::Null,
            field => {
                let bytes = field.into_bytes().unwrap_or_default();
                decode_text_value(column.field_type, &bytes, column.is_unsigned(), zero_date)?
            }
        };
        values.push(value);
    }

    Ok(Row::new(Arc::clone(metadata), values))
}

/// Decode a binary-protocol row into values.
///
/// Layout: 0x00 header, null bitmap with a 2-bit offset, then one
/// type-specific field per column not marked NULL.
pub fn decode_binary_row(
    fragments: Vec<Bytes>,
    columns: &[ColumnDefinition],
    metadata: &Arc<RowMetadata>,
    zero_date: ZeroDate,
) -> Result<Row> {
    let payload = join_fragments(fragments);
    let mut cursor = Cursor::new(payload);
    cursor.skip(1); // 0x00 row header

    let bitmap_len = (columns.len() + 2 + 7) / 8;
    let bitmap = cursor
        .read_bytes(bitmap_len)
        .ok_or_else(|| Error::Decode("binary row null bitmap truncated".into()))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(
                &mut cursor,
                column.field_type,
                column.is_unsigned(),
                zero_date,
            )?);
        }
    }

    Ok(Row::new(Arc::clone(metadata), values))
}
