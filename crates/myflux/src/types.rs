//! MySQL column types and wire value conversion.
//!
//! Field type codes come from result-set metadata and drive both the text
//! decoder (every value a lenenc string) and the binary decoder (fixed
//! widths for numbers, length-prefixed component form for temporals).

#![allow(clippy::cast_possible_truncation)]

use bytes::Bytes;
use myflux_core::{Error, Result, Value};

use crate::config::ZeroDate;
use crate::protocol::Cursor;

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            // Unknown codes surface as strings rather than failing the row.
            _ => FieldType::String,
        }
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::Time | FieldType::DateTime | FieldType::Timestamp
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }
}

/// Column definition flags.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
}

/// One column definition from result-set or prepared-statement metadata.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    /// Collation id of the column data
    pub charset: u16,
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Decode a ColumnDefinition41 payload.
    pub fn decode(cursor: &mut Cursor) -> Result<Self> {
        // catalog is always "def"
        let _catalog = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("catalog"))?;
        let schema = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("schema"))?;
        let table = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("table"))?;
        let org_table = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("org_table"))?;
        let name = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("name"))?;
        let org_name = cursor
            .read_lenenc_string()
            .ok_or_else(|| truncated("org_name"))?;

        // Fixed-length field block, always 0x0C
        let _fixed_len = cursor.read_lenenc_int();

        let charset = cursor.read_u16_le().ok_or_else(|| truncated("charset"))?;
        let column_length = cursor
            .read_u32_le()
            .ok_or_else(|| truncated("column_length"))?;
        let field_type =
            FieldType::from_u8(cursor.read_u8().ok_or_else(|| truncated("field_type"))?);
        let flags = cursor.read_u16_le().ok_or_else(|| truncated("flags"))?;
        let decimals = cursor.read_u8().ok_or_else(|| truncated("decimals"))?;

        Ok(Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            field_type,
            flags,
            decimals,
        })
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

fn truncated(what: &str) -> Error {
    Error::Decode(format!("column definition truncated at {}", what))
}

fn decode_error(msg: impl Into<String>) -> Error {
    Error::Decode(msg.into())
}

// === Text protocol decoding ===

/// Decode one text-protocol field into a `Value`.
pub fn decode_text_value(
    field_type: FieldType,
    raw: &[u8],
    unsigned: bool,
    zero_date: ZeroDate,
) -> Result<Value> {
    let text = || String::from_utf8_lossy(raw);

    match field_type {
        FieldType::Null => Ok(Value::Null),
        FieldType::Tiny => {
            if unsigned {
                parse_int::<u8>(raw).map(|v| Value::SmallInt(i16::from(v)))
            } else {
                parse_int::<i8>(raw).map(Value::TinyInt)
            }
        }
        FieldType::Short | FieldType::Year => {
            if unsigned {
                parse_int::<u16>(raw).map(|v| Value::Int(i32::from(v)))
            } else {
                parse_int::<i16>(raw).map(Value::SmallInt)
            }
        }
        FieldType::Long | FieldType::Int24 => {
            if unsigned {
                parse_int::<u32>(raw).map(|v| Value::BigInt(i64::from(v)))
            } else {
                parse_int::<i32>(raw).map(Value::Int)
            }
        }
        FieldType::LongLong => {
            if unsigned {
                parse_int::<u64>(raw).map(|v| {
                    i64::try_from(v).map_or(Value::UBigInt(v), Value::BigInt)
                })
            } else {
                parse_int::<i64>(raw).map(Value::BigInt)
            }
        }
        FieldType::Float => parse_float(raw).map(|v| Value::Float(v as f32)),
        FieldType::Double => parse_float(raw).map(Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Ok(Value::Decimal(text().into_owned())),
        FieldType::Date => decode_text_date(raw, zero_date),
        FieldType::Time => decode_text_time(raw),
        FieldType::DateTime | FieldType::Timestamp => decode_text_datetime(raw, zero_date),
        FieldType::Json => serde_json::from_slice(raw)
            .map(Value::Json)
            .map_err(|e| decode_error(format!("invalid JSON field: {}", e))),
        FieldType::Bit => Ok(Value::Bytes(raw.to_vec())),
        t if t.is_blob() => Ok(Value::Bytes(raw.to_vec())),
        _ => Ok(Value::Text(text().into_owned())),
    }
}

fn parse_int<T: std::str::FromStr>(raw: &[u8]) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| decode_error(format!("invalid integer field: {:?}", String::from_utf8_lossy(raw))))
}

fn parse_float(raw: &[u8]) -> Result<f64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| decode_error(format!("invalid float field: {:?}", String::from_utf8_lossy(raw))))
}

fn decode_text_date(raw: &[u8], zero_date: ZeroDate) -> Result<Value> {
    let s = std::str::from_utf8(raw).map_err(|_| decode_error("date field is not UTF-8"))?;
    let mut parts = s.splitn(3, '-');
    let year: i32 = parse_part(parts.next(), "year")?;
    let month: u32 = parse_part(parts.next(), "month")?;
    let day: u32 = parse_part(parts.next(), "day")?;

    if year == 0 && month == 0 && day == 0 {
        return zero_date_value(zero_date);
    }
    Ok(Value::Date(ymd_to_days(year, month, day)))
}

fn decode_text_time(raw: &[u8]) -> Result<Value> {
    let s = std::str::from_utf8(raw).map_err(|_| decode_error("time field is not UTF-8"))?;
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (clock, micros) = match s.split_once('.') {
        Some((clock, frac)) => (clock, parse_fraction(frac)?),
        None => (s, 0),
    };
    let mut parts = clock.splitn(3, ':');
    let hours: i64 = parse_part(parts.next(), "hours")?;
    let minutes: i64 = parse_part(parts.next(), "minutes")?;
    let seconds: i64 = parse_part(parts.next(), "seconds")?;

    let total = (hours * 3600 + minutes * 60 + seconds) * 1_000_000 + micros;
    Ok(Value::Time(if negative { -total } else { total }))
}

fn decode_text_datetime(raw: &[u8], zero_date: ZeroDate) -> Result<Value> {
    let s = std::str::from_utf8(raw).map_err(|_| decode_error("datetime field is not UTF-8"))?;
    let (date_part, time_part) = s.split_once(' ').unwrap_or((s, "00:00:00"));

    let date = decode_text_date(date_part.as_bytes(), zero_date)?;
    let days = match date {
        Value::Date(days) => days,
        Value::Null => return Ok(Value::Null),
        other => return Ok(other),
    };
    let time = match decode_text_time(time_part.as_bytes())? {
        Value::Time(micros) => micros,
        _ => 0,
    };
    Ok(Value::Timestamp(i64::from(days) * 86_400_000_000 + time))
}

fn parse_part<T: std::str::FromStr>(part: Option<&str>, what: &str) -> Result<T> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| decode_error(format!("malformed temporal field ({})", what)))
}

fn parse_fraction(frac: &str) -> Result<i64> {
    let digits: i64 = frac
        .parse()
        .map_err(|_| decode_error("malformed fractional seconds"))?;
    // Scale to microseconds regardless of the printed precision.
    let scale = 10i64.pow(6u32.saturating_sub(frac.len() as u32));
    Ok(digits * scale)
}

fn zero_date_value(zero_date: ZeroDate) -> Result<Value> {
    match zero_date {
        ZeroDate::Exception => Err(decode_error("zero date value rejected")),
        ZeroDate::UseNull => Ok(Value::Null),
        // Round to 0001-01-01.
        ZeroDate::UseRound => Ok(Value::Date(ymd_to_days(1, 1, 1))),
    }
}

// === Binary protocol decoding ===

/// Decode one binary-protocol field of the given type from the cursor.
pub fn decode_binary_value(
    cursor: &mut Cursor,
    field_type: FieldType,
    unsigned: bool,
    zero_date: ZeroDate,
) -> Result<Value> {
    let short = || decode_error("binary field truncated");

    match field_type {
        FieldType::Null => Ok(Value::Null),
        FieldType::Tiny => {
            let v = cursor.read_u8().ok_or_else(short)?;
            Ok(if unsigned {
                Value::SmallInt(i16::from(v))
            } else {
                Value::TinyInt(v as i8)
            })
        }
        FieldType::Short | FieldType::Year => {
            let v = cursor.read_u16_le().ok_or_else(short)?;
            Ok(if unsigned {
                Value::Int(i32::from(v))
            } else {
                Value::SmallInt(v as i16)
            })
        }
        FieldType::Long | FieldType::Int24 => {
            let v = cursor.read_u32_le().ok_or_else(short)?;
            Ok(if unsigned {
                Value::BigInt(i64::from(v))
            } else {
                Value::Int(v as i32)
            })
        }
        FieldType::LongLong => {
            let v = cursor.read_u64_le().ok_or_else(short)?;
            Ok(if unsigned {
                i64::try_from(v).map_or(Value::UBigInt(v), Value::BigInt)
            } else {
                Value::BigInt(v as i64)
            })
        }
        FieldType::Float => {
            let v = cursor.read_u32_le().ok_or_else(short)?;
            Ok(Value::Float(f32::from_le_bytes(v.to_le_bytes())))
        }
        FieldType::Double => {
            let v = cursor.read_u64_le().ok_or_else(short)?;
            Ok(Value::Double(f64::from_le_bytes(v.to_le_bytes())))
        }
        FieldType::Date => decode_binary_date(cursor, zero_date),
        FieldType::DateTime | FieldType::Timestamp => decode_binary_datetime(cursor, zero_date),
        FieldType::Time => decode_binary_time(cursor),
        FieldType::Decimal | FieldType::NewDecimal => {
            let raw = cursor.read_lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Decimal(String::from_utf8_lossy(&raw).into_owned()))
        }
        FieldType::Json => {
            let raw = cursor.read_lenenc_bytes().ok_or_else(short)?;
            serde_json::from_slice(&raw)
                .map(Value::Json)
                .map_err(|e| decode_error(format!("invalid JSON field: {}", e)))
        }
        t if t.is_blob() => {
            let raw = cursor.read_lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Bytes(raw.to_vec()))
        }
        FieldType::Bit => {
            let raw = cursor.read_lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Bytes(raw.to_vec()))
        }
        _ => {
            let raw = cursor.read_lenenc_bytes().ok_or_else(short)?;
            Ok(Value::Text(String::from_utf8_lossy(&raw).into_owned()))
        }
    }
}

fn decode_binary_date(cursor: &mut Cursor, zero_date: ZeroDate) -> Result<Value> {
    let len = cursor
        .read_u8()
        .ok_or_else(|| decode_error("binary date truncated"))?;
    if len == 0 {
        return zero_date_value(zero_date);
    }
    let raw = cursor
        .read_bytes(len as usize)
        .ok_or_else(|| decode_error("binary date truncated"))?;
    let (year, month, day) = read_ymd(&raw)?;
    if year == 0 && month == 0 && day == 0 {
        return zero_date_value(zero_date);
    }
    Ok(Value::Date(ymd_to_days(year, month, day)))
}

fn decode_binary_datetime(cursor: &mut Cursor, zero_date: ZeroDate) -> Result<Value> {
    let len = cursor
        .read_u8()
        .ok_or_else(|| decode_error("binary datetime truncated"))?;
    if len == 0 {
        return match zero_date_value(zero_date)? {
            Value::Date(days) => Ok(Value::Timestamp(i64::from(days) * 86_400_000_000)),
            other => Ok(other),
        };
    }
    let raw = cursor
        .read_bytes(len as usize)
        .ok_or_else(|| decode_error("binary datetime truncated"))?;
    let (year, month, day) = read_ymd(&raw)?;
    let mut micros = 0i64;
    if raw.len() >= 7 {
        let hour = i64::from(raw[4]);
        let minute = i64::from(raw[5]);
        let second = i64::from(raw[6]);
        micros = (hour * 3600 + minute * 60 + second) * 1_000_000;
    }
    if raw.len() >= 11 {
        micros += i64::from(u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]]));
    }
    Ok(Value::Timestamp(
        i64::from(ymd_to_days(year, month, day)) * 86_400_000_000 + micros,
    ))
}

fn decode_binary_time(cursor: &mut Cursor) -> Result<Value> {
    let len = cursor
        .read_u8()
        .ok_or_else(|| decode_error("binary time truncated"))?;
    if len == 0 {
        return Ok(Value::Time(0));
    }
    let raw = cursor
        .read_bytes(len as usize)
        .ok_or_else(|| decode_error("binary time truncated"))?;
    if raw.len() < 8 {
        return Err(decode_error("binary time too short"));
    }
    let negative = raw[0] != 0;
    let days = i64::from(u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]));
    let hours = i64::from(raw[5]);
    let minutes = i64::from(raw[6]);
    let seconds = i64::from(raw[7]);
    let mut micros = ((days * 24 + hours) * 3600 + minutes * 60 + seconds) * 1_000_000;
    if raw.len() >= 12 {
        micros += i64::from(u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]));
    }
    Ok(Value::Time(if negative { -micros } else { micros }))
}

fn read_ymd(raw: &Bytes) -> Result<(i32, u32, u32)> {
    if raw.len() < 4 {
        return Err(decode_error("binary temporal too short"));
    }
    let year = i32::from(u16::from_le_bytes([raw[0], raw[1]]));
    Ok((year, u32::from(raw[2]), u32::from(raw[3])))
}

// === Binary protocol parameter encoding ===

/// MySQL type and unsigned flag used to describe a bound parameter.
pub fn value_param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::Timestamp(_) => (FieldType::DateTime, false),
        Value::Json(_) => (FieldType::Json, false),
    }
}

/// Append the binary-protocol encoding of a non-NULL parameter value.
pub fn encode_binary_value(buf: &mut Vec<u8>, value: &Value) {
    use crate::protocol::cursor::write_lenenc_bytes;

    match value {
        Value::Null => {}
        Value::Bool(b) => buf.push(u8::from(*b)),
        Value::TinyInt(v) => buf.push(*v as u8),
        Value::SmallInt(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::BigInt(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::UBigInt(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Decimal(s) => write_lenenc_bytes(buf, s.as_bytes()),
        Value::Text(s) => write_lenenc_bytes(buf, s.as_bytes()),
        Value::Bytes(b) => write_lenenc_bytes(buf, b),
        Value::Json(j) => {
            let s = j.to_string();
            write_lenenc_bytes(buf, s.as_bytes());
        }
        Value::Date(days) => {
            let (year, month, day) = days_to_ymd(*days);
            if year == 0 && month == 0 && day == 0 {
                buf.push(0);
            } else {
                buf.push(4);
                buf.extend_from_slice(&(year as u16).to_le_bytes());
                buf.push(month as u8);
                buf.push(day as u8);
            }
        }
        Value::Time(micros) => encode_binary_time(buf, *micros),
        Value::Timestamp(micros) => {
            let days = micros.div_euclid(86_400_000_000);
            let in_day = micros.rem_euclid(86_400_000_000);
            let (year, month, day) = days_to_ymd(days as i32);
            let secs = in_day / 1_000_000;
            let frac = (in_day % 1_000_000) as u32;
            let (hour, minute, second) = (secs / 3600, (secs % 3600) / 60, secs % 60);

            if frac == 0 && hour == 0 && minute == 0 && second == 0 {
                buf.push(4);
                buf.extend_from_slice(&(year as u16).to_le_bytes());
                buf.push(month as u8);
                buf.push(day as u8);
            } else if frac == 0 {
                buf.push(7);
                buf.extend_from_slice(&(year as u16).to_le_bytes());
                buf.push(month as u8);
                buf.push(day as u8);
                buf.push(hour as u8);
                buf.push(minute as u8);
                buf.push(second as u8);
            } else {
                buf.push(11);
                buf.extend_from_slice(&(year as u16).to_le_bytes());
                buf.push(month as u8);
                buf.push(day as u8);
                buf.push(hour as u8);
                buf.push(minute as u8);
                buf.push(second as u8);
                buf.extend_from_slice(&frac.to_le_bytes());
            }
        }
    }
}

fn encode_binary_time(buf: &mut Vec<u8>, micros: i64) {
    let negative = micros < 0;
    let micros = micros.unsigned_abs();
    let total_seconds = micros / 1_000_000;
    let frac = (micros % 1_000_000) as u32;

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if days == 0 && hours == 0 && minutes == 0 && seconds == 0 && frac == 0 {
        buf.push(0);
    } else if frac == 0 {
        buf.push(8);
        buf.push(u8::from(negative));
        buf.extend_from_slice(&(days as u32).to_le_bytes());
        buf.push(hours as u8);
        buf.push(minutes as u8);
        buf.push(seconds as u8);
    } else {
        buf.push(12);
        buf.push(u8::from(negative));
        buf.extend_from_slice(&(days as u32).to_le_bytes());
        buf.push(hours as u8);
        buf.push(minutes as u8);
        buf.push(seconds as u8);
        buf.extend_from_slice(&frac.to_le_bytes());
    }
}

// === Civil calendar conversion (Howard Hinnant's algorithms) ===

/// Days since the Unix epoch to (year, month, day).
pub fn days_to_ymd(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// (year, month, day) to days since the Unix epoch.
pub fn ymd_to_days(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}
