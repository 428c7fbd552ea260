//! Row encoding for the result buffer.
//!
//! Rows are stored as a little-endian `u32` length followed by the bincode
//! encoding of the row's values. `SqlValue` is untagged for JSON output, so
//! values go through a tagged mirror enum that bincode can decode back into
//! the exact variant that was written.

use crate::database::SqlValue;
use crate::error::ServerError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of the length prefix in front of every row.
pub const ROW_HEADER_LEN: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
enum StoredValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal([u8; 16]),
    Uuid([u8; 16]),
    Date(i32),
    Time { secs: u32, nanos: u32 },
    DateTime { secs: i64, nanos: u32 },
    DateTimeUtc { secs: i64, nanos: u32 },
}

impl From<&SqlValue> for StoredValue {
    fn from(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => StoredValue::Null,
            SqlValue::Bool(v) => StoredValue::Bool(*v),
            SqlValue::I8(v) => StoredValue::I8(*v),
            SqlValue::I16(v) => StoredValue::I16(*v),
            SqlValue::I32(v) => StoredValue::I32(*v),
            SqlValue::I64(v) => StoredValue::I64(*v),
            SqlValue::F32(v) => StoredValue::F32(*v),
            SqlValue::F64(v) => StoredValue::F64(*v),
            SqlValue::String(v) => StoredValue::String(v.clone()),
            SqlValue::Bytes(v) => StoredValue::Bytes(v.clone()),
            SqlValue::Decimal(v) => StoredValue::Decimal(v.serialize()),
            SqlValue::Uuid(v) => StoredValue::Uuid(*v.as_bytes()),
            SqlValue::Date(v) => StoredValue::Date(v.num_days_from_ce()),
            SqlValue::Time(v) => StoredValue::Time {
                secs: v.num_seconds_from_midnight(),
                nanos: v.nanosecond(),
            },
            SqlValue::DateTime(v) => {
                let utc = v.and_utc();
                StoredValue::DateTime {
                    secs: utc.timestamp(),
                    nanos: utc.timestamp_subsec_nanos(),
                }
            }
            SqlValue::DateTimeUtc(v) => StoredValue::DateTimeUtc {
                secs: v.timestamp(),
                nanos: v.timestamp_subsec_nanos(),
            },
        }
    }
}

impl TryFrom<StoredValue> for SqlValue {
    type Error = ServerError;

    fn try_from(value: StoredValue) -> Result<Self, Self::Error> {
        let invalid = |kind: &str| ServerError::storage(format!("Corrupt {} value in result buffer", kind));

        Ok(match value {
            StoredValue::Null => SqlValue::Null,
            StoredValue::Bool(v) => SqlValue::Bool(v),
            StoredValue::I8(v) => SqlValue::I8(v),
            StoredValue::I16(v) => SqlValue::I16(v),
            StoredValue::I32(v) => SqlValue::I32(v),
            StoredValue::I64(v) => SqlValue::I64(v),
            StoredValue::F32(v) => SqlValue::F32(v),
            StoredValue::F64(v) => SqlValue::F64(v),
            StoredValue::String(v) => SqlValue::String(v),
            StoredValue::Bytes(v) => SqlValue::Bytes(v),
            StoredValue::Decimal(v) => SqlValue::Decimal(Decimal::deserialize(v)),
            StoredValue::Uuid(v) => SqlValue::Uuid(Uuid::from_bytes(v)),
            StoredValue::Date(days) => SqlValue::Date(
                NaiveDate::from_num_days_from_ce_opt(days).ok_or_else(|| invalid("date"))?,
            ),
            StoredValue::Time { secs, nanos } => SqlValue::Time(
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                    .ok_or_else(|| invalid("time"))?,
            ),
            StoredValue::DateTime { secs, nanos } => SqlValue::DateTime(
                DateTime::from_timestamp(secs, nanos)
                    .ok_or_else(|| invalid("datetime"))?
                    .naive_utc(),
            ),
            StoredValue::DateTimeUtc { secs, nanos } => SqlValue::DateTimeUtc(
                DateTime::from_timestamp(secs, nanos).ok_or_else(|| invalid("datetimeoffset"))?,
            ),
        })
    }
}

/// Encode a row including its length prefix.
pub fn encode_row(row: &[SqlValue]) -> Result<Vec<u8>, ServerError> {
    let stored: Vec<StoredValue> = row.iter().map(StoredValue::from).collect();
    let body = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| ServerError::storage(format!("Failed to encode row: {}", e)))?;

    let len = u32::try_from(body.len())
        .map_err(|_| ServerError::storage("Row exceeds 4 GiB and cannot be buffered"))?;

    let mut framed = Vec::with_capacity(ROW_HEADER_LEN + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode a row body (without its length prefix).
pub fn decode_row(body: &[u8]) -> Result<Vec<SqlValue>, ServerError> {
    let (stored, _): (Vec<StoredValue>, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| ServerError::storage(format!("Failed to decode row: {}", e)))?;

    stored.into_iter().map(SqlValue::try_from).collect()
}

/// Shorten oversized text and binary values before they are buffered.
///
/// `max_chars` counts characters for text and bytes for binary.
pub fn truncate_value(value: SqlValue, max_chars: usize) -> SqlValue {
    match value {
        SqlValue::String(s) => match s.char_indices().nth(max_chars) {
            Some((end, _)) => SqlValue::String(s[..end].to_string()),
            None => SqlValue::String(s),
        },
        SqlValue::Bytes(mut b) if b.len() > max_chars => {
            b.truncate(max_chars);
            SqlValue::Bytes(b)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Utc};
    use std::str::FromStr;

    fn roundtrip(row: Vec<SqlValue>) -> Vec<SqlValue> {
        let framed = encode_row(&row).unwrap();
        let len = u32::from_le_bytes(framed[..ROW_HEADER_LEN].try_into().unwrap()) as usize;
        assert_eq!(len, framed.len() - ROW_HEADER_LEN);
        decode_row(&framed[ROW_HEADER_LEN..]).unwrap()
    }

    #[test]
    fn test_mixed_row_keeps_types() {
        let row = vec![
            SqlValue::I32(7),
            SqlValue::String("seven".to_string()),
            SqlValue::Null,
            SqlValue::I64(7),
            SqlValue::Bool(false),
        ];
        assert_eq!(roundtrip(row.clone()), row);
    }

    #[test]
    fn test_structured_values() {
        let dt = NaiveDateTime::parse_from_str("2024-02-29 13:45:10.123456", "%Y-%m-%d %H:%M:%S%.f")
            .unwrap();
        let row = vec![
            SqlValue::Decimal(Decimal::from_str("-12345.6789").unwrap()),
            SqlValue::Uuid(Uuid::new_v4()),
            SqlValue::Date(dt.date()),
            SqlValue::Time(dt.time()),
            SqlValue::DateTime(dt),
            SqlValue::DateTimeUtc(dt.and_utc().with_timezone(&Utc)),
            SqlValue::Bytes(vec![0, 1, 2, 255]),
            SqlValue::F64(1.5),
        ];
        assert_eq!(roundtrip(row.clone()), row);
    }

    #[test]
    fn test_corrupt_body_is_storage_error() {
        let err = decode_row(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, ServerError::Storage(_)));
    }

    #[test]
    fn test_truncate_value() {
        assert_eq!(
            truncate_value(SqlValue::String("héllo".to_string()), 2),
            SqlValue::String("hé".to_string())
        );
        assert_eq!(
            truncate_value(SqlValue::String("abc".to_string()), 3),
            SqlValue::String("abc".to_string())
        );
        assert_eq!(
            truncate_value(SqlValue::Bytes(vec![1, 2, 3]), 2),
            SqlValue::Bytes(vec![1, 2])
        );
        assert_eq!(truncate_value(SqlValue::I32(12345), 1), SqlValue::I32(12345));
    }
}
