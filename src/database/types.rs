//! Cell values and column metadata read from SQL Server rows.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tiberius::Row;
use uuid::Uuid;

/// A single cell value. Serializes to plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
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
    Decimal(Decimal),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text shown in the results grid and written by the exporters.
    pub fn to_display_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::I8(v) => v.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::String(v) => v.clone(),
            SqlValue::Bytes(v) => format!("0x{}", hex::encode(v)),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Date(v) => v.to_string(),
            SqlValue::Time(v) => v.to_string(),
            SqlValue::DateTime(v) => v.to_string(),
            SqlValue::DateTimeUtc(v) => v.to_rfc3339(),
        }
    }

    /// Whether the value is numeric (left unquoted by exporters).
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlValue::I8(_)
                | SqlValue::I16(_)
                | SqlValue::I32(_)
                | SqlValue::I64(_)
                | SqlValue::F32(_)
                | SqlValue::F64(_)
                | SqlValue::Decimal(_)
        )
    }
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbColumn {
    /// Column name (empty for unnamed expressions).
    pub column_name: String,

    /// Zero-based position within the result set.
    pub column_ordinal: usize,

    /// SQL type name as reported by the server.
    pub data_type_name: String,
}

impl DbColumn {
    /// Create column metadata.
    pub fn new(
        column_name: impl Into<String>,
        column_ordinal: usize,
        data_type_name: impl Into<String>,
    ) -> Self {
        Self {
            column_name: column_name.into(),
            column_ordinal,
            data_type_name: data_type_name.into(),
        }
    }

    /// Whether cells of this column hold XML (stored with the XML char limit).
    pub fn is_xml(&self) -> bool {
        self.data_type_name.eq_ignore_ascii_case("XML")
            || self.column_name == crate::constants::SHOWPLAN_XML_COLUMN_NAME
    }
}

/// A cell of a result subset as sent to the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCellValue {
    /// Text rendering of the value.
    pub display_value: String,

    /// Whether the underlying value is NULL.
    pub is_null: bool,

    /// Row index within the result set.
    pub row_id: u64,

    /// Typed value.
    pub value: SqlValue,
}

impl DbCellValue {
    /// Build a cell from a stored value.
    pub fn new(row_id: u64, value: SqlValue) -> Self {
        Self {
            display_value: value.to_display_string(),
            is_null: value.is_null(),
            row_id,
            value,
        }
    }
}

/// Conversion from Tiberius rows and columns.
pub struct TypeMapper;

impl TypeMapper {
    /// Extract every column of a Tiberius row.
    pub fn extract_row(row: &Row) -> Vec<SqlValue> {
        (0..row.columns().len())
            .map(|idx| Self::extract_column(row, idx))
            .collect()
    }

    /// Read one cell, trying the Tiberius conversions from the most to the
    /// least common column type. Unsupported types come back as NULL.
    pub fn extract_column(row: &Row, idx: usize) -> SqlValue {
        if idx >= row.columns().len() {
            return SqlValue::Null;
        }

        macro_rules! try_as {
            ($ty:ty => $map:expr) => {
                if let Ok(Some(v)) = row.try_get::<$ty, _>(idx) {
                    return $map(v);
                }
            };
        }

        try_as!(&str => |v: &str| SqlValue::String(v.to_owned()));
        try_as!(i32 => SqlValue::I32);
        try_as!(i64 => SqlValue::I64);
        try_as!(i16 => SqlValue::I16);
        // TINYINT is unsigned on the server, widen so 128..=255 survive
        try_as!(u8 => |v: u8| SqlValue::I16(i16::from(v)));
        try_as!(f64 => SqlValue::F64);
        try_as!(f32 => SqlValue::F32);
        try_as!(Decimal => SqlValue::Decimal);
        try_as!(bool => SqlValue::Bool);
        try_as!(Uuid => SqlValue::Uuid);
        try_as!(DateTime<FixedOffset> => |v: DateTime<FixedOffset>| {
            SqlValue::DateTimeUtc(v.with_timezone(&Utc))
        });
        try_as!(NaiveDateTime => SqlValue::DateTime);
        try_as!(NaiveDate => SqlValue::Date);
        try_as!(NaiveTime => SqlValue::Time);
        try_as!(&[u8] => |v: &[u8]| SqlValue::Bytes(v.to_vec()));

        SqlValue::Null
    }

    /// Map Tiberius column metadata to result set columns.
    pub fn columns(columns: &[tiberius::Column]) -> Vec<DbColumn> {
        columns
            .iter()
            .enumerate()
            .map(|(ordinal, col)| DbColumn::new(col.name(), ordinal, Self::sql_type_name(col)))
            .collect()
    }

    /// Server type name reported for a column.
    pub fn sql_type_name(col: &tiberius::Column) -> &'static str {
        use tiberius::ColumnType;

        match col.column_type() {
            ColumnType::Null => "NULL",
            ColumnType::Int1 => "TINYINT",
            ColumnType::Int2 => "SMALLINT",
            ColumnType::Int4 => "INT",
            ColumnType::Int8 => "BIGINT",
            ColumnType::Float4 => "REAL",
            ColumnType::Float8 => "FLOAT",
            ColumnType::Money => "MONEY",
            ColumnType::Money4 => "SMALLMONEY",
            ColumnType::Datetime => "DATETIME",
            ColumnType::Datetime4 => "SMALLDATETIME",
            ColumnType::Bit => "BIT",
            ColumnType::Guid => "UNIQUEIDENTIFIER",
            ColumnType::Decimaln => "DECIMAL",
            ColumnType::Numericn => "NUMERIC",
            ColumnType::Bitn => "BIT",
            ColumnType::Intn => "INT",
            ColumnType::Floatn => "FLOAT",
            ColumnType::Datetimen => "DATETIME",
            ColumnType::Daten => "DATE",
            ColumnType::Timen => "TIME",
            ColumnType::Datetime2 => "DATETIME2",
            ColumnType::DatetimeOffsetn => "DATETIMEOFFSET",
            ColumnType::BigVarBin => "VARBINARY",
            ColumnType::BigVarChar => "VARCHAR",
            ColumnType::BigBinary => "BINARY",
            ColumnType::BigChar => "CHAR",
            ColumnType::NVarchar => "NVARCHAR",
            ColumnType::NChar => "NCHAR",
            ColumnType::Xml => "XML",
            ColumnType::Text => "TEXT",
            ColumnType::Image => "IMAGE",
            ColumnType::NText => "NTEXT",
            ColumnType::SSVariant => "SQL_VARIANT",
            _ => "UNKNOWN",
        }
    }
}

mod hex {
    use std::fmt::Write;

    /// Upper-case hex, two digits per byte.
    pub fn encode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
                let _ = write!(out, "{b:02X}");
                out
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_display() {
        assert_eq!(SqlValue::Null.to_display_string(), "NULL");
        assert_eq!(SqlValue::I32(42).to_display_string(), "42");
        assert_eq!(
            SqlValue::String("hello".to_string()).to_display_string(),
            "hello"
        );
        assert_eq!(SqlValue::Bool(true).to_display_string(), "true");
        assert_eq!(
            SqlValue::Bytes(vec![0xDE, 0xAD]).to_display_string(),
            "0xDEAD"
        );
    }

    #[test]
    fn test_sql_value_is_null() {
        assert!(SqlValue::Null.is_null());
        assert!(!SqlValue::I32(0).is_null());
    }

    #[test]
    fn test_cell_value() {
        let cell = DbCellValue::new(7, SqlValue::Null);
        assert!(cell.is_null);
        assert_eq!(cell.display_value, "NULL");
        assert_eq!(cell.row_id, 7);
    }

    #[test]
    fn test_column_xml_detection() {
        assert!(DbColumn::new("doc", 0, "XML").is_xml());
        assert!(DbColumn::new(crate::constants::SHOWPLAN_XML_COLUMN_NAME, 0, "NTEXT").is_xml());
        assert!(!DbColumn::new("name", 1, "NVARCHAR").is_xml());
    }

    #[test]
    fn test_cell_serializes_camel_case() {
        let json = serde_json::to_value(DbCellValue::new(0, SqlValue::I32(1))).unwrap();
        assert_eq!(json["displayValue"], "1");
        assert_eq!(json["isNull"], false);
        assert_eq!(json["value"], 1);
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex::encode(&[0xDE, 0xAD, 0xBE, 0xEF]), "DEADBEEF");
        assert_eq!(hex::encode(&[]), "");
    }
}
