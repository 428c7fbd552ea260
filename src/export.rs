//! Result set export (CSV, Excel, JSON).
//!
//! Writers render into an in-memory chunk that the caller flushes to disk
//! after every window of rows, so a whole result set never has to be held
//! in memory.

mod csv;
mod excel;
mod json;

pub use self::csv::CsvWriter;
pub use self::excel::ExcelWriter;
pub use self::json::JsonWriter;

use crate::database::{DbColumn, SqlValue};
use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Export output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    Csv,
    Excel,
    Json,
}

impl SaveFormat {
    /// Get the format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveFormat::Csv => "csv",
            SaveFormat::Excel => "excel",
            SaveFormat::Json => "json",
        }
    }
}

/// Rows and columns to export, all bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSelection {
    pub row_start_index: u64,
    pub row_end_index: u64,
    pub column_start_index: usize,
    pub column_end_index: usize,
}

/// Options of one save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    pub file_path: PathBuf,
    pub format: SaveFormat,
    pub selection: Option<SaveSelection>,
    /// CSV only
    pub include_headers: bool,
    /// CSV only
    pub delimiter: char,
}

impl SaveOptions {
    pub fn new(file_path: impl Into<PathBuf>, format: SaveFormat) -> Self {
        Self {
            file_path: file_path.into(),
            format,
            selection: None,
            include_headers: true,
            delimiter: ',',
        }
    }
}

/// Serializes rows of one result set into a file format.
pub trait ResultWriter: Send {
    /// Write anything that precedes the rows.
    fn begin(&mut self, columns: &[DbColumn], out: &mut Vec<u8>) -> Result<(), ServerError>;

    /// Write one row; `row` holds exactly one value per column.
    fn write_row(
        &mut self,
        columns: &[DbColumn],
        row: &[SqlValue],
        out: &mut Vec<u8>,
    ) -> Result<(), ServerError>;

    /// Write anything that follows the rows.
    fn end(&mut self, out: &mut Vec<u8>) -> Result<(), ServerError>;
}

/// Creates writers for save requests.
pub trait ResultWriterFactory: Send + Sync {
    fn create(&self, options: &SaveOptions) -> Result<Box<dyn ResultWriter>, ServerError>;
}

/// Factory for the built-in formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWriterFactory;

impl ResultWriterFactory for DefaultWriterFactory {
    fn create(&self, options: &SaveOptions) -> Result<Box<dyn ResultWriter>, ServerError> {
        Ok(match options.format {
            SaveFormat::Csv => Box::new(CsvWriter::new(options.delimiter, options.include_headers)),
            SaveFormat::Excel => Box::new(ExcelWriter::new()),
            SaveFormat::Json => Box::new(JsonWriter::new()),
        })
    }
}
