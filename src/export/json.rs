//! JSON writer.

use super::ResultWriter;
use crate::database::{DbColumn, SqlValue};
use crate::error::ServerError;

/// Writes an array with one object per row, keys in column order.
#[derive(Debug, Default)]
pub struct JsonWriter {
    rows_written: u64,
}

impl JsonWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultWriter for JsonWriter {
    fn begin(&mut self, _columns: &[DbColumn], out: &mut Vec<u8>) -> Result<(), ServerError> {
        out.push(b'[');
        Ok(())
    }

    fn write_row(
        &mut self,
        columns: &[DbColumn],
        row: &[SqlValue],
        out: &mut Vec<u8>,
    ) -> Result<(), ServerError> {
        if self.rows_written > 0 {
            out.push(b',');
        }
        out.extend_from_slice(b"\n  {");
        for (i, (column, value)) in columns.iter().zip(row).enumerate() {
            if i > 0 {
                out.extend_from_slice(b", ");
            }
            serde_json::to_writer(&mut *out, &column.column_name)
                .map_err(|e| ServerError::export(e.to_string()))?;
            out.extend_from_slice(b": ");
            serde_json::to_writer(&mut *out, value)
                .map_err(|e| ServerError::export(e.to_string()))?;
        }
        out.push(b'}');
        self.rows_written += 1;
        Ok(())
    }

    fn end(&mut self, out: &mut Vec<u8>) -> Result<(), ServerError> {
        if self.rows_written > 0 {
            out.push(b'\n');
        }
        out.push(b']');
        Ok(())
    }
}
