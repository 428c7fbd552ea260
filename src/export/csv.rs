//! CSV writer.

use super::ResultWriter;
use crate::database::{DbColumn, SqlValue};
use crate::error::ServerError;

/// Writes RFC 4180 style CSV with a configurable delimiter.
#[derive(Debug)]
pub struct CsvWriter {
    delimiter: char,
    include_headers: bool,
}

impl CsvWriter {
    pub fn new(delimiter: char, include_headers: bool) -> Self {
        Self {
            delimiter,
            include_headers,
        }
    }

    fn escape(&self, value: &str) -> String {
        if value.contains(self.delimiter)
            || value.contains('"')
            || value.contains('\n')
            || value.contains('\r')
        {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    fn write_line(&self, fields: impl Iterator<Item = String>, out: &mut Vec<u8>) {
        let mut delimiter = [0u8; 4];
        let delimiter = self.delimiter.encode_utf8(&mut delimiter).as_bytes();
        for (i, field) in fields.enumerate() {
            if i > 0 {
                out.extend_from_slice(delimiter);
            }
            out.extend_from_slice(self.escape(&field).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }
}

impl ResultWriter for CsvWriter {
    fn begin(&mut self, columns: &[DbColumn], out: &mut Vec<u8>) -> Result<(), ServerError> {
        if self.include_headers {
            self.write_line(columns.iter().map(|c| c.column_name.clone()), out);
        }
        Ok(())
    }

    fn write_row(
        &mut self,
        _columns: &[DbColumn],
        row: &[SqlValue],
        out: &mut Vec<u8>,
    ) -> Result<(), ServerError> {
        // NULL exports as an empty field
        self.write_line(
            row.iter().map(|v| {
                if v.is_null() {
                    String::new()
                } else {
                    v.to_display_string()
                }
            }),
            out,
        );
        Ok(())
    }

    fn end(&mut self, _out: &mut Vec<u8>) -> Result<(), ServerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::tests::render;

    fn columns() -> Vec<DbColumn> {
        vec![DbColumn::new("id", 0, "INT"), DbColumn::new("name", 1, "NVARCHAR")]
    }

    #[test]
    fn test_csv_output() {
        let rows = vec![
            vec![SqlValue::I32(1), SqlValue::String("value, with comma".to_string())],
            vec![SqlValue::I32(2), SqlValue::Null],
        ];
        let csv = render(&mut CsvWriter::new(',', true), &columns(), &rows);
        assert_eq!(csv, "id,name\r\n1,\"value, with comma\"\r\n2,\r\n");
    }

    #[test]
    fn test_quotes_and_custom_delimiter() {
        let rows = vec![vec![
            SqlValue::I32(1),
            SqlValue::String("say \"hi\"; bye".to_string()),
        ]];
        let csv = render(&mut CsvWriter::new(';', false), &columns(), &rows);
        assert_eq!(csv, "1;\"say \"\"hi\"\"; bye\"\r\n");
    }
}
