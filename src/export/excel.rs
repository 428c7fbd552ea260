//! Excel writer producing SpreadsheetML 2003 XML, which Excel opens natively.

use super::ResultWriter;
use crate::database::{DbColumn, SqlValue};
use crate::error::ServerError;

const HEADER: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
    "<?mso-application progid=\"Excel.Sheet\"?>\n",
    "<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" ",
    "xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n",
    " <Styles><Style ss:ID=\"header\"><Font ss:Bold=\"1\"/></Style></Styles>\n",
    " <Worksheet ss:Name=\"Results\">\n",
    "  <Table>\n",
);

const FOOTER: &str = "  </Table>\n </Worksheet>\n</Workbook>\n";

/// Writes a single worksheet with a bold header row.
#[derive(Debug, Default)]
pub struct ExcelWriter;

impl ExcelWriter {
    pub fn new() -> Self {
        Self
    }
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\n' => escaped.push_str("&#10;"),
            // Other control characters are not allowed in XML 1.0
            c if c.is_control() && c != '\t' && c != '\r' => {}
            c => escaped.push(c),
        }
    }
    escaped
}

fn cell(kind: &str, value: &str, style: Option<&str>) -> String {
    let style = style
        .map(|s| format!(" ss:StyleID=\"{}\"", s))
        .unwrap_or_default();
    format!(
        "<Cell{}><Data ss:Type=\"{}\">{}</Data></Cell>",
        style,
        kind,
        escape_xml(value)
    )
}

impl ResultWriter for ExcelWriter {
    fn begin(&mut self, columns: &[DbColumn], out: &mut Vec<u8>) -> Result<(), ServerError> {
        out.extend_from_slice(HEADER.as_bytes());
        out.extend_from_slice(b"   <Row>");
        for column in columns {
            out.extend_from_slice(cell("String", &column.column_name, Some("header")).as_bytes());
        }
        out.extend_from_slice(b"</Row>\n");
        Ok(())
    }

    fn write_row(
        &mut self,
        _columns: &[DbColumn],
        row: &[SqlValue],
        out: &mut Vec<u8>,
    ) -> Result<(), ServerError> {
        out.extend_from_slice(b"   <Row>");
        for value in row {
            let rendered = match value {
                // An empty cell keeps later cells in their columns
                SqlValue::Null => "<Cell/>".to_string(),
                SqlValue::Bool(b) => cell("Boolean", if *b { "1" } else { "0" }, None),
                v if v.is_numeric() => cell("Number", &v.to_display_string(), None),
                v => cell("String", &v.to_display_string(), None),
            };
            out.extend_from_slice(rendered.as_bytes());
        }
        out.extend_from_slice(b"</Row>\n");
        Ok(())
    }

    fn end(&mut self, out: &mut Vec<u8>) -> Result<(), ServerError> {
        out.extend_from_slice(FOOTER.as_bytes());
        Ok(())
    }
}
