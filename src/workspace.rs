//! In-memory view of the editor's open documents.

use crate::execution::SelectionData;
use dashmap::DashMap;
use tracing::debug;

/// Source of document text for execute requests.
pub trait DocumentProvider: Send + Sync {
    /// Full text of `uri`, if the document is known.
    fn document_text(&self, uri: &str) -> Option<String>;

    /// Text of `uri` inside `selection`, or the whole document without one.
    fn get_text(&self, uri: &str, selection: Option<SelectionData>) -> Option<String> {
        let text = self.document_text(uri)?;
        Some(match selection {
            Some(selection) => text_in_range(&text, selection),
            None => text,
        })
    }
}

/// Documents synced through `textDocument/did*` notifications.
#[derive(Debug, Default)]
pub struct Workspace {
    documents: DashMap<String, String>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: impl Into<String>, text: impl Into<String>) {
        let uri = uri.into();
        debug!("Opened document {}", uri);
        self.documents.insert(uri, text.into());
    }

    /// Replace the text of a document (full sync).
    pub fn change(&self, uri: impl Into<String>, text: impl Into<String>) {
        self.documents.insert(uri.into(), text.into());
    }

    pub fn close(&self, uri: &str) {
        if self.documents.remove(uri).is_some() {
            debug!("Closed document {}", uri);
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentProvider for Workspace {
    fn document_text(&self, uri: &str) -> Option<String> {
        self.documents.get(uri).map(|doc| doc.value().clone())
    }
}

/// Slice `text` by 0-based line/column positions, end column exclusive.
///
/// Positions past the end of a line or of the document are clamped.
pub fn text_in_range(text: &str, selection: SelectionData) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let start_line = selection.start_line as usize;
    let end_line = (selection.end_line as usize).min(lines.len().saturating_sub(1));
    if start_line >= lines.len() || start_line > end_line {
        return String::new();
    }

    let mut out = String::new();
    for (index, line) in lines.iter().enumerate().take(end_line + 1).skip(start_line) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let from = if index == start_line { selection.start_column as usize } else { 0 };
        let to = if index == end_line {
            selection.end_column as usize
        } else {
            usize::MAX
        };

        if index > start_line {
            out.push('\n');
        }
        out.extend(line.chars().skip(from).take(to.saturating_sub(from)));
    }
    out
}
