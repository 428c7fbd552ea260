//! Splitting of SQL text into executable batches.
//!
//! Batches end at separator lines (`GO`, optionally `GO n`) and, when
//! statement splitting is enabled, at top-level semicolons. Separators inside
//! string literals, quoted or bracketed identifiers, comments, `BEGIN ... END`
//! and `CASE ... END` blocks, or the body of a module definition
//! (`CREATE PROCEDURE` and friends) are left alone.
//!
//! A separator group that touches batch-scoped state (local variables,
//! `DECLARE`, `ELSE`, `GOTO`) is never split on semicolons and goes to the
//! server whole.
//!
//! Columns are UTF-16 code units, as in LSP positions.

use crate::constants::{DEFAULT_BATCH_SEPARATOR, MAX_BATCH_EXECUTION_COUNT};
use crate::error::ServerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

static DEFAULT_SEPARATOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    separator_pattern(DEFAULT_BATCH_SEPARATOR).expect("valid GO pattern")
});

/// Range of text in a document, 0-based, end column exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionData {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SelectionData {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// Whether a cursor position falls inside the range (end inclusive).
    pub fn contains(&self, line: u32, column: u32) -> bool {
        (line, column) >= (self.start_line, self.start_column)
            && (line, column) <= (self.end_line, self.end_column)
    }
}

/// One batch found in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDefinition {
    /// SQL sent to the server
    pub text: String,

    /// Where the batch sits in the document
    pub selection: SelectionData,

    /// How many times to run it (`GO n`)
    pub execution_count: u32,
}

/// Options controlling how text is split.
#[derive(Debug, Clone)]
pub struct ParseOptions<'a> {
    pub batch_separator: &'a str,
    pub split_statements: bool,
    /// Document position of the first character of the text
    pub origin: (u32, u32),
}

impl Default for ParseOptions<'_> {
    fn default() -> Self {
        Self {
            batch_separator: DEFAULT_BATCH_SEPARATOR,
            split_statements: true,
            origin: (0, 0),
        }
    }
}

fn separator_pattern(separator: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?i)^\s*{}(?:\s+(\d+))?\s*(?:--.*)?$",
        regex::escape(separator)
    ))
}

/// Split `text` into batches.
pub fn parse_batches(text: &str, options: &ParseOptions<'_>) -> Result<Vec<BatchDefinition>, ServerError> {
    let custom;
    let separator = if options.batch_separator.eq_ignore_ascii_case(DEFAULT_BATCH_SEPARATOR) {
        &*DEFAULT_SEPARATOR_PATTERN
    } else {
        custom = separator_pattern(options.batch_separator).map_err(|e| {
            ServerError::invalid_input(format!("Invalid batch separator: {}", e))
        })?;
        &custom
    };

    let mut splitter = Splitter::new(options.split_statements);
    let mut line_start = 0usize;

    for (line_no, raw_line) in text.split_inclusive('\n').enumerate() {
        let line_no = line_no as u32;
        let line = raw_line.trim_end_matches(['\n', '\r']);

        if splitter.state == LexState::Code {
            if let Some(caps) = separator.captures(line) {
                let count = match caps.get(1) {
                    Some(m) => parse_count(m.as_str())?,
                    None => 1,
                };
                splitter.end_group(count);
                line_start += raw_line.len();
                continue;
            }
        }

        splitter.scan_line(raw_line, line_start, line_no);
        line_start += raw_line.len();
    }
    splitter.end_group(1);

    let (origin_line, origin_col) = options.origin;
    let shift = |line: u32, col: u32| {
        if line == 0 {
            (origin_line, origin_col + col)
        } else {
            (origin_line + line, col)
        }
    };

    Ok(splitter
        .finished
        .into_iter()
        .map(|piece| {
            let (start_line, start_column) = shift(piece.start.0, piece.start.1);
            let (end_line, end_column) = shift(piece.end.0, piece.end.1);
            BatchDefinition {
                text: text[piece.span].to_string(),
                selection: SelectionData::new(start_line, start_column, end_line, end_column),
                execution_count: piece.count,
            }
        })
        .collect())
}

/// Pick the batch a cursor points at: the one containing it, else the
/// closest one before it, else the first.
pub fn batch_at_position(batches: &[BatchDefinition], line: u32, column: u32) -> Option<&BatchDefinition> {
    batches
        .iter()
        .find(|b| b.selection.contains(line, column))
        .or_else(|| {
            batches.iter().rev().find(|b| {
                (b.selection.end_line, b.selection.end_column) <= (line, column)
            })
        })
        .or_else(|| batches.first())
}

fn parse_count(raw: &str) -> Result<u32, ServerError> {
    match raw.parse::<u32>() {
        Ok(n) if (1..=MAX_BATCH_EXECUTION_COUNT).contains(&n) => Ok(n),
        _ => Err(ServerError::invalid_input(format!(
            "Batch repeat count must be between 1 and {}, got {}",
            MAX_BATCH_EXECUTION_COUNT, raw
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Code,
    LineComment,
    BlockComment(u32),
    Literal,
    QuotedIdentifier,
    BracketIdentifier,
}

#[derive(Debug)]
struct Piece {
    span: Range<usize>,
    start: (u32, u32),
    end: (u32, u32),
    count: u32,
}

struct Splitter {
    split_statements: bool,
    state: LexState,

    // Current statement
    start: Option<(usize, u32, u32)>,
    end: (usize, u32, u32),
    has_code: bool,
    depth: u32,
    pending_begin: bool,
    leading_words: Vec<String>,
    module_body: bool,
    word: String,

    // Statements since the last separator line
    group: Vec<Piece>,
    group_scoped: bool,
    finished: Vec<Piece>,
}

impl Splitter {
    fn new(split_statements: bool) -> Self {
        Self {
            split_statements,
            state: LexState::Code,
            start: None,
            end: (0, 0, 0),
            has_code: false,
            depth: 0,
            pending_begin: false,
            leading_words: Vec::new(),
            module_body: false,
            word: String::new(),
            group: Vec::new(),
            group_scoped: false,
            finished: Vec::new(),
        }
    }

    fn scan_line(&mut self, raw_line: &str, line_start: usize, line: u32) {
        let chars: Vec<(usize, char)> = raw_line.char_indices().collect();
        let mut columns = Vec::with_capacity(chars.len() + 1);
        let mut utf16 = 0u32;
        for &(_, c) in &chars {
            columns.push(utf16);
            utf16 += c.len_utf16() as u32;
        }
        columns.push(utf16);
        let mut k = 0;

        while k < chars.len() {
            let (idx, ch) = chars[k];
            let byte = line_start + idx;
            let col = columns[k];
            let next = chars.get(k + 1).map(|&(_, c)| c);
            let mut width = 1;

            match self.state {
                LexState::Code => match (ch, next) {
                    ('-', Some('-')) => {
                        self.flush_word();
                        self.state = LexState::LineComment;
                        width = 2;
                    }
                    ('/', Some('*')) => {
                        self.flush_word();
                        self.state = LexState::BlockComment(1);
                        width = 2;
                    }
                    ('\'', _) => {
                        self.flush_word();
                        self.state = LexState::Literal;
                        self.has_code = true;
                    }
                    ('"', _) => {
                        self.flush_word();
                        self.state = LexState::QuotedIdentifier;
                        self.has_code = true;
                    }
                    ('[', _) => {
                        self.flush_word();
                        self.state = LexState::BracketIdentifier;
                        self.has_code = true;
                    }
                    _ if is_word_char(ch) => {
                        self.word.push(ch);
                        self.has_code = true;
                    }
                    _ => {
                        self.flush_word();
                        if !ch.is_whitespace() && ch != ';' {
                            self.has_code = true;
                        }
                        if ch == ';'
                            && self.split_statements
                            && self.depth == 0
                            && !self.module_body
                        {
                            self.mark(byte, ch.len_utf8(), line, col, 1);
                            self.end_statement();
                            k += 1;
                            continue;
                        }
                    }
                },
                LexState::LineComment => {
                    if ch == '\n' {
                        self.state = LexState::Code;
                    }
                }
                LexState::BlockComment(depth) => match (ch, next) {
                    ('*', Some('/')) => {
                        self.state = if depth <= 1 {
                            LexState::Code
                        } else {
                            LexState::BlockComment(depth - 1)
                        };
                        width = 2;
                    }
                    ('/', Some('*')) => {
                        self.state = LexState::BlockComment(depth + 1);
                        width = 2;
                    }
                    _ => {}
                },
                LexState::Literal => width = self.close_quoted(ch, next, '\''),
                LexState::QuotedIdentifier => width = self.close_quoted(ch, next, '"'),
                LexState::BracketIdentifier => width = self.close_quoted(ch, next, ']'),
            }

            if !ch.is_whitespace() {
                let bytes = chars[k..k + width]
                    .iter()
                    .map(|&(_, c)| c.len_utf8())
                    .sum();
                self.mark(byte, bytes, line, col, columns[k + width] - col);
            }
            k += width;
        }
    }

    /// Handle a possible closing quote; doubled quotes are escapes.
    fn close_quoted(&mut self, ch: char, next: Option<char>, quote: char) -> usize {
        if ch != quote {
            return 1;
        }
        if next == Some(quote) {
            return 2;
        }
        self.state = LexState::Code;
        1
    }

    fn mark(&mut self, byte: usize, len: usize, line: u32, col: u32, width: u32) {
        if self.start.is_none() {
            self.start = Some((byte, line, col));
        }
        self.end = (byte + len, line, col + width);
    }

    fn flush_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let upper = self.word.to_ascii_uppercase();
        self.word.clear();

        if is_local_variable(&upper) || matches!(upper.as_str(), "DECLARE" | "ELSE" | "GOTO") {
            self.group_scoped = true;
        }

        if self.leading_words.len() < 4 {
            self.leading_words.push(upper.clone());
            if matches!(self.leading_words[0].as_str(), "CREATE" | "ALTER")
                && self.leading_words[1..].iter().any(|w| {
                    matches!(
                        w.as_str(),
                        "PROC" | "PROCEDURE" | "FUNCTION" | "TRIGGER" | "VIEW"
                    )
                })
            {
                self.module_body = true;
            }
        }

        if self.pending_begin {
            self.pending_begin = false;
            if matches!(
                upper.as_str(),
                "TRAN" | "TRANSACTION" | "DISTRIBUTED" | "DIALOG" | "CONVERSATION"
            ) {
                self.depth = self.depth.saturating_sub(1);
            }
        }

        match upper.as_str() {
            "BEGIN" => {
                self.depth += 1;
                self.pending_begin = true;
            }
            "CASE" => self.depth += 1,
            "END" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn end_statement(&mut self) {
        self.flush_word();
        if let Some((byte, line, col)) = self.start.take() {
            if self.has_code {
                self.group.push(Piece {
                    span: byte..self.end.0,
                    start: (line, col),
                    end: (self.end.1, self.end.2),
                    count: 1,
                });
            }
        }
        self.has_code = false;
        self.depth = 0;
        self.pending_begin = false;
        self.leading_words.clear();
        self.module_body = false;
    }

    /// Close everything since the previous separator line.
    fn end_group(&mut self, count: u32) {
        self.end_statement();
        self.state = LexState::Code;
        let scoped = std::mem::take(&mut self.group_scoped);

        // `GO n` repeats the whole group as one batch
        if (count > 1 || scoped) && self.group.len() > 1 {
            if let (Some(first), Some(last)) = (self.group.first(), self.group.last()) {
                let merged = Piece {
                    span: first.span.start..last.span.end,
                    start: first.start,
                    end: last.end,
                    count,
                };
                self.group.clear();
                self.finished.push(merged);
                return;
            }
        }

        for mut piece in self.group.drain(..) {
            piece.count = count;
            self.finished.push(piece);
        }
    }
}

/// `@name` but not a `@@FUNCTION`.
fn is_local_variable(word: &str) -> bool {
    word.len() > 1 && word.starts_with('@') && !word.starts_with("@@")
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '@' | '#' | '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(text: &str) -> Vec<BatchDefinition> {
        parse_batches(text, &ParseOptions::default()).unwrap()
    }

    fn texts(text: &str) -> Vec<String> {
        split(text).into_iter().map(|b| b.text).collect()
    }

    #[test]
    fn test_semicolon_split() {
        let batches = split("SELECT 1 AS a; SELECT 'x' AS b");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].text, "SELECT 1 AS a;");
        assert_eq!(batches[1].text, "SELECT 'x' AS b");
        assert_eq!(batches[0].selection, SelectionData::new(0, 0, 0, 14));
        assert_eq!(batches[1].selection, SelectionData::new(0, 15, 0, 30));
    }

    #[test]
    fn test_go_separator() {
        let batches = split("SELECT 1\nGO\n  \ngo -- done\nSELECT 2\n");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].text, "SELECT 1");
        assert_eq!(batches[1].text, "SELECT 2");
        assert_eq!(batches[1].selection, SelectionData::new(4, 0, 4, 8));
    }

    #[test]
    fn test_go_repeat_count() {
        let batches = split("INSERT INTO t VALUES (1)\nGO 3");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].execution_count, 3);

        let grouped = split("SELECT 1; SELECT 2\nGO 2\nSELECT 3");
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].text, "SELECT 1; SELECT 2");
        assert_eq!(grouped[0].execution_count, 2);
        assert_eq!(grouped[1].execution_count, 1);

        assert!(parse_batches("SELECT 1\nGO 0", &ParseOptions::default()).is_err());
    }

    #[test]
    fn test_separators_inside_literals_and_comments() {
        assert_eq!(
            texts("SELECT 'a;b', [c;d], \"e;f\" -- g;h\n/* i;\nGO\n j */ FROM t"),
            vec!["SELECT 'a;b', [c;d], \"e;f\" -- g;h\n/* i;\nGO\n j */ FROM t"]
        );
        assert_eq!(texts("SELECT 'it''s;'; SELECT 2"), vec!["SELECT 'it''s;';", "SELECT 2"]);
        assert_eq!(texts("/* outer /* inner */ ; */ SELECT 1"), vec!["/* outer /* inner */ ; */ SELECT 1"]);
    }

    #[test]
    fn test_blocks_are_not_split() {
        assert_eq!(
            texts("IF 1 = 1 BEGIN SELECT 1; SELECT 2; END; SELECT 3"),
            vec!["IF 1 = 1 BEGIN SELECT 1; SELECT 2; END;", "SELECT 3"]
        );
        assert_eq!(
            texts("BEGIN TRAN; UPDATE t SET a = 1; COMMIT"),
            vec!["BEGIN TRAN;", "UPDATE t SET a = 1;", "COMMIT"]
        );
        assert_eq!(
            texts("CREATE PROCEDURE p AS SELECT 1; SELECT 2\nGO\nEXEC p"),
            vec!["CREATE PROCEDURE p AS SELECT 1; SELECT 2", "EXEC p"]
        );
    }

    #[test]
    fn test_batch_scoped_groups_stay_whole() {
        assert_eq!(
            texts("DECLARE @x INT = 5; SELECT @x AS x"),
            vec!["DECLARE @x INT = 5; SELECT @x AS x"]
        );
        assert_eq!(
            texts("IF 1 = 1 SELECT 1; ELSE SELECT 2;"),
            vec!["IF 1 = 1 SELECT 1; ELSE SELECT 2;"]
        );

        let batches = split(
            "DECLARE @t TABLE (id INT);\nINSERT @t VALUES (1);\nSELECT * FROM @t;\nGO\nSELECT 2; SELECT @@VERSION",
        );
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches[0].text,
            "DECLARE @t TABLE (id INT);\nINSERT @t VALUES (1);\nSELECT * FROM @t;"
        );
        assert_eq!(batches[0].selection, SelectionData::new(0, 0, 2, 17));
        assert_eq!(batches[0].execution_count, 1);
        assert_eq!(batches[1].text, "SELECT 2;");
        assert_eq!(batches[2].text, "SELECT @@VERSION");
    }

    #[test]
    fn test_columns_count_utf16_units() {
        // U+1F600 is two UTF-16 code units
        let batches = split("SELECT '\u{1F600}'; SELECT 2");
        assert_eq!(batches[0].selection, SelectionData::new(0, 0, 0, 12));
        assert_eq!(batches[1].selection, SelectionData::new(0, 13, 0, 21));
    }

    #[test]
    fn test_empty_segments_dropped() {
        assert!(split("").is_empty());
        assert!(split("  \n\t\nGO\n;;\n").is_empty());
        assert_eq!(texts("SELECT 1;\n-- trailing note"), vec!["SELECT 1;"]);
    }

    #[test]
    fn test_no_statement_split_when_disabled() {
        let options = ParseOptions {
            split_statements: false,
            ..Default::default()
        };
        let batches = parse_batches("SELECT 1; SELECT 2", &options).unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_custom_separator_and_origin() {
        let options = ParseOptions {
            batch_separator: "RUN",
            split_statements: false,
            origin: (10, 4),
        };
        let batches = parse_batches("SELECT 1\nrun\nSELECT 2\nGO", &options).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].selection, SelectionData::new(10, 4, 10, 12));
        assert_eq!(batches[1].text, "SELECT 2\nGO");
        assert_eq!(batches[1].selection.start_line, 12);
        assert_eq!(batches[1].selection.start_column, 0);
    }

    #[test]
    fn test_batch_at_position() {
        let batches = split("SELECT 1;\n\nSELECT 2;\nSELECT 3;");
        assert_eq!(batch_at_position(&batches, 2, 3).unwrap().text, "SELECT 2;");
        assert_eq!(batch_at_position(&batches, 1, 0).unwrap().text, "SELECT 1;");
        assert_eq!(batch_at_position(&batches, 40, 0).unwrap().text, "SELECT 3;");
        assert!(batch_at_position(&[], 0, 0).is_none());
    }
}
