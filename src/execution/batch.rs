//! Execution of one SQL batch.

use super::batch_parser::{BatchDefinition, SelectionData};
use super::events::{format_elapsed, format_timestamp, BatchSummary, EventEmitter, ResultMessage};
use super::result_set::{ResultSet, ResultSetWriter};
use super::settings::QueryOptions;
use crate::constants::{MSG_BEGIN_EXECUTION_LOOP, MSG_COMMANDS_COMPLETED, MSG_QUERY_CANCELLED};
use crate::database::{BatchItem, QueryConnection};
use crate::error::ServerError;
use crate::storage::ResultBuffer;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct BatchState {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    has_error: bool,
    rows_reported: bool,
    messages: Vec<ResultMessage>,
    result_sets: Vec<Arc<ResultSet>>,
}

/// One batch of a query.
#[derive(Debug)]
pub struct Batch {
    id: usize,
    text: String,
    selection: SelectionData,
    execution_count: u32,
    state: RwLock<BatchState>,
}

impl Batch {
    pub fn new(id: usize, definition: BatchDefinition) -> Self {
        Self {
            id,
            text: definition.text,
            selection: definition.selection,
            execution_count: definition.execution_count.max(1),
            state: RwLock::new(BatchState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn selection(&self) -> SelectionData {
        self.selection
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    pub fn has_error(&self) -> bool {
        self.state.read().has_error
    }

    pub fn has_executed(&self) -> bool {
        self.state.read().end.is_some()
    }

    pub fn messages(&self) -> Vec<ResultMessage> {
        self.state.read().messages.clone()
    }

    pub fn result_sets(&self) -> Vec<Arc<ResultSet>> {
        self.state.read().result_sets.clone()
    }

    /// Result set by index.
    pub fn result_set(&self, index: usize) -> Result<Arc<ResultSet>, ServerError> {
        let state = self.state.read();
        state
            .result_sets
            .get(index)
            .cloned()
            .ok_or_else(|| ServerError::result_set_index(index, state.result_sets.len()))
    }

    pub fn summary(&self) -> BatchSummary {
        let state = self.state.read();
        BatchSummary {
            id: self.id,
            selection: self.selection,
            execution_start: state.start.map(format_timestamp),
            execution_end: state.end.map(format_timestamp),
            execution_elapsed: match (state.start, state.end) {
                (Some(start), Some(end)) => Some(format_elapsed(end - start)),
                _ => None,
            },
            has_error: state.has_error,
            result_set_summaries: state.result_sets.iter().map(|rs| rs.summary()).collect(),
        }
    }

    fn add_message(&self, emitter: &EventEmitter, is_error: bool, text: impl Into<String>) {
        let message = ResultMessage::new(Some(self.id), is_error, text);
        self.state.write().messages.push(message.clone());
        emitter.message(message);
    }

    /// Run the batch on `conn`.
    ///
    /// Statement errors are recorded on the batch and return `Ok`. Errors that
    /// leave the connection unusable, and cancellation, are returned so the
    /// query stops.
    pub(crate) async fn execute(
        &self,
        conn: &mut dyn QueryConnection,
        buffer: &Arc<ResultBuffer>,
        options: &QueryOptions,
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<(), ServerError> {
        self.state.write().start = Some(Utc::now());
        emitter.batch_start(self.summary());

        if self.execution_count > 1 {
            self.add_message(emitter, false, MSG_BEGIN_EXECUTION_LOOP);
        }

        let mut outcome = Ok(());
        for iteration in 0..self.execution_count {
            debug!("Batch {} iteration {}", self.id, iteration + 1);
            match self.run_once(conn, buffer, options, emitter, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    self.add_message(emitter, true, MSG_QUERY_CANCELLED);
                    outcome = Err(e);
                    break;
                }
                Err(e) if e.is_connection_level() => {
                    self.state.write().has_error = true;
                    self.add_message(emitter, true, e.to_string());
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    self.state.write().has_error = true;
                    self.add_message(emitter, true, e.to_batch_message(self.selection.start_line));
                }
            }
        }

        if outcome.is_ok() {
            if self.execution_count > 1 {
                self.add_message(
                    emitter,
                    false,
                    format!("Batch execution completed {} times.", self.execution_count),
                );
            }
            let quiet = {
                let state = self.state.read();
                state.result_sets.is_empty() && !state.has_error && !state.rows_reported
            };
            if quiet {
                self.add_message(emitter, false, MSG_COMMANDS_COMPLETED);
            }
        }

        self.state.write().end = Some(Utc::now());
        emitter.batch_complete(self.summary());
        outcome
    }

    async fn run_once(
        &self,
        conn: &mut dyn QueryConnection,
        buffer: &Arc<ResultBuffer>,
        options: &QueryOptions,
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<(), ServerError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServerError::Cancelled),
            stream = conn.execute(&self.text) => stream?,
        };

        let mut current: Option<ResultSetWriter> = None;
        let mut counted = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ServerError::Cancelled),
                item = stream.next() => item,
            };

            match item {
                None => break,
                Some(Err(e)) => {
                    // Rows received before the error stay readable
                    self.complete_result_set(current.take(), emitter).await?;
                    return Err(e);
                }
                Some(Ok(BatchItem::ResultSet(columns))) => {
                    counted = true;
                    self.complete_result_set(current.take(), emitter).await?;
                    let result_set = {
                        let mut state = self.state.write();
                        let rs = Arc::new(ResultSet::new(
                            state.result_sets.len(),
                            self.id,
                            columns,
                            Arc::clone(buffer),
                        ));
                        state.result_sets.push(Arc::clone(&rs));
                        rs
                    };
                    current = Some(ResultSetWriter::begin(result_set, options).await?);
                }
                Some(Ok(BatchItem::Row(row))) => match current.as_mut() {
                    Some(writer) => writer.add_row(row).await?,
                    None => warn!("Batch {} received a row outside of a result set", self.id),
                },
                Some(Ok(BatchItem::Message(text))) => self.add_message(emitter, false, text),
                Some(Ok(BatchItem::RowsAffected(count))) => {
                    counted = true;
                    self.report_rows_affected(emitter, count);
                }
            }
        }
        drop(stream);

        self.complete_result_set(current.take(), emitter).await?;
        if !counted {
            let count = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ServerError::Cancelled),
                count = conn.rows_affected() => count?,
            };
            // DDL and SET leave 0 behind; only DML is worth reporting
            if let Some(count) = count.filter(|&n| n > 0) {
                self.report_rows_affected(emitter, count);
            }
        }
        Ok(())
    }

    fn report_rows_affected(&self, emitter: &EventEmitter, count: u64) {
        self.state.write().rows_reported = true;
        self.add_message(emitter, false, rows_affected(count));
    }

    async fn complete_result_set(
        &self,
        writer: Option<ResultSetWriter>,
        emitter: &EventEmitter,
    ) -> Result<(), ServerError> {
        if let Some(writer) = writer {
            let result_set = writer.finish().await?;
            self.add_message(emitter, false, rows_affected(result_set.row_count()));
            emitter.result_set_complete(result_set.summary());
        }
        Ok(())
    }
}

fn rows_affected(count: u64) -> String {
    if count == 1 {
        "(1 row affected)".to_string()
    } else {
        format!("({} rows affected)", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_affected_text() {
        assert_eq!(rows_affected(1), "(1 row affected)");
        assert_eq!(rows_affected(0), "(0 rows affected)");
        assert_eq!(rows_affected(12), "(12 rows affected)");
    }

    #[test]
    fn test_new_batch_summary() {
        let batch = Batch::new(
            3,
            BatchDefinition {
                text: "SELECT 1".to_string(),
                selection: SelectionData::new(4, 0, 4, 8),
                execution_count: 0,
            },
        );
        assert_eq!(batch.execution_count(), 1);
        assert!(!batch.has_executed());

        let summary = batch.summary();
        assert_eq!(summary.id, 3);
        assert!(summary.execution_start.is_none());
        assert!(summary.execution_elapsed.is_none());
        assert!(summary.result_set_summaries.is_empty());
        assert!(matches!(
            batch.result_set(0).unwrap_err(),
            ServerError::InvalidIndex { index: 0, count: 0, .. }
        ));
    }
}
