//! Lifecycle events emitted while a query runs.
//!
//! Events for one query are sent from its worker task over an unbounded
//! channel, so receivers see them in the order they happened.

use super::batch_parser::SelectionData;
use crate::database::DbColumn;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Summary of a result set, sent when it completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetSummary {
    pub id: usize,
    pub batch_id: usize,
    pub row_count: u64,
    pub column_info: Vec<DbColumn>,
    pub complete: bool,
}

/// Summary of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: usize,
    pub selection: SelectionData,
    pub execution_start: Option<String>,
    pub execution_end: Option<String>,
    pub execution_elapsed: Option<String>,
    pub has_error: bool,
    pub result_set_summaries: Vec<ResultSetSummary>,
}

/// A message produced while a batch ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub batch_id: Option<usize>,
    pub is_error: bool,
    pub time: String,
    pub message: String,
}

impl ResultMessage {
    pub fn new(batch_id: Option<usize>, is_error: bool, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            is_error,
            time: format_timestamp(Utc::now()),
            message: message.into(),
        }
    }
}

/// Events emitted while a query executes.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    BatchStart {
        owner_uri: String,
        batch: BatchSummary,
    },
    BatchComplete {
        owner_uri: String,
        batch: BatchSummary,
    },
    Message {
        owner_uri: String,
        message: ResultMessage,
    },
    ResultSetComplete {
        owner_uri: String,
        result_set: ResultSetSummary,
    },
    QueryComplete {
        owner_uri: String,
        batches: Vec<BatchSummary>,
    },
    /// The query failed or was cancelled.
    QueryFailed {
        owner_uri: String,
        error: String,
        batches: Vec<BatchSummary>,
    },
}

impl QueryEvent {
    pub fn owner_uri(&self) -> &str {
        match self {
            QueryEvent::BatchStart { owner_uri, .. }
            | QueryEvent::BatchComplete { owner_uri, .. }
            | QueryEvent::Message { owner_uri, .. }
            | QueryEvent::ResultSetComplete { owner_uri, .. }
            | QueryEvent::QueryComplete { owner_uri, .. }
            | QueryEvent::QueryFailed { owner_uri, .. } => owner_uri,
        }
    }
}

/// Sending half of a query event channel.
pub type EventSender = mpsc::UnboundedSender<QueryEvent>;

/// Receiving half of a query event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<QueryEvent>;

/// Create a query event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Emits events on behalf of one query.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    owner_uri: String,
    sender: Option<EventSender>,
}

impl EventEmitter {
    pub fn new(owner_uri: impl Into<String>, sender: Option<EventSender>) -> Self {
        Self {
            owner_uri: owner_uri.into(),
            sender,
        }
    }

    pub fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    fn send(&self, event: QueryEvent) {
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is listening anymore
            let _ = sender.send(event);
        }
    }

    pub fn batch_start(&self, batch: BatchSummary) {
        self.send(QueryEvent::BatchStart {
            owner_uri: self.owner_uri.clone(),
            batch,
        });
    }

    pub fn batch_complete(&self, batch: BatchSummary) {
        self.send(QueryEvent::BatchComplete {
            owner_uri: self.owner_uri.clone(),
            batch,
        });
    }

    pub fn message(&self, message: ResultMessage) {
        self.send(QueryEvent::Message {
            owner_uri: self.owner_uri.clone(),
            message,
        });
    }

    pub fn result_set_complete(&self, result_set: ResultSetSummary) {
        self.send(QueryEvent::ResultSetComplete {
            owner_uri: self.owner_uri.clone(),
            result_set,
        });
    }

    pub fn query_complete(&self, batches: Vec<BatchSummary>) {
        self.send(QueryEvent::QueryComplete {
            owner_uri: self.owner_uri.clone(),
            batches,
        });
    }

    pub fn query_failed(&self, error: impl Into<String>, batches: Vec<BatchSummary>) {
        self.send(QueryEvent::QueryFailed {
            owner_uri: self.owner_uri.clone(),
            error: error.into(),
            batches,
        });
    }
}

/// Timestamp format used in summaries and messages.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Format an elapsed time as `hh:mm:ss.fff`.
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let total_ms = elapsed.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1_000) % 60;
    let millis = total_ms % 1_000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}
