//! Request parameters and notification payloads of the RPC surface.

use super::protocol::notification;
use crate::database::ConnectionDetails;
use crate::execution::{
    BatchSummary, ExecutionPlanOptions, QueryEvent, ResultMessage, ResultSetSummary,
    SelectionData,
};
use crate::export::{SaveFormat, SaveOptions, SaveSelection};
use crate::service::{ExecutionPlan, ResultSubset};
use serde::{Deserialize, Serialize};
use serde_json::{to_value, Value};

pub const EXECUTE_DOCUMENT_SELECTION: &str = "query/executeDocumentSelection";
pub const EXECUTE_DOCUMENT_STATEMENT: &str = "query/executeDocumentStatement";
pub const EXECUTE_STRING: &str = "query/executeString";
pub const SUBSET: &str = "query/subset";
pub const CANCEL: &str = "query/cancel";
pub const DISPOSE: &str = "query/dispose";
pub const SAVE_CSV: &str = "query/saveCsv";
pub const SAVE_EXCEL: &str = "query/saveExcel";
pub const SAVE_JSON: &str = "query/saveJson";
pub const EXECUTION_PLAN: &str = "query/executionPlan";
pub const SIMPLE_EXECUTE: &str = "query/simpleexecute";

pub const BATCH_START: &str = "query/batchStart";
pub const BATCH_COMPLETE: &str = "query/batchComplete";
pub const MESSAGE: &str = "query/message";
pub const RESULT_SET_COMPLETE: &str = "query/resultSetComplete";
pub const QUERY_COMPLETE: &str = "query/complete";

pub const CONNECT: &str = "connection/connect";
pub const DISCONNECT: &str = "connection/disconnect";

pub const INITIALIZE: &str = "initialize";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";
pub const DID_OPEN: &str = "textDocument/didOpen";
pub const DID_CHANGE: &str = "textDocument/didChange";
pub const DID_CLOSE: &str = "textDocument/didClose";
pub const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteDocumentSelectionParams {
    pub owner_uri: String,
    #[serde(default)]
    pub query_selection: Option<SelectionData>,
    #[serde(default)]
    pub execution_plan_options: ExecutionPlanOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteDocumentStatementParams {
    pub owner_uri: String,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub execution_plan_options: ExecutionPlanOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStringParams {
    pub owner_uri: String,
    pub query: String,
    #[serde(default)]
    pub execution_plan_options: ExecutionPlanOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetParams {
    pub owner_uri: String,
    pub batch_index: usize,
    pub result_set_index: usize,
    pub rows_start_index: u64,
    pub rows_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetResult {
    pub result_subset: ResultSubset,
}

/// Params of requests that only name an owner.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerParams {
    pub owner_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResultsParams {
    pub owner_uri: String,
    pub batch_index: usize,
    pub result_set_index: usize,
    pub file_path: String,
    pub row_start_index: Option<u64>,
    pub row_end_index: Option<u64>,
    pub column_start_index: Option<usize>,
    pub column_end_index: Option<usize>,
    /// CSV only
    pub include_headers: Option<bool>,
    /// CSV only, first character is used
    pub delimiter: Option<String>,
}

impl SaveResultsParams {
    /// Save options for `format`. The window applies only when all four
    /// bounds are present.
    pub fn to_options(&self, format: SaveFormat) -> SaveOptions {
        let mut options = SaveOptions::new(&self.file_path, format);
        options.selection = match (
            self.row_start_index,
            self.row_end_index,
            self.column_start_index,
            self.column_end_index,
        ) {
            (Some(row_start), Some(row_end), Some(col_start), Some(col_end)) => {
                Some(SaveSelection {
                    row_start_index: row_start,
                    row_end_index: row_end,
                    column_start_index: col_start,
                    column_end_index: col_end,
                })
            }
            _ => None,
        };
        if let Some(include_headers) = self.include_headers {
            options.include_headers = include_headers;
        }
        if let Some(delimiter) = self.delimiter.as_deref().and_then(|d| d.chars().next()) {
            options.delimiter = delimiter;
        }
        options
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlanParams {
    pub owner_uri: String,
    pub batch_index: usize,
    pub result_set_index: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlanResult {
    pub execution_plan: ExecutionPlan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleExecuteParams {
    pub owner_uri: String,
    pub query_string: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub owner_uri: String,
    pub connection: ConnectionDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentItem {
    pub uri: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidOpenParams {
    pub text_document: TextDocumentItem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentChange {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidChangeParams {
    pub text_document: TextDocumentIdentifier,
    pub content_changes: Vec<ContentChange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCloseParams {
    pub text_document: TextDocumentIdentifier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidChangeConfigurationParams {
    #[serde(default)]
    pub settings: Value,
}

impl DidChangeConfigurationParams {
    /// The `mssql.query` section, if present.
    pub fn query_section(&self) -> Option<&Value> {
        self.settings.get("mssql")?.get("query")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEventParams<'a> {
    owner_uri: &'a str,
    batch_summary: &'a BatchSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageParams<'a> {
    owner_uri: &'a str,
    message: &'a ResultMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetEventParams<'a> {
    owner_uri: &'a str,
    result_set_summary: &'a ResultSetSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryCompleteParams<'a> {
    owner_uri: &'a str,
    batch_summaries: &'a [BatchSummary],
}

/// Notifications announcing `event`, in the order they must be sent.
///
/// A failed query is reported as an error message followed by the usual
/// completion notification.
pub fn event_notifications(event: &QueryEvent) -> Result<Vec<Value>, serde_json::Error> {
    Ok(match event {
        QueryEvent::BatchStart { owner_uri, batch } => vec![notification(
            BATCH_START,
            to_value(BatchEventParams { owner_uri, batch_summary: batch })?,
        )],
        QueryEvent::BatchComplete { owner_uri, batch } => vec![notification(
            BATCH_COMPLETE,
            to_value(BatchEventParams { owner_uri, batch_summary: batch })?,
        )],
        QueryEvent::Message { owner_uri, message } => vec![notification(
            MESSAGE,
            to_value(MessageParams { owner_uri, message })?,
        )],
        QueryEvent::ResultSetComplete { owner_uri, result_set } => vec![notification(
            RESULT_SET_COMPLETE,
            to_value(ResultSetEventParams {
                owner_uri,
                result_set_summary: result_set,
            })?,
        )],
        QueryEvent::QueryComplete { owner_uri, batches } => vec![notification(
            QUERY_COMPLETE,
            to_value(QueryCompleteParams {
                owner_uri,
                batch_summaries: batches,
            })?,
        )],
        QueryEvent::QueryFailed {
            owner_uri,
            error,
            batches,
        } => {
            let message = ResultMessage::new(None, true, error.clone());
            vec![
                notification(MESSAGE, to_value(MessageParams { owner_uri, message: &message })?),
                notification(
                    QUERY_COMPLETE,
                    to_value(QueryCompleteParams {
                        owner_uri,
                        batch_summaries: batches,
                    })?,
                ),
            ]
        }
    })
}
