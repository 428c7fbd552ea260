//! JSON-RPC host: reads requests, dispatches them to the query service and
//! writes responses and query event notifications.

use super::contracts::*;
use super::protocol::{
    error_response, response, IncomingMessage, MessageReader, MessageWriter, RpcError,
    INVALID_REQUEST, PARSE_ERROR,
};
use crate::config::QueryExecutionSettings;
use crate::constants::RPC_FLUSH_TIMEOUT;
use crate::error::ServerError;
use crate::execution::{EventReceiver, ExecutionPlanOptions, QueryCallbacks};
use crate::export::SaveFormat;
use crate::service::{QueryExecutionService, SqlSource};
use crate::shutdown::SharedShutdownController;
use crate::workspace::Workspace;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

type Outgoing = mpsc::UnboundedSender<Value>;

/// What a handler produced.
enum Reply {
    Result(Value),
    /// The handler already queued its response
    Sent,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_reply<T: serde::Serialize>(value: T) -> Result<Reply, RpcError> {
    serde_json::to_value(value)
        .map(Reply::Result)
        .map_err(|e| RpcError::from(ServerError::from(e)))
}

/// Merge a partial `mssql.query` section into the current settings.
fn merge_settings(
    current: &QueryExecutionSettings,
    patch: &Value,
) -> Result<QueryExecutionSettings, RpcError> {
    let mut merged = serde_json::to_value(current).map_err(RpcError::invalid_params)?;
    if let (Some(target), Some(patch)) = (merged.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
    let settings: QueryExecutionSettings = parse(merged)?;
    if settings.batch_separator.trim().is_empty()
        || settings.batch_separator.contains(char::is_whitespace)
    {
        return Err(RpcError::invalid_params(
            "batchSeparator must be a single non-empty word",
        ));
    }
    Ok(settings)
}

/// Serves the query service over a framed JSON-RPC stream.
#[derive(Clone)]
pub struct RpcHost {
    service: Arc<QueryExecutionService>,
    workspace: Arc<Workspace>,
    shutdown: SharedShutdownController,
    shutdown_requested: Arc<AtomicBool>,
}

impl RpcHost {
    pub fn new(
        service: Arc<QueryExecutionService>,
        workspace: Arc<Workspace>,
        shutdown: SharedShutdownController,
    ) -> Self {
        Self {
            service,
            workspace,
            shutdown,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the client sent `shutdown` before the stream ended.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Run until `exit`, end of input or a shutdown signal.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        mut events: EventReceiver,
    ) -> Result<(), ServerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Value>();

        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            while let Some(message) = queue.recv().await {
                if let Err(e) = writer.write_message(&message).await {
                    error!("Failed to write message: {}", e);
                    break;
                }
            }
        });

        let forwarder = {
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event_notifications(&event) {
                        Ok(notifications) => {
                            for notification in notifications {
                                let _ = outgoing.send(notification);
                            }
                        }
                        Err(e) => warn!("Dropping unserializable query event: {}", e),
                    }
                }
            })
        };

        let mut reader = MessageReader::new(reader);
        let mut signal = self.shutdown.signal();
        let result = loop {
            let body = tokio::select! {
                _ = signal.recv() => {
                    info!("Shutdown signalled, closing RPC stream");
                    break Ok(());
                }
                body = reader.read_message() => body,
            };

            let body = match body {
                Ok(Some(body)) => body,
                Ok(None) => {
                    info!("Input stream closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            let message: IncomingMessage = match serde_json::from_slice(&body) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Discarding malformed message: {}", e);
                    let code = if e.is_syntax() || e.is_eof() {
                        PARSE_ERROR
                    } else {
                        INVALID_REQUEST
                    };
                    let error = RpcError::new(code, e.to_string());
                    let _ = outgoing.send(error_response(Value::Null, error));
                    continue;
                }
            };

            if message.method == EXIT {
                info!("Exit requested");
                break Ok(());
            }

            match message.id.clone() {
                Some(id) => self.spawn_request(id, message, outgoing.clone()),
                None => self.handle_notification(message),
            }
        };

        forwarder.abort();
        drop(outgoing);
        if tokio::time::timeout(RPC_FLUSH_TIMEOUT, writer_task).await.is_err() {
            debug!("Responses still pending after the flush timeout");
        }
        result
    }

    fn spawn_request(&self, id: Value, message: IncomingMessage, outgoing: Outgoing) {
        let host = self.clone();
        let correlation_id = Uuid::new_v4().to_string()[..8].to_string();
        let span = tracing::info_span!(
            "request",
            id = %correlation_id,
            method = %message.method
        );

        tokio::spawn(
            async move {
                debug!("Handling request");
                let method = message.method.clone();
                let reply = host
                    .dispatch(id.clone(), &method, message.params, &outgoing)
                    .await;
                let frame = match reply {
                    Ok(Reply::Result(result)) => Some(response(id, result)),
                    Ok(Reply::Sent) => None,
                    Err(e) => {
                        debug!("Request failed with {}: {}", e.code, e.message);
                        Some(error_response(id, e))
                    }
                };
                if let Some(frame) = frame {
                    let _ = outgoing.send(frame);
                }
            }
            .instrument(span),
        );
    }

    fn handle_notification(&self, message: IncomingMessage) {
        let result = match message.method.as_str() {
            DID_OPEN => parse::<DidOpenParams>(message.params).map(|p| {
                self.workspace.open(p.text_document.uri, p.text_document.text);
            }),
            DID_CHANGE => parse::<DidChangeParams>(message.params).map(|p| {
                // Full sync: the last change holds the whole document
                if let Some(change) = p.content_changes.into_iter().last() {
                    self.workspace.change(p.text_document.uri, change.text);
                }
            }),
            DID_CLOSE => parse::<DidCloseParams>(message.params).map(|p| {
                self.workspace.close(&p.text_document.uri);
            }),
            DID_CHANGE_CONFIGURATION => parse::<DidChangeConfigurationParams>(message.params)
                .and_then(|p| match p.query_section() {
                    Some(section) => {
                        let merged = merge_settings(&self.service.settings(), section)?;
                        self.service.update_settings(merged);
                        Ok(())
                    }
                    None => Ok(()),
                }),
            other => {
                debug!("Ignoring notification {}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Notification {} failed: {}", message.method, e.message);
        }
    }

    async fn dispatch(
        &self,
        id: Value,
        method: &str,
        params: Value,
        outgoing: &Outgoing,
    ) -> Result<Reply, RpcError> {
        let service = &self.service;
        match method {
            INITIALIZE => Ok(Reply::Result(json!({
                "capabilities": { "textDocumentSync": 1 },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }))),
            SHUTDOWN => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                Ok(Reply::Result(Value::Null))
            }

            EXECUTE_DOCUMENT_SELECTION => {
                let p: ExecuteDocumentSelectionParams = parse(params)?;
                self.execute(
                    id,
                    &p.owner_uri,
                    SqlSource::DocumentSelection(p.query_selection),
                    p.execution_plan_options,
                    outgoing,
                )
            }
            EXECUTE_DOCUMENT_STATEMENT => {
                let p: ExecuteDocumentStatementParams = parse(params)?;
                self.execute(
                    id,
                    &p.owner_uri,
                    SqlSource::DocumentStatement {
                        line: p.line,
                        column: p.column,
                    },
                    p.execution_plan_options,
                    outgoing,
                )
            }
            EXECUTE_STRING => {
                let p: ExecuteStringParams = parse(params)?;
                self.execute(
                    id,
                    &p.owner_uri,
                    SqlSource::Text(p.query),
                    p.execution_plan_options,
                    outgoing,
                )
            }

            SUBSET => {
                let p: SubsetParams = parse(params)?;
                let result_subset = service
                    .subset(
                        &p.owner_uri,
                        p.batch_index,
                        p.result_set_index,
                        p.rows_start_index,
                        p.rows_count,
                    )
                    .await?;
                to_reply(SubsetResult { result_subset })
            }
            CANCEL => {
                let p: OwnerParams = parse(params)?;
                service.cancel(&p.owner_uri)?;
                Ok(Reply::Result(json!({})))
            }
            DISPOSE => {
                let p: OwnerParams = parse(params)?;
                service.dispose(&p.owner_uri)?;
                Ok(Reply::Result(json!({})))
            }

            SAVE_CSV | SAVE_EXCEL | SAVE_JSON => {
                let format = match method {
                    SAVE_CSV => SaveFormat::Csv,
                    SAVE_EXCEL => SaveFormat::Excel,
                    _ => SaveFormat::Json,
                };
                let p: SaveResultsParams = parse(params)?;
                let options = p.to_options(format);
                service
                    .save_as(&p.owner_uri, p.batch_index, p.result_set_index, options)
                    .await?;
                Ok(Reply::Result(json!({})))
            }
            EXECUTION_PLAN => {
                let p: ExecutionPlanParams = parse(params)?;
                let execution_plan = service
                    .execution_plan(&p.owner_uri, p.batch_index, p.result_set_index)
                    .await?;
                to_reply(ExecutionPlanResult { execution_plan })
            }
            SIMPLE_EXECUTE => {
                let p: SimpleExecuteParams = parse(params)?;
                to_reply(service.simple_execute(&p.owner_uri, &p.query_string).await?)
            }

            CONNECT => {
                let p: ConnectParams = parse(params)?;
                service.connections().connect(&p.owner_uri, p.connection).await?;
                Ok(Reply::Result(Value::Bool(true)))
            }
            DISCONNECT => {
                let p: OwnerParams = parse(params)?;
                Ok(Reply::Result(Value::Bool(
                    service.connections().disconnect(&p.owner_uri).await,
                )))
            }

            other => Err(RpcError::method_not_found(other)),
        }
    }

    /// Register a query and acknowledge it before any of its events.
    fn execute(
        &self,
        id: Value,
        owner_uri: &str,
        source: SqlSource,
        plan: ExecutionPlanOptions,
        outgoing: &Outgoing,
    ) -> Result<Reply, RpcError> {
        let ack = outgoing.clone();
        let callbacks = QueryCallbacks {
            on_registered: Some(Box::new(move || {
                let _ = ack.send(response(id, json!({})));
            })),
            ..Default::default()
        };
        self.service
            .execute_with_callbacks(owner_uri, source, plan, callbacks)?;
        Ok(Reply::Sent)
    }
}
