//! Query execution service.
//!
//! Keeps at most one query per owner URI and serves every request that
//! targets it: execute, subset, cancel, dispose, save-as, execution plan and
//! simple execute.

use crate::config::{Config, QueryExecutionSettings, StorageConfig};
use crate::constants::{LOG_QUERY_TRUNCATE_LENGTH, MAX_ADDRESSABLE_ROWS};
use crate::database::{
    truncate_for_log, ConnectionProvider, DbCellValue, DbColumn, QueryConnection,
};
use crate::error::ServerError;
use crate::execution::{
    batch_at_position, parse_batches, BatchDefinition, ConnectionSource, EventEmitter,
    EventSender, ExecutionPlanOptions, ParseOptions, Query, QueryCallbacks, QueryOptions,
    QueryState, ResultSet, SelectionData,
};
use crate::export::{ResultWriterFactory, SaveOptions};
use crate::workspace::DocumentProvider;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the SQL of an execute request comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlSource {
    /// A selection of the owner's document, or all of it
    DocumentSelection(Option<SelectionData>),
    /// The statement under a cursor in the owner's document
    DocumentStatement { line: u32, column: u32 },
    /// Literal SQL text
    Text(String),
}

/// A window of rows from a result set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubset {
    pub row_count: usize,
    pub rows: Vec<Vec<DbCellValue>>,
}

/// The first result set of a simple execute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleExecuteResult {
    pub row_count: u64,
    pub column_info: Vec<DbColumn>,
    pub rows: Vec<Vec<DbCellValue>>,
}

/// An execution plan returned to the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub format: String,
    pub content: String,
}

type Completion = Result<Arc<Query>, String>;

/// Registry of active queries, one per owner URI.
pub struct QueryExecutionService {
    connections: Arc<dyn ConnectionProvider>,
    documents: Arc<dyn DocumentProvider>,
    writers: Arc<dyn ResultWriterFactory>,
    settings: RwLock<QueryExecutionSettings>,
    storage: StorageConfig,
    events: EventSender,
    queries: DashMap<String, Arc<Query>>,
}

impl QueryExecutionService {
    pub fn new(
        connections: Arc<dyn ConnectionProvider>,
        documents: Arc<dyn DocumentProvider>,
        writers: Arc<dyn ResultWriterFactory>,
        config: Config,
        events: EventSender,
    ) -> Self {
        Self {
            connections,
            documents,
            writers,
            settings: RwLock::new(config.query),
            storage: config.storage,
            events,
            queries: DashMap::new(),
        }
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionProvider> {
        &self.connections
    }

    /// Current query settings.
    pub fn settings(&self) -> QueryExecutionSettings {
        self.settings.read().clone()
    }

    /// Replace the settings used by subsequent queries.
    pub fn update_settings(&self, settings: QueryExecutionSettings) {
        info!("Query settings updated: {:?}", settings);
        *self.settings.write() = settings;
    }

    /// The active query of `owner_uri`, if any.
    pub fn query(&self, owner_uri: &str) -> Option<Arc<Query>> {
        self.queries.get(owner_uri).map(|q| Arc::clone(q.value()))
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Queries that have not finished executing.
    pub fn running_query_count(&self) -> usize {
        self.queries.iter().filter(|q| !q.has_finished()).count()
    }

    /// Start a query for `owner_uri` on its connection.
    ///
    /// Returns once the query is registered; execution continues on its own
    /// task and reports progress through query events.
    pub fn execute(
        &self,
        owner_uri: &str,
        source: SqlSource,
        plan: ExecutionPlanOptions,
    ) -> Result<Arc<Query>, ServerError> {
        self.execute_with_callbacks(owner_uri, source, plan, QueryCallbacks::default())
    }

    /// Like `execute`, with continuations run after the query finishes.
    pub fn execute_with_callbacks(
        &self,
        owner_uri: &str,
        source: SqlSource,
        plan: ExecutionPlanOptions,
        callbacks: QueryCallbacks,
    ) -> Result<Arc<Query>, ServerError> {
        if !self.connections.has_connection(owner_uri) {
            return Err(ServerError::invalid_owner(owner_uri));
        }
        let definitions = self.resolve(owner_uri, source)?;
        self.start(
            owner_uri,
            definitions,
            plan,
            ConnectionSource::Provider(Arc::clone(&self.connections)),
            callbacks,
            true,
        )
    }

    /// Run `sql` on a connection the caller already holds.
    ///
    /// The connection is consumed; it is dropped when the query finishes.
    pub fn execute_with_connection(
        &self,
        owner_uri: &str,
        sql: &str,
        connection: Box<dyn QueryConnection>,
        callbacks: QueryCallbacks,
    ) -> Result<Arc<Query>, ServerError> {
        let definitions = self.split(sql, (0, 0))?;
        self.start(
            owner_uri,
            definitions,
            ExecutionPlanOptions::default(),
            ConnectionSource::Supplied(connection),
            callbacks,
            true,
        )
    }

    fn split(&self, text: &str, origin: (u32, u32)) -> Result<Vec<BatchDefinition>, ServerError> {
        let settings = self.settings.read();
        parse_batches(
            text,
            &ParseOptions {
                batch_separator: &settings.batch_separator,
                split_statements: settings.split_statements,
                origin,
            },
        )
    }

    fn resolve(
        &self,
        owner_uri: &str,
        source: SqlSource,
    ) -> Result<Vec<BatchDefinition>, ServerError> {
        match source {
            SqlSource::Text(text) => self.split(&text, (0, 0)),
            SqlSource::DocumentSelection(selection) => {
                let text = self
                    .documents
                    .get_text(owner_uri, selection)
                    .ok_or_else(|| ServerError::invalid_owner(owner_uri))?;
                let origin = selection
                    .map(|s| (s.start_line, s.start_column))
                    .unwrap_or((0, 0));
                self.split(&text, origin)
            }
            SqlSource::DocumentStatement { line, column } => {
                let text = self
                    .documents
                    .document_text(owner_uri)
                    .ok_or_else(|| ServerError::invalid_owner(owner_uri))?;
                let batches = self.split(&text, (0, 0))?;
                Ok(batch_at_position(&batches, line, column)
                    .cloned()
                    .into_iter()
                    .collect())
            }
        }
    }

    fn start(
        &self,
        owner_uri: &str,
        definitions: Vec<BatchDefinition>,
        plan: ExecutionPlanOptions,
        source: ConnectionSource,
        callbacks: QueryCallbacks,
        emit_events: bool,
    ) -> Result<Arc<Query>, ServerError> {
        let options = QueryOptions::new(self.settings(), plan);
        let query = Arc::new(Query::new(
            owner_uri,
            definitions,
            options,
            self.storage.buffer_dir.as_deref(),
        )?);

        let replaced = match self.queries.entry(owner_uri.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().has_finished() {
                    drop(entry);
                    query.dispose();
                    return Err(ServerError::in_progress(owner_uri));
                }
                Some(entry.insert(Arc::clone(&query)))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&query));
                None
            }
        };
        if let Some(previous) = replaced {
            debug!("Replacing finished query for {}", owner_uri);
            previous.dispose();
        }

        info!(
            "Executing {} batch(es) for {}: {}",
            query.batches().len(),
            owner_uri,
            query
                .batches()
                .first()
                .map(|b| truncate_for_log(b.text(), LOG_QUERY_TRUNCATE_LENGTH))
                .unwrap_or_default()
        );

        let mut callbacks = callbacks;
        if let Some(on_registered) = callbacks.on_registered.take() {
            on_registered();
        }

        let sender = emit_events.then(|| self.events.clone());
        let emitter = EventEmitter::new(owner_uri, sender);
        tokio::spawn(Arc::clone(&query).run(source, emitter, callbacks));
        Ok(query)
    }

    fn active(&self, owner_uri: &str) -> Result<Arc<Query>, ServerError> {
        self.query(owner_uri)
            .ok_or_else(|| ServerError::no_query(owner_uri))
    }

    fn result_set(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
    ) -> Result<Arc<ResultSet>, ServerError> {
        let query = self.active(owner_uri)?;
        let batch = query.batch(batch_index)?;
        batch.result_set(result_set_index)
    }

    /// Rows `start_row..start_row + row_count` of a result set, clamped.
    pub async fn subset(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
        start_row: u64,
        row_count: u64,
    ) -> Result<ResultSubset, ServerError> {
        let result_set = self.result_set(owner_uri, batch_index, result_set_index)?;
        let rows = result_set.subset(start_row, row_count).await?;
        Ok(ResultSubset {
            row_count: rows.len(),
            rows,
        })
    }

    /// Request cancellation of the owner's running query.
    pub fn cancel(&self, owner_uri: &str) -> Result<(), ServerError> {
        self.active(owner_uri)?.cancel()
    }

    /// Remove the owner's query, cancelling it if still running.
    pub fn dispose(&self, owner_uri: &str) -> Result<(), ServerError> {
        let (_, query) = self
            .queries
            .remove(owner_uri)
            .ok_or_else(|| ServerError::no_query(owner_uri))?;
        query.dispose();
        Ok(())
    }

    /// Export a result set to a file.
    pub async fn save_as(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
        options: SaveOptions,
    ) -> Result<(), ServerError> {
        let result_set = self.result_set(owner_uri, batch_index, result_set_index)?;
        result_set
            .save_as(&options, self.writers.as_ref(), self.storage.export_window_rows)
            .await
    }

    /// The execution plan held by a result set.
    pub async fn execution_plan(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
    ) -> Result<ExecutionPlan, ServerError> {
        let result_set = self.result_set(owner_uri, batch_index, result_set_index)?;
        Ok(ExecutionPlan {
            format: "xml".to_string(),
            content: result_set.execution_plan().await?,
        })
    }

    /// Run `sql` on a private copy of the owner's connection and return the
    /// first result set.
    pub async fn simple_execute(
        &self,
        owner_uri: &str,
        sql: &str,
    ) -> Result<SimpleExecuteResult, ServerError> {
        let details = self
            .connections
            .connection_details(owner_uri)
            .ok_or_else(|| ServerError::invalid_owner(owner_uri))?;

        let ephemeral = Uuid::new_v4().to_string();
        debug!("Simple execute for {} as {}", owner_uri, ephemeral);
        self.connections.connect(&ephemeral, details).await?;

        let result = self.run_simple(&ephemeral, sql).await;

        if let Some((_, query)) = self.queries.remove(&ephemeral) {
            query.dispose();
        }
        self.connections.disconnect(&ephemeral).await;
        result
    }

    async fn run_simple(&self, owner_uri: &str, sql: &str) -> Result<SimpleExecuteResult, ServerError> {
        let (tx, rx) = oneshot::channel::<Completion>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_failure_tx = Arc::clone(&tx);

        let callbacks = QueryCallbacks {
            on_registered: None,
            on_success: Some(Box::new(move |query| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(query));
                }
            })),
            on_failure: Some(Box::new(move |_, error| {
                if let Some(tx) = on_failure_tx.lock().take() {
                    let _ = tx.send(Err(error));
                }
            })),
        };

        let definitions = self.split(sql, (0, 0))?;
        self.start(
            owner_uri,
            definitions,
            ExecutionPlanOptions::default(),
            ConnectionSource::Provider(Arc::clone(&self.connections)),
            callbacks,
            false,
        )?;

        let query = match rx.await {
            Ok(Ok(query)) => query,
            Ok(Err(error)) => return Err(ServerError::internal(error)),
            Err(_) => return Err(ServerError::internal("Query ended without a result")),
        };

        let result_set = query
            .batches()
            .iter()
            .flat_map(|batch| batch.result_sets())
            .next()
            .ok_or_else(|| ServerError::invalid_input("Query has no results to return"))?;

        let row_count = result_set.row_count();
        if row_count > MAX_ADDRESSABLE_ROWS {
            return Err(ServerError::ResultTooLarge { rows: row_count });
        }

        Ok(SimpleExecuteResult {
            row_count,
            column_info: result_set.columns().to_vec(),
            rows: result_set.subset(0, row_count).await?,
        })
    }

    /// Cancel every running query.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.queries.iter() {
            if entry.value().cancel().is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel and dispose every query. Used on shutdown.
    pub fn dispose_all(&self) -> usize {
        let owners: Vec<String> = self.queries.iter().map(|e| e.key().clone()).collect();
        let mut disposed = 0;
        for owner in owners {
            if let Some((_, query)) = self.queries.remove(&owner) {
                if query.state() == QueryState::Executing {
                    warn!("Disposing query for {} while it is still running", owner);
                }
                query.dispose();
                disposed += 1;
            }
        }
        disposed
    }
}

impl std::fmt::Debug for QueryExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutionService")
            .field("queries", &self.queries.len())
            .field("settings", &*self.settings.read())
            .finish()
    }
}
