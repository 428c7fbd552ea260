//! A query: its batches, its result buffer and its state machine.
//!
//! ```text
//! Created -> Executing -> Completed | Failed | Cancelled
//!    any  -> Disposed
//! ```
//!
//! Terminal transitions only happen from `Executing`, so a query disposed
//! while its worker is still unwinding stays `Disposed`.

use super::batch::Batch;
use super::batch_parser::BatchDefinition;
use super::events::{BatchSummary, EventEmitter};
use super::settings::QueryOptions;
use crate::constants::{LOG_QUERY_TRUNCATE_LENGTH, MSG_QUERY_CANCELLED};
use crate::database::{truncate_for_log, ConnectionProvider, QueryConnection};
use crate::error::ServerError;
use crate::storage::ResultBuffer;
use futures_util::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Created,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Disposed,
}

impl QueryState {
    /// Whether execution is over (successfully or not).
    pub fn is_finished(&self) -> bool {
        !matches!(self, QueryState::Created | QueryState::Executing)
    }
}

/// Continuation run after a successful query.
pub type SuccessCallback = Box<dyn FnOnce(Arc<Query>) + Send>;

/// Continuation run after a failed or cancelled query, with the error text.
pub type FailureCallback = Box<dyn FnOnce(Arc<Query>, String) + Send>;

/// Hook run once the query is registered, before its worker starts.
pub type RegisteredCallback = Box<dyn FnOnce() + Send>;

/// Continuations supplied by callers that reuse query execution.
#[derive(Default)]
pub struct QueryCallbacks {
    pub on_registered: Option<RegisteredCallback>,
    pub on_success: Option<SuccessCallback>,
    pub on_failure: Option<FailureCallback>,
}

/// Where the worker gets its connection from.
pub(crate) enum ConnectionSource {
    /// Borrow the owner's connection and hand it back afterwards
    Provider(Arc<dyn ConnectionProvider>),
    /// Use a caller-supplied connection, dropped afterwards
    Supplied(Box<dyn QueryConnection>),
}

/// One executed (or executing) SQL submission.
pub struct Query {
    owner_uri: String,
    batches: Vec<Arc<Batch>>,
    options: QueryOptions,
    buffer: Arc<ResultBuffer>,
    state: watch::Sender<QueryState>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("owner_uri", &self.owner_uri)
            .field("batches", &self.batches.len())
            .field("state", &self.state())
            .finish()
    }
}

impl Query {
    /// Create a query and allocate its result buffer.
    pub fn new(
        owner_uri: impl Into<String>,
        definitions: Vec<BatchDefinition>,
        options: QueryOptions,
        buffer_dir: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let buffer = ResultBuffer::create(buffer_dir)?;
        let batches = definitions
            .into_iter()
            .enumerate()
            .map(|(id, def)| Arc::new(Batch::new(id, def)))
            .collect();
        let (state, _) = watch::channel(QueryState::Created);

        Ok(Self {
            owner_uri: owner_uri.into(),
            batches,
            options,
            buffer,
            state,
            cancel: CancellationToken::new(),
        })
    }

    pub fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn state(&self) -> QueryState {
        *self.state.borrow()
    }

    /// Whether execution is over, so the query may be replaced.
    pub fn has_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn batches(&self) -> &[Arc<Batch>] {
        &self.batches
    }

    /// Batch by index.
    pub fn batch(&self, index: usize) -> Result<&Arc<Batch>, ServerError> {
        self.batches
            .get(index)
            .ok_or_else(|| ServerError::batch_index(index, self.batches.len()))
    }

    pub fn batch_summaries(&self) -> Vec<BatchSummary> {
        self.batches.iter().map(|b| b.summary()).collect()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) -> Result<(), ServerError> {
        if self.has_finished() {
            return Err(ServerError::AlreadyCompleted);
        }
        info!("Cancelling query for {}", self.owner_uri);
        self.cancel.cancel();
        Ok(())
    }

    /// Cancel if still running and release the result buffer.
    pub fn dispose(&self) {
        self.cancel.cancel();
        self.state.send_replace(QueryState::Disposed);
        self.buffer.close();
        debug!("Disposed query for {}", self.owner_uri);
    }

    /// Wait until execution is over and return the final state.
    pub async fn wait_until_finished(&self) -> QueryState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| s.is_finished()).await {
            Ok(state) => *state,
            // The sender lives in `self`, so this only happens during teardown
            Err(_) => self.state(),
        };
        state
    }

    fn transition(&self, from: QueryState, to: QueryState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Run every batch in order on `conn`.
    async fn execute_batches(
        &self,
        conn: &mut dyn QueryConnection,
        emitter: &EventEmitter,
    ) -> Result<(), ServerError> {
        for statement in self.options.setup_statements() {
            self.run_session_statement(conn, &statement).await?;
        }

        for batch in &self.batches {
            if self.cancel.is_cancelled() {
                return Err(ServerError::Cancelled);
            }
            debug!(
                "Executing batch {} for {}: {}",
                batch.id(),
                self.owner_uri,
                truncate_for_log(batch.text(), LOG_QUERY_TRUNCATE_LENGTH)
            );
            batch
                .execute(conn, &self.buffer, &self.options, emitter, &self.cancel)
                .await?;
        }

        for statement in self.options.teardown_statements() {
            self.run_session_statement(conn, &statement).await?;
        }
        Ok(())
    }

    async fn run_session_statement(
        &self,
        conn: &mut dyn QueryConnection,
        statement: &str,
    ) -> Result<(), ServerError> {
        let run = async {
            let mut stream = conn.execute(statement).await?;
            while let Some(item) = stream.next().await {
                item?;
            }
            Ok::<_, ServerError>(())
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ServerError::Cancelled),
            result = run => result.map_err(|e| match e {
                // A failing SET leaves the session in an unknown state
                ServerError::Statement { message, .. } => {
                    ServerError::connection(format!("{}: {}", statement, message))
                }
                other => other,
            }),
        }
    }

    /// Worker body: acquire a connection, run, publish the outcome.
    pub(crate) async fn run(
        self: Arc<Self>,
        source: ConnectionSource,
        emitter: EventEmitter,
        callbacks: QueryCallbacks,
    ) {
        if !self.transition(QueryState::Created, QueryState::Executing) {
            // Disposed before the worker got here; callers still get an outcome
            debug!("Query for {} was disposed before it started", self.owner_uri);
            self.publish(Err(ServerError::Cancelled), emitter, callbacks);
            return;
        }

        let (conn, provider) = match source {
            ConnectionSource::Supplied(conn) => (Ok(conn), None),
            ConnectionSource::Provider(provider) => {
                let conn = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(ServerError::Cancelled),
                    conn = provider.acquire(&self.owner_uri) => conn,
                };
                (conn, Some(provider))
            }
        };

        let result = match conn {
            Ok(mut conn) => {
                let result = self.execute_batches(conn.as_mut(), &emitter).await;
                match (&result, provider.as_ref()) {
                    (Ok(()), Some(provider)) => provider.release(&self.owner_uri, conn),
                    // Cancelled or broken connections are not reused
                    _ => drop(conn),
                }
                result
            }
            Err(e) => Err(e),
        };

        self.publish(result, emitter, callbacks);
    }

    fn publish(
        self: Arc<Self>,
        result: Result<(), ServerError>,
        emitter: EventEmitter,
        callbacks: QueryCallbacks,
    ) {
        match result {
            Ok(()) => {
                self.transition(QueryState::Executing, QueryState::Completed);
                info!(
                    "Query for {} completed ({} batches)",
                    self.owner_uri,
                    self.batches.len()
                );
                emitter.query_complete(self.batch_summaries());
                if let Some(on_success) = callbacks.on_success {
                    on_success(Arc::clone(&self));
                }
            }
            Err(e) => {
                let (target, message) = if e.is_cancelled() {
                    (QueryState::Cancelled, MSG_QUERY_CANCELLED.to_string())
                } else {
                    (QueryState::Failed, e.to_string())
                };
                self.transition(QueryState::Executing, target);
                if e.is_cancelled() {
                    info!("Query for {} was cancelled", self.owner_uri);
                } else {
                    warn!("Query for {} failed: {}", self.owner_uri, message);
                }
                emitter.query_failed(message.clone(), self.batch_summaries());
                if let Some(on_failure) = callbacks.on_failure {
                    on_failure(Arc::clone(&self), message);
                }
            }
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::batch_parser::SelectionData;

    fn query(batches: usize) -> Arc<Query> {
        let defs = (0..batches)
            .map(|i| BatchDefinition {
                text: format!("SELECT {}", i),
                selection: SelectionData::new(i as u32, 0, i as u32, 8),
                execution_count: 1,
            })
            .collect();
        Arc::new(Query::new("doc1", defs, QueryOptions::default(), None).unwrap())
    }

    #[test]
    fn test_state_finished() {
        assert!(!QueryState::Created.is_finished());
        assert!(!QueryState::Executing.is_finished());
        assert!(QueryState::Completed.is_finished());
        assert!(QueryState::Cancelled.is_finished());
        assert!(QueryState::Disposed.is_finished());
    }

    #[test]
    fn test_terminal_only_from_executing() {
        let q = query(1);
        assert!(!q.transition(QueryState::Executing, QueryState::Completed));
        assert_eq!(q.state(), QueryState::Created);

        assert!(q.transition(QueryState::Created, QueryState::Executing));
        q.dispose();
        assert!(!q.transition(QueryState::Executing, QueryState::Failed));
        assert_eq!(q.state(), QueryState::Disposed);
    }

    #[test]
    fn test_cancel_finished_query() {
        let q = query(1);
        assert!(q.transition(QueryState::Created, QueryState::Executing));
        assert!(q.transition(QueryState::Executing, QueryState::Completed));
        assert!(matches!(q.cancel(), Err(ServerError::AlreadyCompleted)));
        assert!(!q.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_batch_index() {
        let q = query(2);
        assert_eq!(q.batch(1).unwrap().id(), 1);
        assert!(matches!(
            q.batch(2).unwrap_err(),
            ServerError::InvalidIndex { index: 2, count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_until_finished() {
        let q = query(1);
        assert!(q.transition(QueryState::Created, QueryState::Executing));

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_until_finished().await })
        };
        q.transition(QueryState::Executing, QueryState::Failed);
        assert_eq!(waiter.await.unwrap(), QueryState::Failed);
    }

    #[test]
    fn test_dispose_releases_buffer() {
        let q = query(1);
        let path = q.buffer.path().to_path_buf();
        assert!(path.exists());
        q.dispose();
        assert!(!path.exists());
    }
}
