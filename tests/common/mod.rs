//! Scripted connection provider for driving the query service without a
//! SQL Server instance.
//!
//! Each SQL text (trimmed, trailing `;` removed) maps to a list of steps the
//! fake connection replays. Unknown SQL produces an empty, successful batch.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use mssql_query_service::database::{
    BatchItem, BatchStream, ConnectionDetails, ConnectionProvider, DbColumn, QueryConnection,
    SqlValue,
};
use mssql_query_service::execution::{event_channel, EventReceiver, QueryEvent, QueryState};
use mssql_query_service::export::DefaultWriterFactory;
use mssql_query_service::workspace::Workspace;
use mssql_query_service::{Config, QueryExecutionService, ServerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Generous upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// One step replayed by a scripted connection.
#[derive(Debug, Clone)]
pub enum Step {
    Item(BatchItem),
    StatementError { number: u32, message: String },
    ConnectionError(String),
    Pause(Duration),
}

impl Step {
    pub fn columns(names: &[(&str, &str)]) -> Self {
        Step::Item(BatchItem::ResultSet(
            names
                .iter()
                .enumerate()
                .map(|(i, (name, ty))| DbColumn::new(*name, i, *ty))
                .collect(),
        ))
    }

    pub fn row(values: Vec<SqlValue>) -> Self {
        Step::Item(BatchItem::Row(values))
    }
}

/// SQL text to replayed steps.
#[derive(Debug, Clone, Default)]
pub struct Script {
    batches: HashMap<String, Vec<Step>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, sql: &str, steps: Vec<Step>) -> Self {
        self.batches.insert(normalize(sql), steps);
        self
    }

    fn steps(&self, sql: &str) -> Vec<Step> {
        self.batches.get(&normalize(sql)).cloned().unwrap_or_default()
    }
}

fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_string()
}

struct ScriptedConnection {
    script: Arc<Script>,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl QueryConnection for ScriptedConnection {
    async fn execute<'a>(&'a mut self, sql: &str) -> Result<BatchStream<'a>, ServerError> {
        self.executed.lock().push(normalize(sql));
        let steps = self.script.steps(sql);

        let stream = futures_util::stream::iter(steps)
            .then(|step| async move {
                match step {
                    Step::Item(item) => Some(Ok(item)),
                    Step::StatementError { number, message } => Some(Err(ServerError::Statement {
                        message,
                        number: Some(number),
                        state: Some(1),
                        class: Some(16),
                        line: Some(1),
                    })),
                    Step::ConnectionError(message) => Some(Err(ServerError::connection(message))),
                    Step::Pause(duration) => {
                        tokio::time::sleep(duration).await;
                        None
                    }
                }
            })
            .filter_map(|item| async move { item });
        Ok(Box::pin(stream))
    }

    async fn close(self: Box<Self>) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Connection provider handing out scripted connections.
pub struct ScriptedProvider {
    script: Arc<Script>,
    owners: DashMap<String, ConnectionDetails>,
    executed: Arc<Mutex<Vec<String>>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            owners: DashMap::new(),
            executed: Arc::new(Mutex::new(Vec::new())),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Every SQL text sent to any connection, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// A connection the caller owns, for inter-service execution.
    pub fn open_connection(&self) -> Box<dyn QueryConnection> {
        Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            executed: Arc::clone(&self.executed),
        })
    }
}

#[async_trait]
impl ConnectionProvider for ScriptedProvider {
    async fn connect(&self, owner_uri: &str, details: ConnectionDetails) -> Result<(), ServerError> {
        self.owners.insert(owner_uri.to_string(), details);
        Ok(())
    }

    async fn disconnect(&self, owner_uri: &str) -> bool {
        self.owners.remove(owner_uri).is_some()
    }

    fn connection_details(&self, owner_uri: &str) -> Option<ConnectionDetails> {
        self.owners.get(owner_uri).map(|d| d.value().clone())
    }

    async fn acquire(&self, owner_uri: &str) -> Result<Box<dyn QueryConnection>, ServerError> {
        if !self.owners.contains_key(owner_uri) {
            return Err(ServerError::invalid_owner(owner_uri));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_connection())
    }

    fn release(&self, _owner_uri: &str, _connection: Box<dyn QueryConnection>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A service wired to a scripted provider.
pub struct Harness {
    pub service: Arc<QueryExecutionService>,
    pub provider: Arc<ScriptedProvider>,
    pub workspace: Arc<Workspace>,
    pub events: EventReceiver,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::with_config(script, Config::default())
    }

    pub fn with_config(script: Script, config: Config) -> Self {
        let provider = Arc::new(ScriptedProvider::new(script));
        let workspace = Arc::new(Workspace::new());
        let (sender, events) = event_channel();
        let service = Arc::new(QueryExecutionService::new(
            provider.clone(),
            workspace.clone(),
            Arc::new(DefaultWriterFactory),
            config,
            sender,
        ));
        Self {
            service,
            provider,
            workspace,
            events,
        }
    }

    /// Register a connection for `owner_uri`.
    pub async fn connect(&self, owner_uri: &str) {
        let details = ConnectionDetails {
            server_name: "scripted".to_string(),
            user_name: Some("sa".to_string()),
            ..Default::default()
        };
        self.provider
            .connect(owner_uri, details)
            .await
            .unwrap();
    }

    /// Wait for the owner's current query to finish.
    pub async fn finish(&self, owner_uri: &str) -> QueryState {
        let query = self.service.query(owner_uri).expect("query registered");
        tokio::time::timeout(WAIT, query.wait_until_finished())
            .await
            .expect("query finished in time")
    }

    /// Collect events until the query of `owner_uri` completes or fails.
    pub async fn events_until_complete(&mut self, owner_uri: &str) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            let done = event.owner_uri() == owner_uri
                && matches!(
                    event,
                    QueryEvent::QueryComplete { .. } | QueryEvent::QueryFailed { .. }
                );
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// Wait for the next event matching `pred`.
    pub async fn wait_for_event<F>(&mut self, pred: F) -> QueryEvent
    where
        F: Fn(&QueryEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if pred(&event) {
                return event;
            }
        }
    }
}
