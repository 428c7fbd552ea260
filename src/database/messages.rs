//! Informational server messages (PRINT, low-severity RAISERROR).
//!
//! Tiberius consumes INFO tokens inside its query stream and only reports
//! them as `tracing` events from its token module. [`ServerMessageLayer`]
//! picks those events up while a [`ServerMessages`] stream is being polled on
//! the same thread, and the stream replays them as [`BatchItem::Message`]
//! ahead of the item that followed them on the wire.

use super::connection::BatchItem;
use crate::error::ServerError;
use futures_util::stream::{Stream, StreamExt};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{Filtered, Targets};
use tracing_subscriber::layer::{self, Layer};

/// Module tiberius decodes INFO and ENVCHANGE tokens in.
pub const TOKEN_TARGET: &str = "tiberius::tds::stream::token";

/// ENVCHANGE tokens are logged from the same module at the same level.
const ENV_CHANGE_PREFIXES: &[&str] = &[
    "Database change from '",
    "Packet size change from '",
    "SQL collation change",
    "Begin transaction",
    "Commit transaction",
    "Rollback transaction",
    "Defect transaction",
    "Server requested routing to a new address",
    "Fallback mirror server",
    "Ignored env change",
];

thread_local! {
    static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

/// Restores the previous capture buffer, also when the polled closure panics.
struct CaptureGuard {
    previous: Option<Option<Vec<String>>>,
}

impl CaptureGuard {
    fn begin() -> Self {
        let previous = CAPTURED.with(|c| c.replace(Some(Vec::new())));
        Self {
            previous: Some(previous),
        }
    }

    fn finish(mut self) -> Vec<String> {
        let previous = self.previous.take().unwrap_or_default();
        CAPTURED
            .with(|c| c.replace(previous))
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CAPTURED.with(|c| c.replace(previous));
        }
    }
}

/// Run `f`, collecting the server messages logged on this thread meanwhile.
pub fn capture_server_messages<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    let guard = CaptureGuard::begin();
    let out = f();
    (out, guard.finish())
}

fn is_env_change(message: &str) -> bool {
    ENV_CHANGE_PREFIXES.iter().any(|p| message.starts_with(p))
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

/// Layer feeding tiberius INFO events into the active capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerMessageLayer;

impl<S: Subscriber> Layer<S> for ServerMessageLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: layer::Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() != TOKEN_TARGET || *meta.level() != Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let Some(message) = visitor.message else {
            return;
        };
        if is_env_change(&message) {
            return;
        }

        CAPTURED.with(|c| {
            if let Some(buffer) = c.borrow_mut().as_mut() {
                buffer.push(message);
            }
        });
    }
}

/// The message layer, filtered to the tiberius token module so it can sit
/// next to an `EnvFilter`-ed fmt layer without widening it.
pub fn server_message_layer<S>() -> Filtered<ServerMessageLayer, Targets, S>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    ServerMessageLayer.with_filter(Targets::new().with_target(TOKEN_TARGET, Level::INFO))
}

/// Stream adapter interleaving captured server messages with batch items.
pub struct ServerMessages<S> {
    inner: S,
    pending: VecDeque<Result<BatchItem, ServerError>>,
    done: bool,
}

impl<S> ServerMessages<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for ServerMessages<S>
where
    S: Stream<Item = Result<BatchItem, ServerError>> + Unpin,
{
    type Item = Result<BatchItem, ServerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if !this.done {
            let (poll, messages) = capture_server_messages(|| this.inner.poll_next_unpin(cx));
            this.pending
                .extend(messages.into_iter().map(|m| Ok(BatchItem::Message(m))));
            match poll {
                Poll::Ready(Some(item)) => this.pending.push_back(item),
                Poll::Ready(None) => this.done = true,
                Poll::Pending => {}
            }
        }

        match this.pending.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None if this.done => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}
