//! Query execution: batch splitting, batches, result sets and queries.

mod batch;
pub mod batch_parser;
pub mod events;
mod query;
mod result_set;
pub mod settings;

pub use batch::Batch;
pub use batch_parser::{
    batch_at_position, parse_batches, BatchDefinition, ParseOptions, SelectionData,
};
pub use events::{
    event_channel, BatchSummary, EventEmitter, EventReceiver, EventSender, QueryEvent,
    ResultMessage, ResultSetSummary,
};
pub(crate) use query::ConnectionSource;
pub use query::{
    FailureCallback, Query, QueryCallbacks, QueryState, RegisteredCallback, SuccessCallback,
};
pub use result_set::ResultSet;
pub use settings::{ExecutionPlanOptions, QueryOptions};
