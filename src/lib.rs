//! # MSSQL Query Service
//!
//! A JSON-RPC host that runs SQL Server queries on behalf of an editor.
//!
//! This crate provides:
//! - **Execution**: batch splitting, sequential batch execution, cancellation
//! - **Storage**: on-disk buffering of result rows, read back in windows
//! - **Export**: CSV, Excel and JSON writers for result sets
//! - **RPC**: LSP-framed JSON-RPC over stdio with query event notifications
//!
//! ## Architecture
//!
//! The [`QueryExecutionService`] keeps at most one query per owner URI. Each
//! query runs its batches on its own task and streams rows into a private
//! [`storage::ResultBuffer`]; subset, save and cancel requests race against
//! the same query through the registry.

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod execution;
pub mod export;
pub mod rpc;
pub mod service;
pub mod shutdown;
pub mod storage;
pub mod workspace;

pub use config::Config;
pub use error::ServerError;
pub use service::{QueryExecutionService, SqlSource};
