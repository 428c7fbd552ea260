//! On-disk buffering of query results.

mod buffer;
pub mod codec;

pub use buffer::{BufferWriter, ResultBuffer};
