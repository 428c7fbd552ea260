//! JSON-RPC surface of the service.

pub mod contracts;
mod host;
pub mod protocol;

pub use host::RpcHost;
pub use protocol::{IncomingMessage, MessageReader, MessageWriter, RpcError};
