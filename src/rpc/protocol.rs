//! JSON-RPC 2.0 messages and LSP-style framing.
//!
//! Every message is preceded by a header block:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"query/cancel",...}
//! ```

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted message body (64 MB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A request (with `id`) or notification (without) from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl IncomingMessage {
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

/// Error object of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", message))
    }
}

impl From<ServerError> for RpcError {
    fn from(e: ServerError) -> Self {
        Self::new(e.rpc_code(), e.to_string())
    }
}

/// Build a success response.
pub fn response(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response.
pub fn error_response(id: Value, error: RpcError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Build a notification.
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Reads framed messages from an async stream.
pub struct MessageReader<R> {
    reader: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Read the next message body. `None` at end of stream.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, ServerError> {
        let mut content_length = None;

        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return match content_length {
                    None => Ok(None),
                    Some(_) => Err(ServerError::protocol("Stream ended inside a header block")),
                };
            }

            let header = self.line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                if content_length.is_some() {
                    break;
                }
                // Stray blank line between messages
                continue;
            }

            let Some((name, value)) = header.split_once(':') else {
                return Err(ServerError::protocol(format!("Malformed header: {}", header)));
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let length = value.trim().parse::<usize>().map_err(|_| {
                    ServerError::protocol(format!("Invalid Content-Length: {}", value.trim()))
                })?;
                content_length = Some(length);
            }
            // Content-Type and unknown headers are ignored
        }

        let length = content_length.unwrap_or_default();
        if length > MAX_MESSAGE_SIZE {
            return Err(ServerError::protocol(format!(
                "Message of {} bytes exceeds the maximum of {} bytes",
                length, MAX_MESSAGE_SIZE
            )));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}

/// Writes framed messages to an async stream.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Frame and flush one message.
    pub async fn write_message(&mut self, message: &Value) -> Result<(), ServerError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[tokio::test]
    async fn test_read_framed_messages() {
        let input = format!(
            "{}{}",
            frame(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#),
            frame(r#"{"jsonrpc":"2.0","method":"exit"}"#)
        );
        let mut reader = MessageReader::new(BufReader::new(input.as_bytes()));

        let first = reader.read_message().await.unwrap().unwrap();
        let message: IncomingMessage = serde_json::from_slice(&first).unwrap();
        assert_eq!(message.method, "initialize");
        assert!(message.is_request());

        let second = reader.read_message().await.unwrap().unwrap();
        let message: IncomingMessage = serde_json::from_slice(&second).unwrap();
        assert_eq!(message.method, "exit");
        assert!(!message.is_request());
        assert_eq!(message.params, Value::Null);

        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extra_headers_are_ignored() {
        let body = r#"{"method":"shutdown","id":"a"}"#;
        let input = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut reader = MessageReader::new(BufReader::new(input.as_bytes()));
        assert_eq!(reader.read_message().await.unwrap().unwrap(), body.as_bytes());
    }

    #[tokio::test]
    async fn test_bad_headers() {
        let mut reader = MessageReader::new(BufReader::new(&b"Content-Length: abc\r\n\r\n"[..]));
        assert!(matches!(
            reader.read_message().await,
            Err(ServerError::Protocol(_))
        ));

        let mut reader = MessageReader::new(BufReader::new(&b"Content-Length: 10\r\n"[..]));
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut writer = MessageWriter::new(Vec::new());
        let message = notification("query/message", serde_json::json!({ "ownerUri": "doc1" }));
        writer.write_message(&message).await.unwrap();
        let bytes = writer.into_inner();

        let mut reader = MessageReader::new(BufReader::new(&bytes[..]));
        let body = reader.read_message().await.unwrap().unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_error_codes() {
        let error = RpcError::from(ServerError::no_query("doc1"));
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(RpcError::method_not_found("x/y").code, METHOD_NOT_FOUND);
        let json = error_response(Value::from(4), error);
        assert_eq!(json["error"]["code"], INVALID_PARAMS);
        assert_eq!(json["id"], 4);
    }
}
