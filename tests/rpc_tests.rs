//! End-to-end tests of the JSON-RPC host over an in-memory stream.

mod common;

use common::{Harness, Script, Step, WAIT};
use mssql_query_service::database::SqlValue;
use mssql_query_service::rpc::{MessageReader, RpcHost};
use mssql_query_service::shutdown::ShutdownController;
use mssql_query_service::{QueryExecutionService, ServerError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const OWNER: &str = "file:///rpc.sql";

struct Client {
    writer: WriteHalf<DuplexStream>,
    reader: MessageReader<BufReader<ReadHalf<DuplexStream>>>,
    next_id: i64,
}

impl Client {
    async fn send_raw(&mut self, body: &str) {
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await;
    }

    /// Next frame from the host.
    async fn next(&mut self) -> Value {
        let body = tokio::time::timeout(WAIT, self.reader.read_message())
            .await
            .expect("frame in time")
            .unwrap()
            .expect("stream open");
        serde_json::from_slice(&body).unwrap()
    }

    /// Send a request and return its response, plus any notifications that
    /// arrived first.
    async fn request(&mut self, method: &str, params: Value) -> (Value, Vec<Value>) {
        self.next_id += 1;
        let id = self.next_id;
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await;

        let mut notifications = Vec::new();
        loop {
            let frame = self.next().await;
            if frame.get("id") == Some(&json!(id)) {
                return (frame, notifications);
            }
            notifications.push(frame);
        }
    }

    /// Collect notifications through `query/complete`.
    async fn until_complete(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            let done = frame["method"] == "query/complete";
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

struct Session {
    client: Client,
    service: Arc<QueryExecutionService>,
    shutdown: Arc<ShutdownController>,
    served: JoinHandle<Result<(), ServerError>>,
}

fn start(script: Script) -> Session {
    let Harness {
        service,
        workspace,
        events,
        ..
    } = Harness::new(script);
    let shutdown = Arc::new(ShutdownController::new());
    let host = RpcHost::new(service.clone(), workspace, shutdown.clone());

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_end);
    let served = tokio::spawn(async move {
        host.serve(BufReader::new(server_read), server_write, events)
            .await
    });

    let (client_read, client_write) = tokio::io::split(client_end);
    Session {
        client: Client {
            writer: client_write,
            reader: MessageReader::new(BufReader::new(client_read)),
            next_id: 0,
        },
        service,
        shutdown,
        served,
    }
}

async fn connect(client: &mut Client, owner_uri: &str) {
    let (response, _) = client
        .request(
            "connection/connect",
            json!({
                "ownerUri": owner_uri,
                "connection": { "serverName": "scripted", "userName": "sa" }
            }),
        )
        .await;
    assert_eq!(response["result"], json!(true));
}

fn methods(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["method"].as_str()).collect()
}

fn two_selects() -> Script {
    Script::new()
        .on(
            "SELECT 1 AS a",
            vec![Step::columns(&[("a", "INT")]), Step::row(vec![SqlValue::I32(1)])],
        )
        .on(
            "SELECT 'x' AS b",
            vec![
                Step::columns(&[("b", "VARCHAR")]),
                Step::row(vec![SqlValue::String("x".to_string())]),
            ],
        )
}

#[tokio::test]
async fn test_execute_string_flow() {
    let mut session = start(two_selects());
    let client = &mut session.client;

    let (init, _) = client.request("initialize", json!({})).await;
    assert_eq!(init["result"]["capabilities"]["textDocumentSync"], 1);

    connect(client, OWNER).await;

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 100,
            "method": "query/executeString",
            "params": { "ownerUri": OWNER, "query": "SELECT 1 AS a; SELECT 'x' AS b" }
        }))
        .await;

    // The acknowledgement precedes every notification of the query
    let ack = client.next().await;
    assert_eq!(ack["id"], 100);
    assert_eq!(ack["result"], json!({}));

    let frames = client.until_complete().await;
    assert_eq!(
        methods(&frames),
        vec![
            "query/batchStart",
            "query/message",
            "query/resultSetComplete",
            "query/batchComplete",
            "query/batchStart",
            "query/message",
            "query/resultSetComplete",
            "query/batchComplete",
            "query/complete",
        ]
    );
    let complete = frames.last().unwrap();
    assert_eq!(complete["params"]["ownerUri"], OWNER);
    assert_eq!(complete["params"]["batchSummaries"].as_array().unwrap().len(), 2);

    let (subset, _) = client
        .request(
            "query/subset",
            json!({
                "ownerUri": OWNER,
                "batchIndex": 1,
                "resultSetIndex": 0,
                "rowsStartIndex": 0,
                "rowsCount": 10
            }),
        )
        .await;
    let result = &subset["result"]["resultSubset"];
    assert_eq!(result["rowCount"], 1);
    assert_eq!(result["rows"][0][0]["displayValue"], "x");
    assert_eq!(result["rows"][0][0]["isNull"], false);

    let (disposed, _) = client
        .request("query/dispose", json!({ "ownerUri": OWNER }))
        .await;
    assert_eq!(disposed["result"], json!({}));
    assert_eq!(session.service.query_count(), 0);

    session.client.notify("exit", Value::Null).await;
    let served = tokio::time::timeout(WAIT, session.served).await.unwrap().unwrap();
    assert!(served.is_ok());
}

#[tokio::test]
async fn test_document_selection_from_open_document() {
    let mut session = start(two_selects());
    let client = &mut session.client;
    connect(client, OWNER).await;

    client
        .notify(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": OWNER, "languageId": "sql", "version": 1, "text": "SELECT 1 AS a" } }),
        )
        .await;

    let (ack, early) = client
        .request("query/executeDocumentSelection", json!({ "ownerUri": OWNER }))
        .await;
    assert!(early.is_empty());
    assert_eq!(ack["result"], json!({}));

    let frames = client.until_complete().await;
    let complete = frames.last().unwrap();
    let summary = &complete["params"]["batchSummaries"][0];
    assert_eq!(summary["hasError"], false);
    assert_eq!(summary["resultSetSummaries"][0]["rowCount"], 1);
}

#[tokio::test]
async fn test_cancelled_query_notifications() {
    let script = Script::new().on(
        "WAITFOR DELAY '00:01'",
        vec![Step::Pause(Duration::from_secs(60))],
    );
    let mut session = start(script);
    let client = &mut session.client;
    connect(client, OWNER).await;

    let (ack, _) = client
        .request(
            "query/executeString",
            json!({ "ownerUri": OWNER, "query": "WAITFOR DELAY '00:01'" }),
        )
        .await;
    assert_eq!(ack["result"], json!({}));

    let started = client.next().await;
    assert_eq!(started["method"], "query/batchStart");

    let (cancelled, mut frames) = client
        .request("query/cancel", json!({ "ownerUri": OWNER }))
        .await;
    assert_eq!(cancelled["result"], json!({}));

    if !frames.iter().any(|f| f["method"] == "query/complete") {
        frames.extend(client.until_complete().await);
    }
    let failure = frames
        .iter()
        .rev()
        .find(|f| f["method"] == "query/message")
        .unwrap();
    assert_eq!(failure["params"]["message"]["isError"], true);
    assert_eq!(
        failure["params"]["message"]["message"],
        "Query was cancelled by user."
    );
    assert_eq!(methods(&frames).last().copied(), Some("query/complete"));
}

#[tokio::test]
async fn test_error_responses() {
    let mut session = start(Script::new());
    let client = &mut session.client;

    let (unknown, _) = client.request("query/unknown", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let (missing, _) = client
        .request(
            "query/subset",
            json!({ "ownerUri": OWNER, "batchIndex": 0, "resultSetIndex": 0, "rowsStartIndex": 0, "rowsCount": 1 }),
        )
        .await;
    assert_eq!(missing["error"]["code"], -32602);

    let (bad_params, _) = client.request("query/cancel", json!({})).await;
    assert_eq!(bad_params["error"]["code"], -32602);

    let (not_connected, _) = client
        .request(
            "query/executeString",
            json!({ "ownerUri": OWNER, "query": "SELECT 1" }),
        )
        .await;
    assert_eq!(not_connected["error"]["code"], -32602);
    assert!(not_connected["error"]["message"]
        .as_str()
        .unwrap()
        .contains(OWNER));

    client.send_raw("{ not json").await;
    let parse_error = client.next().await;
    assert_eq!(parse_error["error"]["code"], -32700);
    assert_eq!(parse_error["id"], Value::Null);
}

#[tokio::test]
async fn test_configuration_change_updates_settings() {
    let mut session = start(Script::new());
    let client = &mut session.client;

    client
        .notify(
            "workspace/didChangeConfiguration",
            json!({ "settings": { "mssql": { "query": { "rowCount": 7 } } } }),
        )
        .await;
    // Notifications are handled before the next request is read
    client.request("initialize", json!({})).await;

    let settings = session.service.settings();
    assert_eq!(settings.row_count, 7);
    assert_eq!(settings.batch_separator, "GO");
}

#[tokio::test]
async fn test_shutdown_request_and_signal() {
    let mut session = start(Script::new());

    let (response, _) = session.client.request("shutdown", Value::Null).await;
    assert_eq!(response["result"], Value::Null);

    session.shutdown.shutdown();
    let served = tokio::time::timeout(WAIT, session.served).await.unwrap().unwrap();
    assert!(served.is_ok());
}

#[tokio::test]
async fn test_end_of_input_stops_host() {
    let session = start(Script::new());
    let Session { client, served, .. } = session;
    drop(client);

    let served = tokio::time::timeout(WAIT, served).await.unwrap().unwrap();
    assert!(served.is_ok());
}
