// Message loop: read, classify, spawn a task per message, write replies

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{failure, success, Incoming, JsonRpcMessage, ResponseError};

/// Server side of the protocol, called from independent tasks
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ResponseError>;

    async fn handle_notification(&self, method: &str, params: Value) -> Result<()>;

    /// Process exit status once `exit` arrives
    fn exit_code(&self) -> i32;
}

/// Serve newline-delimited JSON until `exit` or end of input.
/// Returns the exit status; transport failures are errors.
pub async fn run<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> Result<i32>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: MessageHandler,
{
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut lines = reader.lines();
    let mut exit_code = 1;
    loop {
        let line = match lines.next_line().await.context("Failed to read message")? {
            Some(line) => line,
            None => {
                info!("Input closed without exit");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable message: {}", e);
                let _ = tx.send(failure(Value::Null, &ResponseError::parse_error(e.to_string())));
                continue;
            }
        };

        match message.classify() {
            Incoming::Request { id, method, params } => {
                spawn_request(handler.clone(), tx.clone(), id, method, params);
            }
            Incoming::Notification { method, .. } if method == "exit" => {
                exit_code = handler.exit_code();
                info!("Exit requested, status {}", exit_code);
                break;
            }
            Incoming::Notification { method, params } => {
                spawn_notification(handler.clone(), method, params);
            }
            Incoming::Response => debug!("Ignoring response message"),
            Incoming::Invalid { id } => {
                let _ = tx.send(failure(id, &ResponseError::invalid_request("Message has no method")));
            }
        }
    }

    // In-flight tasks keep their own senders; stop the writer without waiting on them
    drop(tx);
    writer_task.abort();
    Ok(exit_code)
}

fn spawn_request<H: MessageHandler>(
    handler: Arc<H>,
    tx: mpsc::UnboundedSender<Value>,
    id: Value,
    method: String,
    params: Value,
) {
    tokio::spawn(async move {
        let task = {
            let method = method.clone();
            tokio::spawn(async move { handler.handle_request(&method, params).await })
        };
        let response = match task.await {
            Ok(Ok(result)) => success(id, result),
            Ok(Err(err)) => {
                debug!("{} failed: {}", method, err);
                failure(id, &err)
            }
            Err(join_error) => {
                error!("Handler for {} crashed: {}", method, join_error);
                failure(id, &ResponseError::internal(format!("Internal error in {}", method)))
            }
        };
        let _ = tx.send(response);
    });
}

fn spawn_notification<H: MessageHandler>(handler: Arc<H>, method: String, params: Value) {
    tokio::spawn(async move {
        let task = {
            let method = method.clone();
            tokio::spawn(async move { handler.handle_notification(&method, params).await })
        };
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Notification {} failed: {:#}", method, e),
            Err(join_error) => error!("Notification handler for {} crashed: {}", method, join_error),
        }
    });
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
            }
        };
        debug!("Sending: {}", line);
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("Failed to write response: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush response: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct TestHandler {
        shutdown: AtomicBool,
        notified: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
            match method {
                "echo" => Ok(params),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("slow"))
                }
                "fail" => Err(ResponseError::invalid_params("bad input")),
                "panic" => panic!("handler bug"),
                "shutdown" => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
                other => Err(ResponseError::method_not_found(other)),
            }
        }

        async fn handle_notification(&self, method: &str, _params: Value) -> Result<()> {
            if method == "boom" {
                panic!("notification bug");
            }
            self.notified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn exit_code(&self) -> i32 {
            if self.shutdown.load(Ordering::SeqCst) {
                0
            } else {
                1
            }
        }
    }

    struct Client {
        writer: WriteHalf<DuplexStream>,
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    }

    impl Client {
        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn start(handler: Arc<TestHandler>) -> (Client, tokio::task::JoinHandle<Result<i32>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(run(BufReader::new(server_read), server_write, handler));
        let (client_read, client_write) = tokio::io::split(client);
        (
            Client {
                writer: client_write,
                lines: BufReader::new(client_read).lines(),
            },
            task,
        )
    }

    #[tokio::test]
    async fn test_requests_get_responses() {
        let handler = Arc::new(TestHandler::default());
        let (mut client, task) = start(handler.clone());

        client.send(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"x": 1}})).await;
        assert_eq!(client.recv().await, json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 1}}));

        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": "fail"})).await;
        let response = client.recv().await;
        assert_eq!(response["id"], json!(2));
        assert_eq!(response["error"]["code"], json!(-32602));

        client.send(json!({"jsonrpc": "2.0", "id": 3, "method": "nope"})).await;
        assert_eq!(client.recv().await["error"]["code"], json!(-32601));

        client.send_raw("{not json\n").await;
        let response = client.recv().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["code"], json!(-32700));

        client.send(json!({"jsonrpc": "2.0", "method": "exit"})).await;
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_panics_are_isolated() {
        let handler = Arc::new(TestHandler::default());
        let (mut client, task) = start(handler.clone());

        client.send(json!({"jsonrpc": "2.0", "method": "boom"})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 1, "method": "panic"})).await;
        let response = client.recv().await;
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["error"]["code"], json!(-32603));

        // The loop is still serving
        client.send(json!({"jsonrpc": "2.0", "method": "ping"})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": 2})).await;
        assert_eq!(client.recv().await["result"], json!(2));
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.notified.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.send(json!({"jsonrpc": "2.0", "method": "exit"})).await;
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requests_run_concurrently() {
        let handler = Arc::new(TestHandler::default());
        let (mut client, task) = start(handler);

        client.send(json!({"jsonrpc": "2.0", "id": "slow", "method": "slow"})).await;
        client.send(json!({"jsonrpc": "2.0", "id": "fast", "method": "echo", "params": true})).await;

        assert_eq!(client.recv().await["id"], json!("fast"));
        assert_eq!(client.recv().await["id"], json!("slow"));

        // Inbound responses are ignored
        client.send(json!({"jsonrpc": "2.0", "id": 99, "result": null})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 4, "method": "shutdown"})).await;
        assert_eq!(client.recv().await["id"], json!(4));
        client.send(json!({"jsonrpc": "2.0", "method": "exit"})).await;
        assert_eq!(task.await.unwrap().unwrap(), 0);
    }
}
