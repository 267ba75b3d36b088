//! Line-delimited JSON (NDJSON) stdio transport (spec §4.6 "Stdio
//! transport"). One request per line, one response per line; diagnostic
//! output goes to stderr only; reads are blocking and the loop is strictly
//! serial -- one in-flight request at a time (spec §5 concurrency model).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dispatch::Dispatcher;
use crate::transport::{handle_request, JsonRpcRequest, JsonRpcResponse};

pub async fn run(dispatcher: Arc<Dispatcher>, verbose_errors: bool, mut trace_writer: Option<tracing_appender::non_blocking::NonBlocking>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF: client closed stdin.
            Err(e) => {
                tracing::error!(error = %e, "stdio read error");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        if let Some(writer) = trace_writer.as_mut() {
            use std::io::Write;
            let _ = writeln!(writer, "> {line}");
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => handle_request(&dispatcher, request, verbose_errors).await,
            Err(e) => JsonRpcResponse::err(
                None,
                serde_json::json!({ "code": -32700, "message": format!("parse error: {e}") }),
            ),
        };

        let serialized = serde_json::to_string(&response).unwrap_or_default();

        if let Some(writer) = trace_writer.as_mut() {
            use std::io::Write;
            let _ = writeln!(writer, "< {serialized}");
        }

        // One `write_all` + flush per line: the nearest thing to an atomic
        // write a line-buffered consumer on the other end can rely on.
        if let Err(e) = stdout.write_all(serialized.as_bytes()).await {
            tracing::error!(error = %e, "stdio write error");
            break;
        }
        if let Err(e) = stdout.write_all(b"\n").await {
            tracing::error!(error = %e, "stdio write error");
            break;
        }
        if let Err(e) = stdout.flush().await {
            tracing::error!(error = %e, "stdio flush error");
            break;
        }
    }
}
