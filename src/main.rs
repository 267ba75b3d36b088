use std::sync::Arc;

use odata_mcp_bridge::config::{RuntimeConfig, TransportKind};
use odata_mcp_bridge::dispatch::{load_implementation_hints, Dispatcher};
use odata_mcp_bridge::metadata::load_service_metadata;
use odata_mcp_bridge::session::Session;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match RuntimeConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("argument error: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    let filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let trace_writer = if config.trace_mcp {
        let temp_dir = std::env::temp_dir();
        let appender = tracing_appender::rolling::never(&temp_dir, "odata-mcp-bridge-trace.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Leaked intentionally: the guard must outlive the process for the
        // background writer thread to flush, and this process never tears
        // down the transport loop gracefully before exit.
        std::mem::forget(guard);
        Some(non_blocking)
    } else {
        None
    };

    match run(config, trace_writer).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(
    config: RuntimeConfig,
    trace_writer: Option<tracing_appender::non_blocking::NonBlocking>,
) -> Result<(), odata_mcp_bridge::error::BridgeError> {
    tracing::info!(service_url = %config.service_url, "starting odata-mcp-bridge");

    let session = Session::new(config.service_url.clone(), config.auth.clone(), std::time::Duration::from_secs(30))?;

    let metadata = load_service_metadata(&session, &config.service_url).await?;
    tracing::info!(
        entity_sets = metadata.entity_sets.len(),
        function_imports = metadata.function_imports.len(),
        service_id = %metadata.service_id,
        "metadata loaded"
    );

    let implementation_hints = load_implementation_hints(config.hints_file.as_deref(), config.hint.as_deref(), &config.service_url);

    let dispatcher = Arc::new(Dispatcher::new(
        metadata,
        session,
        &config.policy,
        config.info_tool_name.clone(),
        implementation_hints,
        config.legacy_dates,
        config.response_metadata,
        config.max_items,
        config.max_response_size,
        config.pagination_hints,
        config.verbose_errors,
    ));

    if config.trace {
        let table = dispatcher.list_tools();
        println!("{}", serde_json::to_string_pretty(&table).unwrap_or_default());
        return Ok(());
    }

    match config.transport {
        TransportKind::Stdio => {
            odata_mcp_bridge::transport::stdio::run(dispatcher, config.verbose_errors, trace_writer).await;
            Ok(())
        }
        TransportKind::Http => odata_mcp_bridge::transport::http::run(dispatcher, config.verbose_errors, &config.http_addr)
            .await
            .map_err(|e| odata_mcp_bridge::error::BridgeError::TransportError(e.to_string())),
    }
}
