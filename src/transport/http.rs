//! HTTP + SSE transport (spec §4.6 "HTTP+SSE transport"): `GET /health`,
//! `GET /sse`, `POST /rpc` on a configured bind address. Default bind is
//! localhost-only; non-localhost binding requires an explicit CLI override,
//! enforced in `config.rs` before this module ever runs.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};

use crate::dispatch::Dispatcher;
use crate::transport::{handle_request, JsonRpcRequest, JsonRpcResponse};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    verbose_errors: bool,
}

pub async fn run(dispatcher: Arc<Dispatcher>, verbose_errors: bool, bind_addr: &str) -> std::io::Result<()> {
    let state = AppState { dispatcher, verbose_errors };

    let app = Router::new()
        .route("/health", get(health))
        .route("/sse", get(sse_handler))
        .route("/rpc", post(rpc_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(vec![http::Method::GET, http::Method::POST])
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state);

    tracing::info!(addr = %bind_addr, "HTTP+SSE transport listening");
    tracing::warn!("HTTP transport has no built-in authentication; rely on network placement");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn sse_handler() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_id = uuid::Uuid::new_v4().to_string();
    let connection_event = Event::default()
        .event("connection")
        .data(serde_json::json!({ "client_id": client_id }).to_string());

    let stream = stream::once(async move { Ok(connection_event) });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

async fn rpc_handler(State(state): State<AppState>, Json(request): Json<JsonRpcRequest>) -> impl IntoResponse {
    let response: JsonRpcResponse = handle_request(&state.dispatcher, request, state.verbose_errors).await;
    Json(response)
}
