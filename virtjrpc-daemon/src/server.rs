//! HTTP server: `POST /jrpc` for the JSON-RPC surface, the static UI from
//! `./ui` on everything else, permissive CORS and the global rate limit in
//! front of both.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cli::Args;
use crate::rpc::{self, service::AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jrpc", post(handle_jrpc))
        .fallback_service(ServeDir::new("ui"))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_jrpc(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    Json(rpc::handle_body(&state, body).await)
}

async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.allow() {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests\n").into_response();
    }
    next.run(request).await
}

pub async fn run(state: Arc<AppState>, args: &Args) -> anyhow::Result<()> {
    let app = router(state);

    match &args.unix_socket {
        Some(path) => {
            // A stale socket from a previous run refuses the bind.
            let _ = std::fs::remove_file(path);
            let listener = tokio::net::UnixListener::bind(path)?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
            info!(socket = %path, "starting JSON-RPC server");
            axum::serve(listener, app.into_make_service()).await?;
        }
        None => {
            let addr = format!("{}:{}", args.ip, args.port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(address = %addr, "starting JSON-RPC server");
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}
