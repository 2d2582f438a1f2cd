// Licensed under the Apache License, Version 2.0 (see LICENSE).
//! HTTP front end for the sandboxed code-execution service.
//!
//! The wire contract is deliberately simple: the request path names a Docker
//! image, repeated `arg`/`env` query parameters supply the command line and
//! environment, and the request body is a ZIP archive of the student's
//! submission. The response is always a JSON object with `Output` and `Ok`
//! fields, whether the submission ran to completion or the pipeline itself
//! failed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json};
use axum::Router;
use bollard::Docker;
use clap::Parser;
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;

use runner::{ExecutionRequest, FreshnessCache, IdentityTracker, RunOutcome, MAX_OUTPUT_BYTES};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "runnerd")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

struct AppState {
    docker: Docker,
    identity: IdentityTracker,
    freshness: FreshnessCache,
    registry_password: Option<String>,
}

#[derive(Serialize)]
struct Response {
    #[serde(rename = "Output")]
    output: String,
    #[serde(rename = "Ok")]
    ok: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let docker = Docker::connect_with_local_defaults()
        .expect("failed to connect to the Docker daemon");

    let state = Arc::new(AppState {
        docker,
        identity: IdentityTracker::new(),
        freshness: FreshnessCache::new(),
        registry_password: std::env::var("REGISTRY_PASSWORD").ok(),
    });

    let app = Router::new()
        .fallback(handler)
        .layer(DefaultBodyLimit::disable())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    log::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

async fn handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> impl IntoResponse {
    if body.len() > MAX_OUTPUT_BYTES {
        return error_response(
            StatusCode::BAD_REQUEST,
            "request body too large, is your repository too large?",
        );
    }

    let image = uri.path().trim_matches('/').to_string();
    if image.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no image specified");
    }

    let (args, env) = parse_query(uri.query().unwrap_or(""));

    let client = client_identifier(&headers, peer);
    let request_id = state.identity.identify(&client);

    let req = ExecutionRequest {
        image,
        env,
        args,
        body: body.to_vec(),
    };

    match runner::run_request(
        &state.docker,
        &state.freshness,
        state.registry_password.as_deref(),
        &request_id,
        req,
    )
    .await
    {
        Ok(RunOutcome { output, ok }) => (
            StatusCode::OK,
            Json(Response {
                output: String::from_utf8_lossy(&output).into_owned(),
                ok,
            }),
        ),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<Response>) {
    (
        status,
        Json(Response {
            output: message.to_string(),
            ok: false,
        }),
    )
}

/// Splits `arg`/`env` query parameters into ordered lists, preserving
/// repetition and order of appearance.
fn parse_query(query: &str) -> (Vec<String>, Vec<String>) {
    let mut args = Vec::new();
    let mut env = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "args" => args.push(value.into_owned()),
            "env" => env.push(value.into_owned()),
            _ => {}
        }
    }
    (args, env)
}

/// Prefers the first address in `X-Forwarded-For`, falling back to the TCP
/// peer address, so requests behind a reverse proxy are still attributed to
/// the real client for rate-limited identifier assignment.
fn client_identifier(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}
