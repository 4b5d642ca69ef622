use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn};

use crate::errors::CounterError;
use crate::helpers::{group_thousands, timestamp};
use crate::service::CounterService;

/// Body of every successful response
#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub value: i64,
    pub timestamp: String,
}

/// Body of every failed response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Read,
    Increment,
    Decrement,
}

struct ApiError {
    op: Operation,
    err: CounterError,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.err {
            CounterError::NotFound { .. } => StatusCode::NOT_FOUND,
            CounterError::Boundary { .. } => StatusCode::BAD_REQUEST,
            CounterError::RetryExhausted { .. } => StatusCode::CONFLICT,
            CounterError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match (&self.err, self.op) {
            (CounterError::NotFound { .. }, _) => {
                "Counter not found in database. Please initialize the counter.".to_owned()
            }
            (CounterError::Boundary { max, .. }, Operation::Increment) => format!(
                "Cannot increment counter: already at maximum value ({})",
                group_thousands(*max)
            ),
            (CounterError::Boundary { min, .. }, Operation::Decrement) => format!(
                "Cannot decrement counter: already at minimum value ({})",
                group_thousands(*min)
            ),
            (CounterError::RetryExhausted { .. }, _) => {
                "Counter update failed due to concurrent modifications. Please retry.".to_owned()
            }
            (CounterError::Boundary { min, max, .. }, Operation::Read) => format!(
                "Counter value is outside the valid range [{}, {}]",
                group_thousands(*min),
                group_thousands(*max)
            ),
            (CounterError::Store(err), _) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(op = ?self.op, error = %self.err, "counter request failed");
        } else {
            warn!(op = ?self.op, error = %self.err, "counter request rejected");
        }

        let body = ErrorResponse { error: self.err.code().to_owned(), message: self.message() };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<CountResponse>, ApiError>;

fn respond(op: Operation, result: Result<crate::Counter, CounterError>) -> ApiResult {
    let counter = result.map_err(|err| ApiError { op, err })?;
    let response = CountResponse { value: counter.value, timestamp: timestamp() };
    info!(
        op = ?op,
        value = counter.value,
        version = counter.version,
        timestamp = %response.timestamp,
        "counter request served"
    );
    Ok(Json(response))
}

async fn get_count(State(counter): State<Arc<CounterService>>) -> ApiResult {
    respond(Operation::Read, counter.get().await)
}

async fn increment(State(counter): State<Arc<CounterService>>) -> ApiResult {
    respond(Operation::Increment, counter.increment().await)
}

async fn decrement(State(counter): State<Arc<CounterService>>) -> ApiResult {
    respond(Operation::Decrement, counter.decrement().await)
}

/// HTTP routes over a shared counter.
///
/// - `GET /count`
/// - `POST /increment`
/// - `POST /decrement`
pub fn router(counter: Arc<CounterService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|id| id.to_str().ok())
            .unwrap_or("direct-invocation");
        info_span!("request", method = %request.method(), uri = %request.uri(), request_id)
    });

    // Last layer added runs first
    Router::new()
        .route("/count", get(get_count))
        .route("/increment", post(increment))
        .route("/decrement", post(decrement))
        .with_state(counter)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace)
        .layer(cors)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Serve the counter on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    counter: Arc<CounterService>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, key = counter.key(), "counter server listening");
    }
    axum::serve(listener, router(counter)).with_graceful_shutdown(shutdown).await
}
