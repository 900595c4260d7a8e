//! HTTP surface of the submission client.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reading_client::domain::{MetricKind, Reading, SubmissionRecord};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ClientError, LatestReading, ManualCorrection, SubmissionClient},
    queue::{FlushReport, QueueError},
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Invalid(msg) => ApiError::BadRequest(msg),
            ClientError::Queue(QueueError::Invalid(msg)) => ApiError::BadRequest(msg),
            ClientError::Queue(QueueError::NotFound(id)) => {
                ApiError::NotFound(format!("no submission with id {id}"))
            }
            ClientError::Queue(QueueError::Transition(e)) => ApiError::Conflict(e.to_string()),
            ClientError::Log(e) if e.is_connectivity() => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

type AppState = Arc<SubmissionClient>;

pub fn router(client: AppState) -> Router {
    Router::new()
        .route("/readings/manual", post(submit_manual))
        .route("/readings/:kind/latest", get(latest))
        .route("/readings/:kind", get(history))
        .route("/submissions/pending", get(pending))
        .route("/submissions/failed", get(failed))
        .route("/submissions/flush", post(flush))
        .route("/submissions/:reading_id/retry", post(retry))
        .with_state(client)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(bind_addr: &str, client: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind address {bind_addr}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "submission api listening");

    axum::serve(listener, router(client).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn parse_kind(kind: &str) -> Result<MetricKind, ApiError> {
    kind.parse().map_err(|e: reading_client::domain::ParseDomainError| ApiError::BadRequest(e.to_string()))
}

async fn latest(
    State(client): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Option<LatestReading>>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(client.latest(kind).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(with = "time::serde::rfc3339")]
    from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    to: OffsetDateTime,
}

async fn history(
    State(client): State<AppState>,
    Path(kind): Path<String>,
    Query(window): Query<HistoryQuery>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(client.history(kind, window.from, window.to).await?))
}

async fn submit_manual(
    State(client): State<AppState>,
    Json(correction): Json<ManualCorrection>,
) -> Result<(StatusCode, Json<SubmissionRecord>), ApiError> {
    let record = client.submit_correction(correction).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn pending(State(client): State<AppState>) -> Result<Json<Vec<SubmissionRecord>>, ApiError> {
    Ok(Json(client.pending().await?))
}

async fn failed(State(client): State<AppState>) -> Result<Json<Vec<SubmissionRecord>>, ApiError> {
    Ok(Json(client.failed().await?))
}

async fn retry(
    State(client): State<AppState>,
    Path(reading_id): Path<String>,
) -> Result<Json<SubmissionRecord>, ApiError> {
    Ok(Json(client.retry_failed(&reading_id).await?))
}

async fn flush(State(client): State<AppState>) -> Result<Json<FlushReport>, ApiError> {
    Ok(Json(client.flush_now().await?))
}
