//! Peer protocol handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lodestar_distro::{DigestRequest, DistroError, DistroRecord, ForwardRequest, QueryRequest};
use lodestar_state::StateError;
use serde::Serialize;
use tracing::warn;

use crate::PeerApiState;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(error: &DistroError) -> StatusCode {
    match error {
        DistroError::Codec(_) => StatusCode::BAD_REQUEST,
        DistroError::State(StateError::Validation(_)) => StatusCode::BAD_REQUEST,
        DistroError::State(StateError::NotFound(_)) => StatusCode::NOT_FOUND,
        DistroError::State(StateError::Conflict { .. }) => StatusCode::CONFLICT,
        DistroError::Forward(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DistroError::PeerUnreachable { .. } | DistroError::Rejected { .. } => StatusCode::BAD_GATEWAY,
        DistroError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(route: &str, result: Result<T, DistroError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            let status = status_for(&e);
            warn!(route, status = status.as_u16(), error = %e, "peer request failed");
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

/// POST /distro/v1/datum
pub async fn receive_record(State(state): State<PeerApiState>, Json(record): Json<DistroRecord>) -> Response {
    reply("datum", state.endpoint.on_record(record).await)
}

/// POST /distro/v1/checksum
pub async fn receive_digest(State(state): State<PeerApiState>, Json(request): Json<DigestRequest>) -> Response {
    reply("checksum", state.endpoint.on_digest(request).await)
}

/// POST /distro/v1/query
pub async fn query_records(State(state): State<PeerApiState>, Json(request): Json<QueryRequest>) -> Response {
    reply("query", state.endpoint.on_query(request).await)
}

/// POST /distro/v1/forward
pub async fn receive_forward(State(state): State<PeerApiState>, Json(request): Json<ForwardRequest>) -> Response {
    reply("forward", state.endpoint.on_forward(request).await)
}

/// GET /distro/v1/ping
pub async fn ping(State(state): State<PeerApiState>) -> impl IntoResponse {
    Json(state.endpoint.on_ping())
}
