use crate::proposals::{ProposalRequest, SubmitError};
use crate::server::AppState;
use axum::Extension;
use axum::body::Bytes;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/proposals", post(post_proposal))
}

/// Always answers 202 once authorised: the proposer learns nothing about
/// validation or storage outcomes, which are only logged.
#[tracing::instrument(level = "info", skip_all)]
async fn post_proposal(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !bearer_matches(state.ingest_token.as_deref(), &headers) {
        tracing::warn!("proposal ingestion rejected: missing or wrong bearer token");
        return StatusCode::UNAUTHORIZED;
    }

    let request: ProposalRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "proposal ingestion body is not a proposal request");
            return StatusCode::ACCEPTED;
        }
    };

    match state.service.submit(request).await {
        Ok(proposal) => {
            tracing::info!(
                proposal_id = %proposal.id,
                presented = proposal.message.is_some(),
                "proposal ingested"
            );
        }
        // Logged with its rule by the service.
        Err(SubmitError::Invalid(_)) => {}
        Err(SubmitError::Store(e)) => {
            tracing::error!(error = %e, "proposal could not be stored");
        }
    }
    StatusCode::ACCEPTED
}

fn bearer_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected.map(str::trim).filter(|t| !t.is_empty()) else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == expected)
}
