use crate::proposals::ProposalStatus;
use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let (status, pending_count) = match state.store.list(Some(ProposalStatus::Pending)).await {
        Ok(pending) => ("ok", Some(pending.len())),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not read proposal store");
            ("degraded", None)
        }
    };

    Json(serde_json::json!({
        "status": status,
        "checked_at": Utc::now(),
        "pending_count": pending_count,
    }))
}
