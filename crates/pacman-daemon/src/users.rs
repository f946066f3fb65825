//! Per-session stats endpoints under `/user`.

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use pacman_db::{
    validation::validate_stats, SessionId, SessionStatsRecord, StatsSubmission, UpdateOutcome,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    provenance::ClientProvenance,
    server::{Ack, ApiError, AppState},
};

/// One reportable session as shown on the stats page.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionStatsListing {
    pub cloud: Option<String>,
    pub zone: Option<String>,
    pub host: Option<String>,
    pub score: Option<i64>,
    pub level: Option<i64>,
    pub lives: Option<i64>,
    /// Elapsed play time in seconds.
    pub et: Option<i64>,
    /// Number of accepted updates.
    pub txncount: Option<i64>,
}

impl From<SessionStatsRecord> for SessionStatsListing {
    fn from(record: SessionStatsRecord) -> Self {
        Self {
            cloud: record.cloud,
            zone: record.zone,
            host: record.host,
            score: record.score,
            level: record.level,
            lives: record.lives,
            et: record.elapsed_time,
            txncount: record.update_counter,
        }
    }
}

#[utoipa::path(
    get,
    path = "/user/id",
    responses(
        (status = 200, description = "Identifier of a freshly created session", body = String),
        (status = 500, description = "Storage unavailable", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn issue_session_id(
    State(state): State<AppState>,
) -> Result<Json<SessionId>, ApiError> {
    let db = state.db.get_handle().await?;
    let id = db.sessions().create_session().await?;
    info!(session_id = %id, "session started");
    Ok(Json(id))
}

#[utoipa::path(
    post,
    path = "/user/stats",
    request_body = StatsSubmission,
    responses(
        (status = 200, description = "Stats recorded", body = Ack),
        (status = 400, description = "Submission failed validation", body = crate::server::ErrorBody),
        (status = 500, description = "Storage unavailable", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn submit_stats(
    State(state): State<AppState>,
    ClientProvenance(provenance): ClientProvenance,
    payload: Result<Json<StatsSubmission>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(submission) = payload?;
    let (id, stats) = validate_stats(&submission)?;

    let db = state.db.get_handle().await?;
    match db.sessions().update_session(id, &stats, &provenance).await? {
        UpdateOutcome::Updated => debug!(session_id = %id, score = stats.score, "session stats updated"),
        // Clients are not told about unknown sessions; they keep playing.
        UpdateOutcome::NotFound => {
            warn!(session_id = %id, ip = %provenance.ip_addr, "stats submitted for unknown session")
        }
    }
    Ok(Json(Ack::success()))
}

#[utoipa::path(
    get,
    path = "/user/stats",
    responses(
        (status = 200, description = "Every session with at least one update, oldest first", body = [SessionStatsListing]),
        (status = 500, description = "Storage unavailable", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn list_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionStatsListing>>, ApiError> {
    let db = state.db.get_handle().await?;
    let records = db.sessions().list_scored().await?;
    Ok(Json(records.into_iter().map(SessionStatsListing::from).collect()))
}
