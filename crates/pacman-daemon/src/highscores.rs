use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use pacman_db::{
    validation::validate_highscore, HighscoreRecord, HighscoreSubmission, DEFAULT_TOP_SCORES,
};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    provenance::ClientProvenance,
    server::{ApiError, AppState},
};

/// Public leaderboard row. Provenance stays server-side.
#[derive(Debug, Serialize, ToSchema)]
pub struct HighscoreListing {
    pub name: String,
    pub cloud: String,
    pub zone: String,
    pub host: String,
    pub score: i64,
}

impl From<HighscoreRecord> for HighscoreListing {
    fn from(record: HighscoreRecord) -> Self {
        Self {
            name: record.name,
            cloud: record.cloud,
            zone: record.zone,
            host: record.host,
            score: record.score,
        }
    }
}

/// Echo of an accepted submission, with the values as stored.
#[derive(Debug, Serialize, ToSchema)]
pub struct HighscoreAccepted {
    #[schema(value_type = String, example = "success")]
    pub rs: &'static str,
    pub name: String,
    pub zone: String,
    pub score: i64,
    pub level: i64,
}

#[utoipa::path(
    get,
    path = "/highscores/list",
    responses(
        (status = 200, description = "Top scores, highest first", body = [HighscoreListing]),
        (status = 500, description = "Storage unavailable", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn list_highscores(
    State(state): State<AppState>,
) -> Result<Json<Vec<HighscoreListing>>, ApiError> {
    let db = state.db.get_handle().await?;
    let records = db.highscores().top_scores(DEFAULT_TOP_SCORES).await?;
    Ok(Json(records.into_iter().map(HighscoreListing::from).collect()))
}

#[utoipa::path(
    post,
    path = "/highscores",
    request_body = HighscoreSubmission,
    responses(
        (status = 200, description = "Highscore stored", body = HighscoreAccepted),
        (status = 400, description = "Submission failed validation", body = crate::server::ErrorBody),
        (status = 500, description = "Storage unavailable", body = crate::server::ErrorBody)
    )
)]
pub(crate) async fn submit_highscore(
    State(state): State<AppState>,
    ClientProvenance(provenance): ClientProvenance,
    payload: Result<Json<HighscoreSubmission>, JsonRejection>,
) -> Result<Json<HighscoreAccepted>, ApiError> {
    let Json(submission) = payload?;
    let entry = validate_highscore(&submission)?;

    let db = state.db.get_handle().await?;
    let id = db.highscores().insert(&entry, &provenance).await?;
    info!(id, score = entry.score, level = entry.level, zone = %entry.metadata.zone, "highscore recorded");

    Ok(Json(HighscoreAccepted {
        rs: "success",
        name: entry.name,
        zone: entry.metadata.zone,
        score: entry.score,
        level: entry.level,
    }))
}
