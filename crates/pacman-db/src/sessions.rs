//! Per-session gameplay statistics.
//!
//! A session starts as a placeholder row holding only its id and creation
//! time. Each stats submission then replaces every mutable field in one
//! statement and bumps `update_counter`. Placeholders never show up in
//! listings; a row becomes reportable with its first update.
//!
//! Holding a session id is all it takes to update that session. There is no
//! ownership check tying an id to the client that created it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::PersistenceFailure, parse_datetime, CloudMetadata, Database, Provenance};

/// Storage-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Replacement values written by one stats submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub score: i64,
    pub level: i64,
    pub lives: i64,
    pub elapsed_time: i64,
    pub metadata: CloudMetadata,
}

/// Result of applying a stats submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The id was well formed but matched no row. Nothing was written.
    NotFound,
}

/// A session row. Gameplay fields are `None` until the first update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsRecord {
    pub id: SessionId,
    pub cloud: Option<String>,
    pub zone: Option<String>,
    pub host: Option<String>,
    pub score: Option<i64>,
    pub level: Option<i64>,
    pub lives: Option<i64>,
    pub elapsed_time: Option<i64>,
    pub update_counter: Option<i64>,
    pub date: DateTime<Utc>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub hostname: Option<String>,
    pub ip_addr: Option<String>,
}

impl SessionStatsRecord {
    pub fn is_reportable(&self) -> bool {
        self.score.is_some()
    }
}

/// Session operations over a borrowed handle.
#[derive(Debug, Clone, Copy)]
pub struct SessionStore<'a> {
    db: &'a Database,
}

impl<'a> SessionStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Inserts a placeholder row and returns the id the client will report under.
    pub async fn create_session(&self) -> Result<SessionId, PersistenceFailure> {
        let id = SessionId::generate();
        self.db
            .bounded(
                "create session",
                sqlx::query("INSERT INTO user_stats (id, date) VALUES (?, ?)")
                    .bind(id.to_string())
                    .bind(Utc::now().to_rfc3339())
                    .execute(self.db.pool()),
            )
            .await?;

        debug!(session_id = %id, "session created");
        Ok(id)
    }

    /// Replaces the session's mutable fields and increments its update counter
    /// in a single statement, so concurrent updates each count exactly once.
    pub async fn update_session(
        &self,
        id: SessionId,
        stats: &SessionStats,
        provenance: &Provenance,
    ) -> Result<UpdateOutcome, PersistenceFailure> {
        let result = self
            .db
            .bounded(
                "update session",
                sqlx::query(
                    r#"
                    UPDATE user_stats
                    SET cloud = ?, zone = ?, host = ?,
                        score = ?, level = ?, lives = ?, elapsed_time = ?,
                        date = ?,
                        referer = ?, user_agent = ?, hostname = ?, ip_addr = ?,
                        update_counter = COALESCE(update_counter, 0) + 1
                    WHERE id = ?
                    "#,
                )
                .bind(&stats.metadata.cloud)
                .bind(&stats.metadata.zone)
                .bind(&stats.metadata.host)
                .bind(stats.score)
                .bind(stats.level)
                .bind(stats.lives)
                .bind(stats.elapsed_time)
                .bind(Utc::now().to_rfc3339())
                .bind(&provenance.referer)
                .bind(&provenance.user_agent)
                .bind(&provenance.hostname)
                .bind(&provenance.ip_addr)
                .bind(id.to_string())
                .execute(self.db.pool()),
            )
            .await?;

        if result.rows_affected() == 0 {
            warn!(session_id = %id, "stats update matched no session");
            return Ok(UpdateOutcome::NotFound);
        }

        debug!(session_id = %id, score = stats.score, "session updated");
        Ok(UpdateOutcome::Updated)
    }

    /// Every session that has been updated at least once, oldest first.
    pub async fn list_scored(&self) -> Result<Vec<SessionStatsRecord>, PersistenceFailure> {
        let rows = self
            .db
            .bounded(
                "list scored sessions",
                sqlx::query("SELECT * FROM user_stats WHERE score IS NOT NULL ORDER BY seq ASC")
                    .fetch_all(self.db.pool()),
            )
            .await?;

        rows.into_iter().map(map_session).collect()
    }

    /// Looks up a single session, placeholder or not.
    pub async fn fetch_session(&self, id: SessionId) -> Result<Option<SessionStatsRecord>, PersistenceFailure> {
        let row = self
            .db
            .bounded(
                "fetch session",
                sqlx::query("SELECT * FROM user_stats WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(self.db.pool()),
            )
            .await?;

        row.map(map_session).transpose()
    }
}

fn map_session(row: SqliteRow) -> Result<SessionStatsRecord, PersistenceFailure> {
    const OPERATION: &str = "decode session";
    let column = |err: sqlx::Error| PersistenceFailure::decode(OPERATION, err);
    let id: String = row.try_get("id").map_err(column)?;
    let date: String = row.try_get("date").map_err(column)?;

    Ok(SessionStatsRecord {
        id: id
            .parse()
            .map_err(|err| PersistenceFailure::decode(OPERATION, format!("session id '{id}': {err}")))?,
        cloud: row.try_get("cloud").map_err(column)?,
        zone: row.try_get("zone").map_err(column)?,
        host: row.try_get("host").map_err(column)?,
        score: row.try_get("score").map_err(column)?,
        level: row.try_get("level").map_err(column)?,
        lives: row.try_get("lives").map_err(column)?,
        elapsed_time: row.try_get("elapsed_time").map_err(column)?,
        update_counter: row.try_get("update_counter").map_err(column)?,
        date: parse_datetime(OPERATION, &date)?,
        referer: row.try_get("referer").map_err(column)?,
        user_agent: row.try_get("user_agent").map_err(column)?,
        hostname: row.try_get("hostname").map_err(column)?,
        ip_addr: row.try_get("ip_addr").map_err(column)?,
    })
}
