//! Global leaderboard storage.
//!
//! Highscores are append-only: each valid submission becomes exactly one row
//! and nothing updates or deletes it. There is no natural key to deduplicate
//! on, so a client retrying a failed submission may store it twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use crate::{
    error::PersistenceFailure, parse_datetime, validation::HighscoreEntry, Database, Provenance,
};

/// Number of rows served by the public leaderboard.
pub const DEFAULT_TOP_SCORES: u32 = 10;

/// A stored highscore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighscoreRecord {
    pub id: i64,
    pub name: String,
    pub cloud: String,
    pub zone: String,
    pub host: String,
    pub score: i64,
    pub level: i64,
    pub date: DateTime<Utc>,
    pub referer: String,
    pub user_agent: String,
    pub hostname: String,
    pub ip_addr: String,
}

/// Highscore operations over a borrowed handle.
#[derive(Debug, Clone, Copy)]
pub struct HighscoreStore<'a> {
    db: &'a Database,
}

impl<'a> HighscoreStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Appends a validated highscore and returns its storage-assigned id.
    ///
    /// Returns only after the commit is durable. Failures are not retried.
    pub async fn insert(&self, entry: &HighscoreEntry, provenance: &Provenance) -> Result<i64, PersistenceFailure> {
        const OPERATION: &str = "insert highscore";

        let result = self
            .db
            .bounded(
                OPERATION,
                sqlx::query(
                    r#"
                    INSERT INTO highscores (
                        name, cloud, zone, host, score, level, date,
                        referer, user_agent, hostname, ip_addr
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&entry.name)
                .bind(&entry.metadata.cloud)
                .bind(&entry.metadata.zone)
                .bind(&entry.metadata.host)
                .bind(entry.score)
                .bind(entry.level)
                .bind(Utc::now().to_rfc3339())
                .bind(&provenance.referer)
                .bind(&provenance.user_agent)
                .bind(&provenance.hostname)
                .bind(&provenance.ip_addr)
                .execute(self.db.pool()),
            )
            .await?;

        let id = result.last_insert_rowid();
        debug!(id, score = entry.score, level = entry.level, "highscore inserted");
        Ok(id)
    }

    /// Best `limit` scores, highest first. Equal scores keep insertion order.
    pub async fn top_scores(&self, limit: u32) -> Result<Vec<HighscoreRecord>, PersistenceFailure> {
        const OPERATION: &str = "list top scores";

        let rows = self
            .db
            .bounded(
                OPERATION,
                sqlx::query(
                    r#"
                    SELECT * FROM highscores
                    ORDER BY score DESC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(i64::from(limit))
                .fetch_all(self.db.pool()),
            )
            .await?;

        rows.into_iter().map(map_highscore).collect()
    }
}

fn map_highscore(row: SqliteRow) -> Result<HighscoreRecord, PersistenceFailure> {
    const OPERATION: &str = "decode highscore";
    let column = |err: sqlx::Error| PersistenceFailure::decode(OPERATION, err);
    let date: String = row.try_get("date").map_err(column)?;

    Ok(HighscoreRecord {
        id: row.try_get("id").map_err(column)?,
        name: row.try_get("name").map_err(column)?,
        cloud: row.try_get("cloud").map_err(column)?,
        zone: row.try_get("zone").map_err(column)?,
        host: row.try_get("host").map_err(column)?,
        score: row.try_get("score").map_err(column)?,
        level: row.try_get("level").map_err(column)?,
        date: parse_datetime(OPERATION, &date)?,
        referer: row.try_get("referer").map_err(column)?,
        user_agent: row.try_get("user_agent").map_err(column)?,
        hostname: row.try_get("hostname").map_err(column)?,
        ip_addr: row.try_get("ip_addr").map_err(column)?,
    })
}
