use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;

use pacman_db::{
    validation::{validate_highscore, validate_stats},
    ConnectionManager, DatabaseConfig, HighscoreSubmission, Provenance, StatsSubmission,
    UpdateOutcome,
};

fn manager(temp: &TempDir) -> ConnectionManager {
    let path = temp.path().join("scoreboard.sqlite");
    ConnectionManager::sqlite(DatabaseConfig::new(format!("sqlite://{}", path.display())))
}

fn browser() -> Provenance {
    Provenance {
        referer: "http://arcade.local/".into(),
        user_agent: "Mozilla/5.0".into(),
        hostname: "arcade.local".into(),
        ip_addr: "10.0.0.7".into(),
    }
}

#[tokio::test]
async fn highscore_submission_is_sanitized_and_ranked() -> Result<()> {
    let temp = TempDir::new()?;
    let manager = manager(&temp);

    for (name, score) in [("<script>x</script>Ann", 900), ("Bob", 1_500), ("Cy", 40)] {
        let submission: HighscoreSubmission = serde_json::from_value(json!({
            "name": name,
            "score": score,
            "level": 2,
            "cloud": "aws",
            "zone": "us-east-1a",
        }))?;
        let entry = validate_highscore(&submission)?;
        let db = manager.get_handle().await?;
        db.highscores().insert(&entry, &browser()).await?;
    }

    let db = manager.get_handle().await?;
    let top = db.highscores().top_scores(10).await?;
    let names: Vec<&str> = top.iter().map(|record| record.name.as_str()).collect();
    assert_eq!(names, vec!["Bob", "Ann", "Cy"]);
    assert_eq!(top[1].zone, "us-east-1a");
    assert_eq!(top[1].hostname, "arcade.local");
    assert_eq!(manager.attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn session_lifecycle_reports_latest_values() -> Result<()> {
    let temp = TempDir::new()?;
    let manager = manager(&temp);
    let db = manager.get_handle().await?;
    let sessions = db.sessions();

    let id = sessions.create_session().await?;
    let untouched = sessions.create_session().await?;

    for (score, zone) in [(300, Some("eu-west-1b")), (800, None)] {
        let mut body = json!({
            "userId": id.to_string(),
            "score": score,
            "level": 4,
            "lives": 2,
            "elapsedTime": 120,
        });
        if let Some(zone) = zone {
            body["zone"] = json!(zone);
        }
        let submission: StatsSubmission = serde_json::from_value(body)?;
        let (session_id, stats) = validate_stats(&submission)?;
        assert_eq!(
            sessions.update_session(session_id, &stats, &browser()).await?,
            UpdateOutcome::Updated
        );
    }

    let listed = sessions.list_scored().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].score, Some(800));
    assert_eq!(listed[0].zone.as_deref(), Some("unknown"));
    assert_eq!(listed[0].update_counter, Some(2));

    let placeholder = sessions.fetch_session(untouched).await?.expect("placeholder row");
    assert!(!placeholder.is_reportable());

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handle_survives_reconnect_with_existing_rows() -> Result<()> {
    let temp = TempDir::new()?;
    let manager = manager(&temp);

    let submission: HighscoreSubmission =
        serde_json::from_value(json!({"name": "Dee", "score": "77", "level": "1"}))?;
    let entry = validate_highscore(&submission)?;
    manager
        .get_handle()
        .await?
        .highscores()
        .insert(&entry, &Provenance::default())
        .await?;

    manager.shutdown().await;

    let top = manager.get_handle().await?.highscores().top_scores(10).await?;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].score, 77);
    Ok(())
}
