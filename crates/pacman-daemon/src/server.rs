use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use crate::provenance::peer_ip;
use crate::{highscores, users};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pacman_db::{
    ConnectionFailure, ConnectionManager, DatabaseConfig, DbError, PersistenceFailure,
    ValidationFailure,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let manager = Arc::new(ConnectionManager::sqlite(config.database.clone()));
    let state = AppState {
        db: Arc::clone(&manager),
        environment: config.environment,
    };

    // Warm the handle up front; requests connect lazily if this fails.
    let warmup = Arc::clone(&manager);
    tokio::spawn(async move {
        if let Err(err) = warmup.get_handle().await {
            warn!(error = %err, "database warm-up failed; requests will retry");
        }
    });

    let app = build_router(state)
        .layer(rate_limit_layer(config.rate_limit.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        db.url = %config.database.redacted_url(),
        environment = config.environment.as_str(),
        "pacman-daemon listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server exited")?;

    manager.shutdown().await;
    info!("pacman-daemon stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/highscores/list", get(highscores::list_highscores))
        .route("/highscores", post(highscores::submit_highscore))
        .route("/user/id", get(users::issue_session_id))
        .route("/user/stats", get(users::list_stats).post(users::submit_stats))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), report_errors))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<ConnectionManager>,
    pub environment: Environment,
}

/// Deployment mode. Only `development` exposes failure detail to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn is_development(self) -> bool {
        self == Environment::Development
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub environment: Environment,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut listen_addr: SocketAddr = lookup("PACMAN_API_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid PACMAN_API_ADDR")?;
        if let Some(port) = parse_var::<u16>(&lookup, "PORT")? {
            listen_addr.set_port(port);
        }

        let db_url = lookup("PACMAN_DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://pacman.db".to_string());
        let mut database = DatabaseConfig::new(db_url);
        if let Some(max) = parse_var::<u32>(&lookup, "PACMAN_DB_MAX_CONNECTIONS")? {
            database.max_connections = max.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PACMAN_DB_WRITE_TIMEOUT_MS")? {
            database.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PACMAN_DB_BUSY_TIMEOUT_MS")? {
            database.busy_timeout = Duration::from_millis(ms);
        }

        let environment = lookup("PACMAN_ENV")
            .or_else(|| lookup("NODE_ENV"))
            .map(|raw| Environment::parse(&raw))
            .unwrap_or_default();

        let mut rate_limit = RateLimitConfig::default();
        if matches!(bool_var(&lookup, "PACMAN_RATE_LIMIT_DISABLED"), Some(true)) {
            rate_limit.enabled = false;
        }
        if let Some(limit) = parse_var(&lookup, "PACMAN_RATE_LIMIT_API")? {
            rate_limit.api_per_window = limit;
        }
        if let Some(limit) = parse_var(&lookup, "PACMAN_RATE_LIMIT_SUBMIT")? {
            rate_limit.submit_per_window = limit;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PACMAN_RATE_LIMIT_WINDOW_SECS")? {
            rate_limit.window = Duration::from_secs(secs.max(1));
        }

        Ok(Self {
            listen_addr,
            database,
            environment,
            rate_limit,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {key}")),
        _ => Ok(None),
    }
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).and_then(|value| match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Not Found")
}

/// Logs every failed request and, in development mode, adds the hidden detail
/// to the response body.
async fn report_errors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let client_ip = peer_ip(request.extensions());

    let response = next.run(request).await;
    let Some(report) = response.extensions().get::<ErrorReport>().cloned() else {
        return response;
    };

    let status = response.status();
    let detail = report.detail.as_deref().unwrap_or_default();
    if status.is_server_error() {
        error!(%method, %path, %client_ip, status = status.as_u16(), message = %report.message, detail, "request failed");
    } else {
        warn!(%method, %path, %client_ip, status = status.as_u16(), message = %report.message, "request rejected");
    }

    if state.environment.is_development() && report.detail.is_some() {
        let body = ErrorBody {
            rs: "error",
            message: report.message,
            detail: report.detail,
        };
        return (status, Json(body)).into_response();
    }
    response
}

/// Plain acknowledgement, `{"rs":"success"}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct Ack {
    #[schema(value_type = String, example = "success")]
    pub rs: &'static str,
}

impl Ack {
    pub fn success() -> Self {
        Self { rs: "success" }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Generic 500. The cause is kept for the logs, never sent in production.
    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".to_string(),
            detail: Some(err.to_string()),
        }
    }
}

impl From<ValidationFailure> for ApiError {
    fn from(err: ValidationFailure) -> Self {
        ApiError::bad_request(err.message)
    }
}

impl From<ConnectionFailure> for ApiError {
    fn from(err: ConnectionFailure) -> Self {
        ApiError::internal(err)
    }
}

impl From<PersistenceFailure> for ApiError {
    fn from(err: PersistenceFailure) -> Self {
        ApiError::internal(err)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(inner) => inner.into(),
            other => ApiError::internal(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = ErrorReport {
            message: self.message.clone(),
            detail: self.detail,
        };
        let body = Json(ErrorBody {
            rs: "error",
            message: self.message,
            detail: None,
        });
        let mut response = (self.status, body).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

/// Attached to error responses so [`report_errors`] can log them.
#[derive(Debug, Clone)]
struct ErrorReport {
    message: String,
    detail: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    #[schema(value_type = String, example = "error")]
    rs: &'static str,
    message: String,
    /// Only present in development mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

pub mod docs {
    use super::*;
    use crate::{
        highscores::{HighscoreAccepted, HighscoreListing},
        users::SessionStatsListing,
    };
    use pacman_db::{HighscoreSubmission, StatsSubmission};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Pacman Scoreboard API", version = "0.1.0"),
        paths(
            healthz,
            crate::highscores::list_highscores,
            crate::highscores::submit_highscore,
            crate::users::issue_session_id,
            crate::users::submit_stats,
            crate::users::list_stats
        ),
        components(schemas(
            HighscoreSubmission,
            HighscoreListing,
            HighscoreAccepted,
            StatsSubmission,
            SessionStatsListing,
            Ack,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pacman_db::{Connector, Database};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::Service;

    use std::collections::HashMap;

    fn setup_test_app() -> (Arc<ConnectionManager>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join("scoreboard.sqlite");
        let manager = Arc::new(ConnectionManager::sqlite(DatabaseConfig::new(format!(
            "sqlite://{}",
            db_path.display()
        ))));
        let router = build_router(AppState {
            db: Arc::clone(&manager),
            environment: Environment::Production,
        });
        (manager, router, temp)
    }

    struct UnreachableConnector;

    #[async_trait]
    impl Connector for UnreachableConnector {
        fn target(&self) -> String {
            "sqlite://unreachable.db".to_string()
        }

        async fn connect(&self) -> Result<Database, ConnectionFailure> {
            Err(ConnectionFailure::new(self.target(), "connection refused"))
        }
    }

    fn unreachable_app(environment: Environment) -> Router {
        build_router(AppState {
            db: Arc::new(ConnectionManager::new(UnreachableConnector)),
            environment,
        })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn call(router: &mut Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.call(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json body")
        };
        (status, json)
    }

    #[tokio::test]
    async fn submitted_highscore_appears_in_listing() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json(
                "/highscores",
                json!({"name": "Ann", "score": 4200, "level": 3, "zone": "us-east-1a"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"rs": "success", "name": "Ann", "zone": "us-east-1a", "score": 4200, "level": 3})
        );

        call(
            &mut router,
            post_json("/highscores", json!({"name": "Bob", "score": 9000, "level": 5})),
        )
        .await;

        let (status, body) = call(&mut router, get("/highscores/list")).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Bob");
        assert_eq!(rows[0]["cloud"], "unknown");
        assert_eq!(rows[1]["name"], "Ann");
        assert_eq!(rows[1]["score"], 4200);
        assert!(rows[0].get("ip_addr").is_none());
    }

    #[tokio::test]
    async fn script_tags_are_stripped_from_names() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json(
                "/highscores",
                json!({"name": "<script>x</script>Ann", "score": 10, "level": 1}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Ann");

        let (_, listing) = call(&mut router, get("/highscores/list")).await;
        assert_eq!(listing[0]["name"], "Ann");
    }

    #[tokio::test]
    async fn missing_level_is_rejected_before_touching_storage() {
        let (manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json("/highscores", json!({"name": "Ann", "score": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rs"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("name, score, and level"));
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn out_of_range_values_are_rejected_before_touching_storage() {
        let (manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json("/highscores", json!({"name": "Ann", "score": 100000000, "level": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Score must be a valid number between 0 and 99999999");

        let (status, _) = call(
            &mut router,
            post_json("/highscores", json!({"name": "Ann", "score": 5, "level": 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/highscores")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(&mut router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["rs"], "error");
    }

    #[tokio::test]
    async fn session_stats_report_latest_values() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let (status, id) = call(&mut router, get("/user/id")).await;
        assert_eq!(status, StatusCode::OK);
        let id = id.as_str().expect("session id string").to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let (_, placeholder_only) = call(&mut router, get("/user/stats")).await;
        assert_eq!(placeholder_only, json!([]));

        for (score, lives) in [(100, 3), (2500, 1)] {
            let (status, body) = call(
                &mut router,
                post_json(
                    "/user/stats",
                    json!({
                        "userId": id,
                        "score": score,
                        "level": 2,
                        "lives": lives,
                        "elapsedTime": 95,
                        "cloud": "gcp"
                    }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"rs": "success"}));
        }

        let (status, body) = call(&mut router, get("/user/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{
                "cloud": "gcp",
                "zone": "unknown",
                "host": "unknown",
                "score": 2500,
                "level": 2,
                "lives": 1,
                "et": 95,
                "txncount": 2
            }])
        );
    }

    #[tokio::test]
    async fn malformed_session_id_is_rejected() {
        let (manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json(
                "/user/stats",
                json!({"userId": "not-an-id", "score": 1, "level": 1, "lives": 1, "elapsedTime": 1}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid userId format");
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_accepted_without_creating_a_row() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(
            &mut router,
            post_json(
                "/user/stats",
                json!({
                    "userId": uuid::Uuid::new_v4().to_string(),
                    "score": 50,
                    "level": 1,
                    "lives": 3,
                    "elapsedTime": 10
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rs"], "success");

        let (_, listing) = call(&mut router, get("/user/stats")).await;
        assert_eq!(listing, json!([]));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (_manager, mut router, _tmp) = setup_test_app();

        let (status, body) = call(&mut router, get("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"rs": "error", "message": "Not Found"}));
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (_manager, mut router, _tmp) = setup_test_app();
        let (status, _) = call(&mut router, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn storage_failure_hides_detail_in_production() {
        let mut router = unreachable_app(Environment::Production);

        let (status, body) = call(&mut router, get("/highscores/list")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"rs": "error", "message": "Internal server error"}));
    }

    #[tokio::test]
    async fn storage_failure_shows_detail_in_development() {
        let mut router = unreachable_app(Environment::Development);

        let (status, body) = call(&mut router, get("/user/id")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error");
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }

    #[test]
    fn config_defaults() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.database.url, "sqlite://pacman.db");
        assert_eq!(config.environment, Environment::Production);
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn config_from_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PACMAN_API_ADDR", "127.0.0.1:9000"),
            ("PORT", "3000"),
            ("DATABASE_URL", "sqlite://other.db"),
            ("PACMAN_DB_WRITE_TIMEOUT_MS", "2500"),
            ("PACMAN_ENV", "development"),
            ("PACMAN_RATE_LIMIT_DISABLED", "true"),
            ("PACMAN_RATE_LIMIT_SUBMIT", "5"),
        ]);
        let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.database.url, "sqlite://other.db");
        assert_eq!(config.database.write_timeout, Duration::from_millis(2500));
        assert!(config.environment.is_development());
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.submit_per_window, 5);
    }

    #[test]
    fn environment_falls_back_to_node_env() {
        let config =
            AppConfig::from_lookup(|key| (key == "NODE_ENV").then(|| "development".to_string()))
                .unwrap();
        assert!(config.environment.is_development());

        let config = AppConfig::from_lookup(|key| match key {
            "PACMAN_ENV" => Some("production".to_string()),
            "NODE_ENV" => Some("development".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
    }

    #[test]
    fn config_rejects_bad_numbers() {
        let err = AppConfig::from_lookup(|key| (key == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("invalid PORT"));
    }

    #[test]
    fn openapi_lists_every_route() {
        let doc = docs::ApiDoc::openapi();
        for path in ["/healthz", "/highscores", "/highscores/list", "/user/id", "/user/stats"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
