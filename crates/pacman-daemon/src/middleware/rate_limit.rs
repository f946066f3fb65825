use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

/// Fixed-window limits per client address.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub api_per_window: u64,
    pub submit_per_window: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_per_window: 100,
            submit_per_window: 20,
            window: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();
        // Only owned values cross the await; request bodies are not `Sync`.
        let classes = classify(request.method(), request.uri().path());
        let identity = identity_fingerprint(&request);

        Box::pin(async move {
            match state.check(classes, identity).await {
                Ok(quota) => {
                    let mut response = inner.call(request).await?;
                    if let Some(quota) = quota {
                        quota.write_headers(response.headers_mut());
                    }
                    Ok(response)
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

#[derive(Debug)]
struct Counters {
    entries: HashMap<RateKey, Counter>,
    last_sweep: Instant,
}

impl Counters {
    /// Drops every counter whose window has run out, at most once per window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.last_sweep) < window {
            return;
        }
        self.entries
            .retain(|_, counter| now.saturating_duration_since(counter.window_start) < window);
        self.last_sweep = now;
    }
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Counts one request against every class it belongs to. Returns the
    /// tightest remaining quota, or `None` when the request is not limited.
    async fn check(
        &self,
        classes: &'static [RateClass],
        identity: String,
    ) -> Result<Option<Quota>, RateLimitRejection> {
        if !self.config.enabled || classes.is_empty() {
            return Ok(None);
        }

        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let window = self.config.window;
        counters.sweep(now, window);

        let mut tightest: Option<Quota> = None;
        for &class in classes {
            let limit = self.config.limit_for(class);
            let entry = counters
                .entries
                .entry(RateKey {
                    class,
                    identity: identity.clone(),
                })
                .or_insert_with(|| Counter {
                    window_start: now,
                    count: 0,
                });

            let mut elapsed = now.saturating_duration_since(entry.window_start);
            if elapsed >= window {
                entry.window_start = now;
                entry.count = 0;
                elapsed = Duration::ZERO;
            }
            let reset = window
                .checked_sub(elapsed)
                .unwrap_or_default()
                .max(Duration::from_secs(1));

            if entry.count >= limit {
                warn!(
                    category = class.as_str(),
                    identity_fingerprint = identity,
                    limit,
                    "rate limit exceeded"
                );
                return Err(RateLimitRejection {
                    class,
                    quota: Quota {
                        limit,
                        remaining: 0,
                        reset,
                    },
                });
            }

            entry.count += 1;
            let quota = Quota {
                limit,
                remaining: limit - entry.count,
                reset,
            };
            if tightest.map_or(true, |current| quota.remaining < current.remaining) {
                tightest = Some(quota);
            }
        }
        Ok(tightest)
    }
}

/// What is left of a client's budget in the current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Quota {
    limit: u64,
    remaining: u64,
    reset: Duration,
}

impl Quota {
    /// `RateLimit-*` headers from the IETF rate-limit draft.
    fn write_headers(&self, headers: &mut HeaderMap) {
        let reset_secs = self.reset.as_secs().max(1);
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(reset_secs));
    }
}

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RateKey {
    class: RateClass,
    identity: String,
}

#[derive(Clone, Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    Api,
    Submission,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Api => "api",
            RateClass::Submission => "submission",
        }
    }

    fn message(self) -> &'static str {
        match self {
            RateClass::Api => "Too many requests from this IP, please try again later.",
            RateClass::Submission => "Too many submissions from this IP, please try again later.",
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Api => self.api_per_window,
            RateClass::Submission => self.submit_per_window,
        }
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    class: RateClass,
    quota: Quota,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let body = RateLimitBody {
            rs: "error",
            message: self.class.message(),
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        self.quota.write_headers(headers);
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(self.quota.reset.as_secs().max(1)),
        );
        response
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    rs: &'static str,
    message: &'static str,
}

/// Reads count against the general API budget. Submissions count against the
/// stricter submission budget, and stats submissions against both.
fn classify(method: &Method, path: &str) -> &'static [RateClass] {
    let submission = method == Method::POST;
    if path.starts_with("/user/stats") && submission {
        &[RateClass::Api, RateClass::Submission]
    } else if path.starts_with("/highscores") && submission {
        &[RateClass::Submission]
    } else if path.starts_with("/user") || path.starts_with("/highscores/list") {
        &[RateClass::Api]
    } else {
        &[]
    }
}

/// Hashed peer address, so raw client IPs never reach the logs.
fn identity_fingerprint<B>(request: &Request<B>) -> String {
    let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return "unknown".to_string();
    };

    let digest = Sha256::digest(addr.ip().to_string().as_bytes());
    STANDARD_NO_PAD.encode(digest)
}
