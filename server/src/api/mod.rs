use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Ledger;

mod http;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct Api {
    ledger: Arc<Ledger>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

impl Api {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub fn router(&self) -> Router {
        let config = self.ledger.config();

        // Environment variables override config
        let http_rate_per_sec =
            parse_env_u64("RATE_LIMIT_HTTP_PER_SEC").or(config.http_rate_limit_per_second);
        let http_rate_burst =
            parse_env_u32("RATE_LIMIT_HTTP_BURST").or(config.http_rate_limit_burst);
        let governor_conf = governor_config(http_rate_per_sec, http_rate_burst);

        let router = Router::new()
            .route("/", get(http::banner))
            .route("/healthz", get(http::healthz))
            .route("/fund", get(http::fund))
            .route("/take", get(http::take))
            .route("/announceTournament", get(http::announce_tournament))
            .route("/joinTournament", get(http::join_tournament))
            .route("/resultTournament", post(http::result_tournament))
            .route("/balance", get(http::balance))
            .route("/reset", get(http::reset))
            .route("/metrics/http", get(http::http_metrics))
            .route("/metrics/ledger", get(http::ledger_metrics))
            .route("/metrics/prometheus", get(http::prometheus_metrics));

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };
        let router = match cors_layer("ALLOWED_HTTP_ORIGINS") {
            Some(cors) => router.layer(cors),
            None => router,
        };
        // No request timeout: an engine call cannot be cancelled once its
        // transaction is open, so a late error would hide a commit.
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router.layer(DefaultBodyLimit::disable()),
        };
        let router = router
            .layer(middleware::from_fn_with_state(
                self.ledger.clone(),
                request_id_middleware,
            ))
            .layer(TraceLayer::new_for_http());

        router.with_state(self.ledger.clone())
    }
}

fn governor_config(
    rate_per_second: Option<u64>,
    burst_size: Option<u32>,
) -> Option<Arc<IpGovernorConfig>> {
    match (rate_per_second, burst_size) {
        (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
            let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
            let period = Duration::from_nanos(nanos_per_request);
            tracing::info!(rate_per_second, burst_size, "http rate limit configured");
            GovernorConfigBuilder::default()
                .period(period)
                .burst_size(burst_size)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .or_else(|| {
                    tracing::warn!("invalid rate-limit config; rate limiting disabled");
                    None
                })
                .map(Arc::new)
        }
        _ => None,
    }
}

/// CORS is only configured when an origin list is given.
fn cors_layer(var: &str) -> Option<CorsLayer> {
    let origins = std::env::var(var).unwrap_or_default();
    let origins: Vec<&str> = origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .collect();
    if origins.is_empty() {
        return None;
    }

    let allow_origin = if origins.contains(&"*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| tracing::warn!("Invalid origin in {}: {}", var, origin))
                .ok()
        }))
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static(REQUEST_ID_HEADER),
            ])
            .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)]),
    )
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

async fn request_id_middleware(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    }
    let status = response.status();
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => ledger.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => ledger.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
