use axum::{
    body::Bytes,
    extract::{RawQuery, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lifland_execution::{EngineError, ErrorKind};
use lifland_types::{
    api::{ErrorResponse, TournamentResult},
    IdError, PlayerId, TournamentId,
};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;

use crate::{LatencySnapshot, Ledger, Operation};

const BANNER: &str =
    "Social tournament service. Please register players and start the tournament.";

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Debug, Error)]
pub(super) enum ApiError {
    #[error("missing query parameter {0}")]
    MissingParam(&'static str),
    #[error("query parameter {name} must be a non-negative integer (got {value:?})")]
    InvalidAmount { name: &'static str, value: String },
    #[error(transparent)]
    InvalidId(#[from] IdError),
    #[error("invalid result payload: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingParam(_)
            | Self::InvalidAmount { .. }
            | Self::InvalidId(_)
            | Self::InvalidBody(_) => ErrorKind::Validation,
            Self::Engine(err) => err.kind(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InsufficientFunds | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        // Backend details stay in the logs.
        let error = match kind {
            ErrorKind::Storage => "internal storage error".to_string(),
            _ => self.to_string(),
        };
        (
            status_for(kind),
            Json(ErrorResponse {
                error,
                kind: kind.as_str().to_string(),
            }),
        )
            .into_response()
    }
}

/// Decoded query string. Keys may repeat.
struct Params(Vec<(String, String)>);

impl Params {
    fn parse(query: Option<&str>) -> Self {
        Self(
            url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
                .into_owned()
                .collect(),
        )
    }

    fn one(&self, name: &'static str) -> Result<&str, ApiError> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .ok_or(ApiError::MissingParam(name))
    }

    fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn player_id(&self, name: &'static str) -> Result<PlayerId, ApiError> {
        Ok(PlayerId::new(self.one(name)?)?)
    }

    fn tournament_id(&self, name: &'static str) -> Result<TournamentId, ApiError> {
        Ok(TournamentId::new(self.one(name)?)?)
    }

    fn amount(&self, name: &'static str) -> Result<u64, ApiError> {
        let value = self.one(name)?;
        value.parse().map_err(|_| ApiError::InvalidAmount {
            name,
            value: value.to_string(),
        })
    }
}

/// Records a request rejected before it reached the engine.
fn counted<T>(ledger: &Ledger, result: Result<T, ApiError>) -> Result<T, ApiError> {
    if let Err(err) = &result {
        ledger.record_rejected(err.kind());
    }
    result
}

fn player_amount(params: &Params) -> Result<(PlayerId, u64), ApiError> {
    Ok((params.player_id("playerId")?, params.amount("points")?))
}

fn announce_request(params: &Params) -> Result<(TournamentId, u64), ApiError> {
    let tournament = params.tournament_id("tournamentId")?;
    let deposit = params.amount("deposit")?;
    if deposit == 0 {
        return Err(EngineError::InvalidDeposit.into());
    }
    Ok((tournament, deposit))
}

fn join_request(params: &Params) -> Result<(TournamentId, PlayerId, Vec<PlayerId>), ApiError> {
    let tournament = params.tournament_id("tournamentId")?;
    let player = params.player_id("playerId")?;
    let backers = params
        .all("backerId")
        .map(PlayerId::new)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((tournament, player, backers))
}

pub(super) async fn banner() -> &'static str {
    BANNER
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn fund(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    RawQuery(query): RawQuery,
) -> Result<StatusCode, ApiError> {
    let params = Params::parse(query.as_deref());
    let (player, points) = counted(&ledger, player_amount(&params))?;
    ledger
        .execute(Operation::Fund, move |engine| {
            engine.fund_player(&player, points)
        })
        .await?;
    Ok(StatusCode::OK)
}

pub(super) async fn take(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    RawQuery(query): RawQuery,
) -> Result<StatusCode, ApiError> {
    let params = Params::parse(query.as_deref());
    let (player, points) = counted(&ledger, player_amount(&params))?;
    ledger
        .execute(Operation::Take, move |engine| {
            engine.take_player(&player, points)
        })
        .await?;
    Ok(StatusCode::OK)
}

pub(super) async fn announce_tournament(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    RawQuery(query): RawQuery,
) -> Result<StatusCode, ApiError> {
    let params = Params::parse(query.as_deref());
    let (tournament, deposit) = counted(&ledger, announce_request(&params))?;
    ledger
        .execute(Operation::Announce, move |engine| {
            engine.announce_tournament(&tournament, deposit)
        })
        .await?;
    Ok(StatusCode::OK)
}

pub(super) async fn join_tournament(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let params = Params::parse(query.as_deref());
    let (tournament, player, backers) = counted(&ledger, join_request(&params))?;
    let receipt = ledger
        .execute(Operation::Join, move |engine| {
            engine.join_tournament(&tournament, &player, &backers)
        })
        .await?;
    if receipt.sponsorship.is_some() {
        ledger.record_sponsored_join();
    }
    Ok(Json(receipt).into_response())
}

pub(super) async fn result_tournament(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let result: TournamentResult =
        counted(&ledger, serde_json::from_slice(&body).map_err(ApiError::from))?;
    let receipt = ledger
        .execute(Operation::Result, move |engine| {
            engine.result_tournament(&result.tournament_id, &result.winners)
        })
        .await?;
    ledger.record_settlement();
    Ok(Json(receipt).into_response())
}

pub(super) async fn balance(
    AxumState(ledger): AxumState<Arc<Ledger>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let params = Params::parse(query.as_deref());
    let player = counted(&ledger, params.player_id("playerId"))?;
    let balance = ledger
        .execute(Operation::Balance, move |engine| engine.player(&player))
        .await?;
    Ok(Json(balance).into_response())
}

pub(super) async fn reset(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Result<Response, ApiError> {
    if let Some(status) = admin_auth_error(&headers) {
        return Ok(status.into_response());
    }
    ledger
        .execute(Operation::Reset, |engine| engine.reset())
        .await?;
    Ok(StatusCode::OK.into_response())
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(ledger.http_metrics_snapshot()).into_response()
}

pub(super) async fn ledger_metrics(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(ledger.ledger_metrics_snapshot()).into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(ledger): AxumState<Arc<Ledger>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        render_prometheus_metrics(&ledger),
    )
        .into_response()
}

fn bearer_or_header(headers: &HeaderMap, header_name: &str) -> (Option<String>, Option<String>) {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    (bearer, header_token)
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let (bearer, header_token) = bearer_or_header(headers, "x-metrics-token");
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str()) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

/// Reset is refused unless `ADMIN_AUTH_TOKEN` is set and presented.
fn admin_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("ADMIN_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return Some(StatusCode::UNAUTHORIZED);
    }
    let (bearer, header_token) = bearer_or_header(headers, "x-admin-token");
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str()) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn render_prometheus_metrics(ledger: &Ledger) -> String {
    let http = ledger.http_metrics();
    let counters = ledger.ledger_metrics_snapshot();
    let mut out = String::new();

    for operation in Operation::ALL {
        append_histogram(
            &mut out,
            &format!("lifland_http_{}_latency_ms", operation.as_str()),
            &http.latency_snapshot(operation),
        );
    }
    let rejects = http.snapshot();
    append_counter(&mut out, "lifland_http_reject_body_limit_total", rejects.reject_body_limit);
    append_counter(&mut out, "lifland_http_reject_rate_limit_total", rejects.reject_rate_limit);

    append_counter(&mut out, "lifland_ledger_committed_total", counters.committed);
    append_counter(&mut out, "lifland_ledger_sponsored_joins_total", counters.sponsored_joins);
    append_counter(&mut out, "lifland_ledger_settlements_total", counters.settlements);
    for (kind, value) in [
        (ErrorKind::Validation, counters.rejected_validation),
        (ErrorKind::InsufficientFunds, counters.rejected_insufficient_funds),
        (ErrorKind::NotFound, counters.rejected_not_found),
        (ErrorKind::Conflict, counters.rejected_conflict),
        (ErrorKind::Storage, counters.storage_failures),
    ] {
        append_counter(
            &mut out,
            &format!("lifland_ledger_rejected_{}_total", kind.as_str()),
            value,
        );
    }
    append_gauge(&mut out, "lifland_ledger_in_flight", counters.in_flight);
    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}
