use anyhow::{Context, Result};
use clap::Parser;
use lifland_server::{Api, BackendKind, Ledger, LogFormat, ServerConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(level: tracing::Level, format: LogFormat) -> Result<()> {
    let level = LevelFilter::from_level(level);
    let fmt_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(level).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(level)
            .boxed(),
    };

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "lifland-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("lifland-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::registry().with(fmt_layer).init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tournament points ledger service")]
struct Args {
    /// YAML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host interface to bind (default: localhost).
    #[arg(long)]
    host: Option<IpAddr>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Storage backend: memory, sqlite or postgres.
    #[arg(long)]
    backend: Option<BackendKind>,

    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Postgres connection string (required for the postgres backend).
    #[arg(long)]
    postgres_url: Option<String>,

    #[arg(long)]
    postgres_pool_size: Option<usize>,

    /// Whether funding an unknown player creates it.
    #[arg(long)]
    fund_creates_player: Option<bool>,

    /// Settlement attempts before giving up on a moving lock set.
    #[arg(long)]
    max_lock_attempts: Option<usize>,

    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Maximum request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,

    /// Log output: text or json.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Print the resolved configuration and exit.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Maps an optional arg value where 0 disables: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let base = match &args.config {
        Some(path) => ServerConfig::from_yaml_file(path)?,
        None => ServerConfig::default(),
    };

    let config = ServerConfig {
        host: args.host.unwrap_or(base.host),
        port: args.port.unwrap_or(base.port),
        backend: args.backend.unwrap_or(base.backend),
        sqlite_path: args.sqlite_path.clone().unwrap_or(base.sqlite_path),
        sqlite_busy_timeout_ms: base.sqlite_busy_timeout_ms,
        postgres_url: args.postgres_url.clone().or(base.postgres_url),
        postgres_pool_size: args.postgres_pool_size.unwrap_or(base.postgres_pool_size),
        fund_creates_player: args.fund_creates_player.unwrap_or(base.fund_creates_player),
        max_lock_attempts: args.max_lock_attempts.unwrap_or(base.max_lock_attempts),
        http_rate_limit_per_second: args
            .http_rate_limit_per_second
            .or(base.http_rate_limit_per_second),
        http_rate_limit_burst: args.http_rate_limit_burst.or(base.http_rate_limit_burst),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            base.http_body_limit_bytes,
        ),
        log_level: args.log_level.clone().unwrap_or(base.log_level),
        log_format: args.log_format.unwrap_or(base.log_format),
    };
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();
    let config = build_config(&args)?;

    if args.dry_run {
        println!("{:?}", config.redacted_debug());
        return Ok(());
    }

    // Create logger
    init_tracing(config.log_level()?, config.log_format)?;
    info!(config = ?config.redacted_debug(), "configuration loaded");

    let addr = SocketAddr::new(config.host, config.port);
    let ledger = Arc::new(
        tokio::task::spawn_blocking(move || Ledger::open(config))
            .await
            .context("open ledger task failed")??,
    );
    let app = Api::new(ledger).router();

    // Start server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "lifland-server",
            "--backend",
            "memory",
            "--port",
            "9090",
            "--fund-creates-player",
            "false",
            "--http-body-limit-bytes",
            "0",
            "--log-format",
            "json",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.port, 9090);
        assert!(!config.fund_creates_player);
        assert_eq!(config.http_body_limit_bytes, None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifland.yaml");
        std::fs::write(
            &path,
            "backend: memory\nport: 7000\nmax_lock_attempts: 3\nlog_level: debug\n",
        )
        .unwrap();
        let args = Args::parse_from([
            "lifland-server",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7001",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.max_lock_attempts, 3);
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
    }

    #[test]
    fn rejects_zero_lock_attempts() {
        let args = Args::parse_from([
            "lifland-server",
            "--backend",
            "memory",
            "--max-lock-attempts",
            "0",
        ]);
        let err = build_config(&args).unwrap_err();
        assert!(
            err.to_string().contains("max_lock_attempts"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn postgres_backend_needs_url() {
        let args = Args::parse_from(["lifland-server", "--backend", "postgres"]);
        assert!(build_config(&args).is_err());
    }
}
