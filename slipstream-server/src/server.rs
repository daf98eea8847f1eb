use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{Router, middleware, routing::get, serve};
use http::{HeaderValue, Method};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseSection, LogFormat};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    db::schema,
    handlers,
    middleware::request_context,
    providers::AdapterRegistry,
    resolver::{Resolver, ResolverParts, ResolverSettings},
    routes,
    services::{
        checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, PgCheckpointStore},
        checkpoint_writer::CheckpointWriter,
        fanout::FanoutHub,
        lease::LeaseRegistry,
        persistence::{ConversationStore, InMemoryConversationStore, PgConversationStore},
        storage::{AttachmentStorage, InMemoryStorage},
        title::OpenAiTitleGenerator,
    },
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus recorder, installed on first use.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

/// `RUST_LOG` wins; otherwise the configured level is the default directive.
fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given settings.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(
    db: &DatabaseSection,
    url: &str,
) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Creates the CORS layer. An empty origin list allows any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let methods = vec![Method::GET, Method::PUT, Method::OPTIONS];

    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any());

    if config.server.cors.is_empty() {
        cors.allow_origin(AllowOrigin::any())
    } else {
        let origins = config
            .server
            .cors
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Persistence collaborators: Postgres when a URL is configured, memory otherwise.
async fn create_stores(
    config: &Config,
) -> anyhow::Result<(Arc<dyn CheckpointStore>, Arc<dyn ConversationStore>)> {
    let Some(url) = config.database.url.as_deref() else {
        info!("no database configured; using in-memory stores");
        return Ok((
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryConversationStore::new()),
        ));
    };

    let pool = create_database_pool(&config.database, url)
        .await
        .context("failed to connect to the database")?;
    schema::ping(&pool)
        .await
        .context("database liveness check failed")?;
    schema::prepare(&pool, &config.database)
        .await
        .context("database schema setup failed")?;

    let ttl = Duration::from_secs(config.streaming.checkpoint_ttl_secs);
    Ok((
        Arc::new(PgCheckpointStore::new(pool.clone(), ttl)),
        Arc::new(PgConversationStore::new(pool)),
    ))
}

/// Wires the resolver and its collaborators from configuration.
///
/// # Errors
/// Returns an error if the HTTP client or the database cannot be set up.
pub async fn build_state(config: &Config, metrics: PrometheusHandle) -> anyhow::Result<Arc<AppState>> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build the upstream HTTP client")?;

    let (checkpoint_store, conversations) = create_stores(config).await?;
    let storage: Arc<dyn AttachmentStorage> = Arc::new(InMemoryStorage::new(
        config.storage.bucket.clone(),
        config.storage.public_url.clone(),
    ));
    let lease_ttl = Duration::from_secs(config.streaming.lease_ttl_secs);

    let titles = OpenAiTitleGenerator::new(
        http.clone(),
        &config.providers.openai.base_url,
        config.providers.openai.api_key.clone(),
        &config.title,
    );

    let resolver = Resolver::new(ResolverParts {
        adapters: AdapterRegistry::from_config(&http, &config.providers),
        conversations,
        checkpoints: CheckpointWriter::new(
            checkpoint_store,
            config.streaming.checkpoint_concurrency,
        ),
        fanout: Arc::new(FanoutHub::new(config.streaming.fanout_capacity)),
        leases: LeaseRegistry::new(Some(lease_ttl)),
        titles: Arc::new(titles),
        storage: Arc::clone(&storage),
        http,
        settings: ResolverSettings::from_config(config),
    });

    Ok(AppState::new(resolver, storage, metrics))
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, config: &Config) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/api/stream", get(handlers::stream::sse_handler))
        .merge(routes::health::create_health_router())
        .merge(routes::objects::create_objects_router())
        .layer(create_cors_layer(config))
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn(request_context::assign_request_id))
        .with_state(state)
}

/// Resolves on CTRL+C. A failed handler install shuts down immediately.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("Shutting down...");
}

/// Starts the server and binds it to the configured port.
///
/// # Errors
/// Returns an error if configuration is invalid or the server fails to start.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    if let Err(problems) = config.validate() {
        anyhow::bail!("invalid configuration: {}", problems.join("; "));
    }
    info!("Starting server...");

    let state = build_state(&config, metrics_handle()).await?;
    let app = create_app_router(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use serde_json::Value;
    use serial_test::serial;
    use std::{
        io::{self, Write},
        sync::Mutex,
    };
    use tracing::{Subscriber, info};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferMakeWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for BufferMakeWriter {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            BufferWriter {
                buffer: Arc::clone(&self.buffer),
            }
        }
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn subscriber_with_writer<W>(config: &Config, writer: W) -> Box<dyn Subscriber + Send + Sync>
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        let builder = fmt::fmt()
            .with_env_filter(build_env_filter(config))
            .with_target(false)
            .with_writer(writer);

        if matches!(config.logging.format, LogFormat::Json) {
            Box::new(builder.json().with_ansi(false).finish())
        } else {
            Box::new(builder.with_ansi(false).finish())
        }
    }

    fn capture(config: &Config) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = subscriber_with_writer(
            config,
            BufferMakeWriter {
                buffer: buffer.clone(),
            },
        );
        let dispatch = tracing::dispatcher::Dispatch::new(subscriber);
        tracing::dispatcher::with_default(&dispatch, || {
            info!(conversation_id = "c1", "checkpoint saved");
        });
        let contents = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        contents
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap()
            .to_string()
    }

    fn with_rust_log<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        unsafe {
            match value {
                Some(value) => std::env::set_var("RUST_LOG", value),
                None => std::env::remove_var("RUST_LOG"),
            }
        }
        let result = f();
        unsafe { std::env::remove_var("RUST_LOG") };
        result
    }

    #[test]
    #[serial]
    fn configured_level_applies_without_rust_log() {
        let mut config = Config::with_defaults();
        config.logging.level = "debug".to_string();

        let filter = with_rust_log(None, || build_env_filter(&config));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    #[serial]
    fn rust_log_overrides_configured_level() {
        let mut config = Config::with_defaults();
        config.logging.level = "debug".to_string();

        let filter = with_rust_log(Some("error"), || build_env_filter(&config));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::ERROR));
    }

    #[test]
    #[serial]
    fn json_log_format_produces_json_output() {
        let mut config = Config::with_defaults();
        config.logging.format = LogFormat::Json;

        let value: Value = serde_json::from_str(&with_rust_log(None, || capture(&config))).unwrap();
        assert_eq!(value["fields"]["message"], "checkpoint saved");
        assert_eq!(value["fields"]["conversation_id"], "c1");
    }

    #[test]
    #[serial]
    fn text_log_format_emits_plain_events() {
        let config = Config::with_defaults();
        let line = with_rust_log(None, || capture(&config));
        assert!(serde_json::from_str::<Value>(&line).is_err());
        assert!(line.contains("checkpoint saved"));
        assert!(line.contains("conversation_id=\"c1\""));
    }

    #[tokio::test]
    async fn in_memory_state_serves_the_full_router() {
        let config = Config::with_defaults();
        let state = build_state(&config, metrics_handle()).await.unwrap();
        let server = TestServer::new(create_app_router(state, &config)).expect("test server");

        let response = server.get("/health").await;
        response.assert_status_ok();
        assert!(response.headers().get("x-request-id").is_some());

        server
            .get("/api/stream")
            .await
            .assert_status(axum::http::StatusCode::BAD_REQUEST);
    }
}
