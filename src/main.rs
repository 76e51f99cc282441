mod api;
mod backoff;
mod booking;
mod config;
mod db;
mod error;
mod ingress;
mod phone;
mod provider;
mod tasks;
mod tenant;
#[cfg(test)]
mod testing;
mod tools;
mod twilio;
mod webhooks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use booking::BookingClient;
use config::{Config, ConfigError};
use db::postgres::{self, PgStore};
use db::Store;
use ingress::normalize::normalize_tool_call;
use ingress::verify::{verify_admin, verify_tool_token, verify_webhook, verify_worker};
use tasks::{Dispatcher, TaskQueue};
use tenant::TenantResolver;
use tools::availability::AvailabilityCache;
use twilio::TwilioClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Used when `RUST_LOG` is unset. Targets are crate paths, so this names the
/// binary's crate, not the package.
const DEFAULT_LOG_FILTER: &str = "receptionist=info,tower_http=info";

/// Shared application state accessible from all handlers. Everything in it
/// is built once at startup and cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub resolver: TenantResolver,
    pub booking: Arc<BookingClient>,
    pub twilio: Arc<TwilioClient>,
    pub tasks: TaskQueue,
    pub availability: AvailabilityCache,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> reqwest::Result<Self> {
        Ok(Self {
            resolver: TenantResolver::new(store.clone()),
            booking: Arc::new(BookingClient::new(&config.booking)?),
            twilio: Arc::new(TwilioClient::new(&config.twilio)?),
            tasks: TaskQueue::new(store.clone()),
            availability: AvailabilityCache::new(),
            config: Arc::new(config),
            store,
        })
    }
}

/// Build the router. Tool routes authenticate before normalizing; webhook
/// routes verify the signature over the untouched body.
pub fn app(state: AppState) -> Router {
    let tools = Router::new()
        .route("/check-availability", post(tools::availability::check_availability))
        .route("/create-booking", post(tools::booking::create_booking))
        .route("/lookup-customer", post(tools::customer::lookup_customer))
        .route("/cancel-booking", post(tools::booking::cancel_booking))
        .route("/identify-caller", post(tools::customer::identify_caller))
        .route_layer(from_fn(normalize_tool_call))
        .route_layer(from_fn_with_state(state.clone(), verify_tool_token));

    let retell = Router::new()
        .route("/call-started", post(webhooks::call_started))
        .route("/call-ended", post(webhooks::call_ended))
        .route("/call-analyzed", post(webhooks::call_analyzed))
        .route_layer(from_fn_with_state(state.clone(), verify_webhook));

    let workers = Router::new()
        .route("/send-sms", post(api::workers::send_sms))
        .route("/phone-numbers", post(api::workers::phone_numbers))
        .route_layer(from_fn_with_state(state.clone(), verify_worker));

    let admin = Router::new()
        .route(
            "/tenants/{tenant_id}/phone-numbers",
            post(api::admin::enqueue_phone_numbers),
        )
        .route_layer(from_fn_with_state(state.clone(), verify_admin));

    Router::new()
        .nest("/api/tools", tools)
        .nest("/api/webhooks/retell", retell)
        .nest("/api/workers", workers)
        .nest("/api/admin", admin)
        .route("/api/health", get(health))
        .layer(from_fn(ingress::correlation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

#[derive(Debug, thiserror::Error)]
enum Fatal {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Runtime(String),
}

impl Fatal {
    fn exit_code(&self) -> i32 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::Migration(_) => 2,
            Fatal::Runtime(_) => 3,
        }
    }

    fn runtime(context: &str, err: impl std::fmt::Display) -> Self {
        Fatal::Runtime(format!("{context}: {err}"))
    }
}

#[derive(Clone, Copy)]
enum Command {
    Serve,
    Migrate,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match args.get(1).map(|s| s.as_str()) {
        None | Some("serve") => Command::Serve,
        Some("migrate") => Command::Migrate,
        Some("--version") | Some("-V") => {
            println!("receptionist {VERSION}");
            return;
        }
        Some("--help") | Some("-h") => {
            print_usage();
            return;
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_usage();
            std::process::exit(1);
        }
    };

    init_tracing();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {e}");
            std::process::exit(3);
        }
    };
    let result = rt.block_on(async {
        match command {
            Command::Serve => serve().await,
            Command::Migrate => migrate().await,
        }
    });

    if let Err(e) = result {
        tracing::error!("{e}");
        eprintln!("receptionist: {e}");
        std::process::exit(e.exit_code());
    }
}

fn print_usage() {
    println!("receptionist {VERSION}");
    println!("Multi-tenant AI voice receptionist backend");
    println!();
    println!("Usage: receptionist [COMMAND]");
    println!();
    println!("Commands:");
    println!("  serve       Start the HTTP server and task dispatcher (default)");
    println!("  migrate     Apply database migrations and exit");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Configuration is read from $RECEPTIONIST_CONFIG (default ./receptionist.toml),");
    println!(".env and the environment.");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();
}

async fn migrate() -> Result<(), Fatal> {
    let config = Config::load()?;
    let pool = postgres::connect(&config.database)
        .await
        .map_err(|e| Fatal::runtime("database connect", e))?;
    postgres::migrate(&pool).await?;
    tracing::info!("Migrations applied");
    Ok(())
}

async fn serve() -> Result<(), Fatal> {
    let config = Config::load()?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            field: "server.host",
            reason: e.to_string(),
        })?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        version = VERSION,
        "Starting receptionist"
    );

    let pool = postgres::connect(&config.database)
        .await
        .map_err(|e| Fatal::runtime("database connect", e))?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let state = AppState::new(config.clone(), store.clone())
        .map_err(|e| Fatal::runtime("http client", e))?;

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(store, &state.tasks, &config.workers)
        .map_err(|e| Fatal::runtime("dispatcher client", e))?;
    let dispatcher = tokio::spawn(dispatcher.run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Fatal::runtime("bind", e))?;
    tracing::info!(%addr, "Listening");

    let signal = shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .map_err(|e| Fatal::runtime("server", e))?;

    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        tracing::warn!("Task dispatcher did not stop cleanly: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
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
}
