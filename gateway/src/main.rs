use std::fmt;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use mimalloc::MiMalloc;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use keyrelay_internal::config::Config;
use keyrelay_internal::cors;
use keyrelay_internal::endpoints::{relay, status};
use keyrelay_internal::gateway_util::AppStateData;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the configuration file. All fields have defaults, so the
    /// gateway also starts without one.
    #[arg(long)]
    config_file: Option<PathBuf>,
    /// Log format
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[derive(clap::ValueEnum, Clone, Debug, Default)]
enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn init_logging(log_format: &LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gateway=info,keyrelay_internal=info"));
    match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init(),
    }
}

/// Fatal-startup-error escape hatch: log the message and exit. Only for
/// use in `main.rs`, before the server begins accepting requests.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_format);

    let config =
        Config::load(args.config_file.as_deref()).expect_pretty("Failed to load configuration");
    let config_path_pretty = match &args.config_file {
        Some(path) => format!("config file {}", path.display()),
        None => "default configuration".to_string(),
    };

    let bind_address = config.gateway.bind_address;
    let app_state = AppStateData::new(config)
        .await
        .expect_pretty("Failed to initialize gateway state");

    // In Axum, middleware layers run in REVERSE order of application, so
    // the CORS layer added last sees every request first and stamps every
    // response on the way out, early rejections included.
    let router = Router::new()
        .route(
            "/health",
            get(status::health_handler)
                .options(relay::preflight)
                .fallback(relay::method_not_allowed),
        )
        .route(
            "/status",
            get(status::status_handler)
                .options(relay::preflight)
                .fallback(relay::method_not_allowed),
        )
        .fallback(relay::relay_entrypoint)
        .layer(axum::middleware::from_fn(add_version_header))
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            cors::apply_cors,
        ))
        .with_state(app_state);

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to {bind_address}: address already in use. Is another gateway instance running on the same port?"
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get local address");

    tracing::info!(
        "keyrelay {} is listening on {actual_bind_address} with {config_path_pretty}",
        status::KEYRELAY_VERSION
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect_pretty("Failed to start server");
}

async fn add_version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "x-keyrelay-version",
        HeaderValue::from_static(status::KEYRELAY_VERSION),
    );
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down");
        }
        () = hangup => {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal, shutting down");
        }
    }
}
