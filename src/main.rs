//! boardwalk - terminal-sharing relay.
//!
//! A producer (the host-side PTY owner) dials in with one control websocket
//! and one data websocket per terminal; browser viewers attach through the
//! viewer endpoint and either drive a terminal or mirror it. The relay owns
//! no terminals itself; it is connection and session glue.

use std::sync::Arc;

use boardwalk::{
    auth::TokenVerifier,
    cli::{Cli, Commands},
    config::Config,
    registry::SessionRegistry,
    room::RoomBroker,
    server::{build_router, AppState},
    storage::Storage,
};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Default to INFO unless RUST_LOG says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        session,
        terminal,
    }) = cli.command
    {
        if let Err(e) = boardwalk::cli::run_watch_client(url, session, terminal).await {
            error!("watch client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(host) = cli.host {
        config.listen_host = host;
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }
    if config.control_token_secret.is_empty() {
        error!("BOARDWALK_CONTROL_SECRET is not set; producers cannot authenticate");
        std::process::exit(1);
    }

    info!(
        "starting boardwalk on {}:{}",
        config.listen_host, config.listen_port
    );
    info!(
        "session max age {}s, reconnect window {}s, setup timeout {}s",
        config.session_max_age.as_secs(),
        config.producer_reconnect.as_secs(),
        config.viewer_setup_timeout.as_secs()
    );

    let prometheus_handle = install_metrics_recorder();
    let cfg = Arc::new(config);

    let registry = SessionRegistry::new(cfg.clone());
    registry.spawn_sweeper();

    // The jam layer needs Redis; the relay core does not. Run degraded if
    // the store is unreachable.
    let storage = match Storage::new(&cfg.redis_url).await {
        Ok(storage) => {
            info!("connected to room store at {}", cfg.redis_url);
            Some(Arc::new(storage))
        }
        Err(e) => {
            warn!(error = %e, "room store unavailable; jam endpoints disabled");
            None
        }
    };
    let broker = storage
        .as_ref()
        .map(|storage| RoomBroker::new(storage.clone(), registry.clone()));
    if let Some(broker) = &broker {
        broker.spawn_event_pump();
    }

    let state = AppState {
        verifier: TokenVerifier::new(&cfg.control_token_secret),
        cfg: cfg.clone(),
        registry,
        storage,
        broker,
    };
    let app = build_router(state, Some(prometheus_handle));

    let addr = format!("{}:{}", cfg.listen_host, cfg.listen_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind {}", addr);
            std::process::exit(1);
        }
    };
    info!("boardwalk listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
