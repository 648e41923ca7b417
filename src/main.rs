//! selenosis - a scalable Selenium hub for Kubernetes.
//!
//! Usage:
//!   selenosis --browsers-config /config/browsers.yaml [--address :4444] [--limit 10]
//!
//! The hub speaks the W3C/JSON-Wire WebDriver protocol, provisions one pod
//! per browser session, and reverse-proxies each session's traffic to its
//! pod until the client quits or the session idles out.

mod browser;
mod capabilities;
mod errors;
mod http_server;
mod platform;
mod reaper;
mod state;

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::platform::{Platform, PlatformOptions};
use crate::state::{AppState, HubConfig, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "selenosis")]
#[command(about = "Scalable Selenium hub for Kubernetes")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = ":4444")]
    address: String,

    /// Port the sidecar proxy listens on inside each pod
    #[arg(long, default_value_t = 4445)]
    proxy_port: u16,

    /// Kubernetes namespace the session pods live in
    #[arg(long, default_value = "selenosis")]
    namespace: String,

    /// Headless service that gives session pods their DNS names
    #[arg(long, default_value = "selenosis")]
    service_name: String,

    /// Path to the browser catalogue
    #[arg(long, default_value = "/config/browsers.yaml")]
    browsers_config: PathBuf,

    /// Catalogue load attempts before giving up
    #[arg(long, default_value_t = 3)]
    browsers_config_retry_count: u32,

    /// How long to wait for a pod to become ready
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    session_wait_timeout: Duration,

    /// Idle time after which a session is reaped
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    session_idle_timeout: Duration,

    /// Readiness watch iterations within the wait budget
    #[arg(long, default_value_t = 3)]
    session_retry_count: u32,

    /// Maximum number of concurrent sessions
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Image pull secret attached to session pods
    #[arg(long, default_value = "")]
    image_pull_secret_name: String,

    /// Sidecar proxy image
    #[arg(long, default_value = "alcounit/seleniferous:latest")]
    proxy_image: String,

    /// Video recorder image
    #[arg(long, default_value = "alcounit/selenoid-video-recorder:latest")]
    video_recorder_image: String,

    /// Period of the registry/cluster reconcile sweep
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    reconcile_interval: Duration,
}

/// Accepts `90`, `90s`, `5m` and `1h`.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "s" | "" => number,
        "m" => number * 60,
        "h" => number * 3600,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    Ok(Duration::from_secs(seconds))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(error = %format!("{err:#}"), "startup failed");
        exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let catalog = browser::load_with_retry(&args.browsers_config, args.browsers_config_retry_count)
        .await
        .context("browser catalogue is unusable")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;
    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build http client")?;

    let platform = Platform::new(
        kube_client,
        http_client.clone(),
        PlatformOptions {
            namespace: args.namespace.clone(),
            service: args.service_name.clone(),
            service_port: args.proxy_port,
            proxy_image: args.proxy_image.clone(),
            video_image: args.video_recorder_image.clone(),
            image_pull_secret: args.image_pull_secret_name.clone(),
            wait_timeout: args.session_wait_timeout,
            retry_count: args.session_retry_count,
        },
    );

    let state = AppState {
        config: Arc::new(HubConfig {
            session_idle_timeout: args.session_idle_timeout,
            reconcile_interval: args.reconcile_interval,
            limit: args.limit,
        }),
        catalog: Arc::new(catalog),
        platform: Arc::new(platform),
        registry: SessionRegistry::new(args.limit),
        client: http_client,
    };

    let adopted = reaper::bootstrap(&state)
        .await
        .context("kubernetes api is unreachable")?;
    info!(
        namespace = %args.namespace,
        sessions = adopted,
        limit = args.limit,
        "session registry initialised"
    );

    tokio::spawn(reaper::run_watch(state.clone()));
    tokio::spawn(reaper::run_reaper(state.clone()));

    let address = listen_address(&args.address);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %address, "selenosis listening");

    axum::serve(listener, http_server::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // Sessions do not survive a hub restart; drop their pods on the way out.
    for service in state.registry.list() {
        state.terminate_session(&service.session_id).await;
    }
    info!("shutdown complete");
    Ok(())
}

fn listen_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
