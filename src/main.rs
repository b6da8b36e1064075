mod aggregator;
mod api;
mod collectors;
mod config;
mod gpu;
mod http;
mod ipc;
mod metrics;
mod state;

use aggregator::Aggregator;
use axum::serve;
use clap::Parser;
use collectors::{PROC_ROOT, SYS_ROOT};
use config::{Config, LogLevel};
use ipc::{client, socket, IpcServer};
use metrics::Metrics;
use state::SharedSnapshot;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "gpustatd")]
#[command(version)]
struct Cli {
    /// YAML configuration file; built-in defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    /// Ask a running daemon for this process's view and print it as JSON.
    #[arg(long)]
    query: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if cli.query {
        std::process::exit(run_query(&cfg).await);
    }

    info!(
        interval_ms = cfg.interval_ms,
        api_listen = %cfg.api_listen,
        http_listen = ?cfg.http_listen,
        "starting gpustatd"
    );

    let aggregator = Aggregator::discover(Path::new(PROC_ROOT), Path::new(SYS_ROOT));
    if let Err(err) = ipc::check_capacity(aggregator.gpu_count(), aggregator.core_count()) {
        error!(error = %err, "host exceeds wire format capacity");
        std::process::exit(1);
    }
    info!(
        gpus = aggregator.gpu_count(),
        cores = aggregator.core_count(),
        "hardware discovered"
    );

    let server = match socket::socket_path_from_env(cfg.socket_path.as_deref())
        .and_then(|path| IpcServer::bind(&path))
    {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to set up ipc socket");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let shared = SharedSnapshot::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pid_tx, pid_rx) = mpsc::unbounded_channel();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(aggregator::run(
        aggregator,
        shared.clone(),
        cfg.interval(),
        pid_rx,
        Some(metrics.clone()),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(server.run(
        shared.clone(),
        pid_tx,
        Some(metrics.clone()),
        shutdown_rx.clone(),
    )));

    match TcpListener::bind(cfg.api_listen).await {
        Ok(listener) => {
            tasks.push(tokio::spawn(api::serve(
                listener,
                shared.clone(),
                shutdown_rx.clone(),
            )));
        }
        Err(err) => {
            error!(error = %err, listen = %cfg.api_listen, "query api disabled: failed to bind");
        }
    }

    if let Some(addr) = cfg.http_listen {
        let app = http::build_router(metrics.clone(), shared.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, listen = %addr, "failed to start http server");
                    return;
                }
            };
            info!(listen = %addr, "http server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        }));
    }

    wait_for_termination().await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            error!(error = %err, "task failed during shutdown");
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LogLevel::from_env().as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<Config, config::ConfigError> {
    match path {
        Some(path) => Config::load_from_file(path),
        None => Ok(Config::default()),
    }
}

async fn run_query(cfg: &Config) -> i32 {
    let path = match socket::socket_path_from_env(cfg.socket_path.as_deref()) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "cannot locate gpustatd socket");
            return 1;
        }
    };
    let message = match client::query(&path, QUERY_TIMEOUT).await {
        Ok(message) => message,
        Err(err) => {
            error!(error = %err, path = %path.display(), "query failed");
            return 1;
        }
    };
    match serde_json::to_string_pretty(&message) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(err) => {
            error!(error = %err, "failed to serialize reply");
            1
        }
    }
}

async fn wait_for_termination() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to wait for Ctrl+C");
            }
        }
        _ = sigterm => info!("received SIGTERM"),
    }
}
