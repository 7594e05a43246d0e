mod cache;
mod collectors;
mod config;
mod http;
mod metrics;
mod state;
mod transport;

use axum::serve;
use cache::{run_refresh_loop, RefreshCache};
use clap::Parser;
use collectors::{Collect, CommandRunner, SnapshotAggregator};
use config::Config;
use metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::OpenSshTransport;

#[derive(Parser, Debug)]
#[command(name = "gpumond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Collect one snapshot, print it as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    let credentials = match cfg.ssh.resolve_credentials() {
        Ok(credentials) => credentials,
        Err(err) => {
            error!(error = %err, "failed to resolve ssh credentials");
            std::process::exit(1);
        }
    };

    let transport = Arc::new(OpenSshTransport::new(&cfg.ssh, credentials));
    let runner = Arc::new(CommandRunner::new(
        transport,
        cfg.ssh.command_timeout(),
        cfg.ssh.slow_command_timeout(),
    ));
    let aggregator = Arc::new(SnapshotAggregator::new(
        runner.clone(),
        cfg.storage_mount_prefixes.clone(),
    ));

    if cli.once {
        let snapshot = aggregator.collect().await;
        runner.shutdown().await;
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!(error = %err, "failed to serialize snapshot");
                std::process::exit(1);
            }
        }
        if snapshot.is_session_failure() {
            std::process::exit(1);
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        host = %cfg.ssh.host,
        poll_interval = %humantime::format_duration(cfg.poll_interval()),
        max_cache_age = %humantime::format_duration(cfg.max_cache_age()),
        "starting gpumond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };
    let cache = Arc::new(
        RefreshCache::new(aggregator, cfg.max_cache_age(), cfg.refresh_wait())
            .with_metrics(metrics.clone()),
    );

    let shutdown = CancellationToken::new();

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, cache);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            let server = serve(listener, app).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let refresh_task = tokio::spawn(run_refresh_loop(
        cache.clone(),
        cfg.poll_interval(),
        shutdown.clone(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    shutdown.cancel();

    let _ = refresh_task.await;
    let _ = http_task.await;
    runner.shutdown().await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
