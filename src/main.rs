// ███████╗████████╗ ██████╗ ██████╗ ███╗   ███╗
// ██╔════╝╚══██╔══╝██╔═══██╗██╔══██╗████╗ ████║
// ███████╗   ██║   ██║   ██║██████╔╝██╔████╔██║
// ╚════██║   ██║   ██║   ██║██╔══██╗██║╚██╔╝██║
// ███████║   ██║   ╚██████╔╝██║  ██║██║ ╚═╝ ██║
// ╚══════╝   ╚═╝    ╚═════╝ ╚═╝  ╚═╝╚═╝     ╚═╝
//
// R E P O R T   C O L L E C T O R
//
// Every tick: download today's tornado, hail and wind report snapshots,
// type every row, and publish one message per report to the broker.

mod collector;
mod config;
mod error;
mod fetcher;
mod models;
mod parser;
mod publisher;
mod scheduler;
mod transformer;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::collector::Collector;
use crate::config::Config;
use crate::fetcher::HttpFetcher;
use crate::publisher::RedisPublisher;
use crate::scheduler::TickScheduler;

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════╗
    ║                                                          ║
    ║        ⛈  SEVERE WEATHER REPORT COLLECTOR  ⛈            ║
    ║                                                          ║
    ║   Feeds:     tornado | hail | wind                       ║
    ║   Pipeline:  fetch → parse → transform → publish         ║
    ║   Cadence:   cron, one collector at a time               ║
    ║                                                          ║
    ╚══════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner);
}

/// Console logging, plus a plain-text copy in `log_path` when configured.
fn init_tracing(log_path: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration problems are fatal and happen before logging exists,
    // so they go straight to stderr via anyhow.
    let config = Config::from_env().context("invalid configuration")?;

    init_tracing(config.log_path.as_deref())?;
    print_banner();

    info!(
        api_endpoint = %config.api_endpoint,
        event_date = %config.event_date,
        cron = config.cron_interval.expr(),
        broker = %config.broker_url,
        topic = %config.topic,
        "Configuration loaded"
    );

    let fetcher = HttpFetcher::new(config.http_timeout, &config.http_user_agent)
        .context("failed to build snapshot fetcher")?;
    let publisher = RedisPublisher::new(&config.broker_url, &config.topic, &config.client_id)
        .context("failed to configure broker publisher")?;

    let collectors: Vec<Collector> = config
        .collector_configs()
        .into_iter()
        .map(Collector::new)
        .collect();

    let scheduler = TickScheduler::new(collectors, Arc::new(fetcher), Arc::new(publisher));
    for collector in scheduler.collectors() {
        info!(
            variant = %collector.variant(),
            endpoint = %collector.endpoint(),
            event_date = %collector.config().event_date(),
            snapshot = %collector.config().local_snapshot_path().display(),
            "Collector registered"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedule = config.cron_interval.clone();
    let scheduler_handle = tokio::spawn(scheduler.run(schedule, shutdown_rx));

    info!("Collector active, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => warn!("Shutdown signal received"),
        Err(err) => error!("Signal listener error: {}", err),
    }
    let _ = shutdown_tx.send(true);

    info!("Waiting for the current tick to finish...");
    match scheduler_handle.await {
        Ok(Ok(ticks)) => info!(ticks, "Collector stopped"),
        Ok(Err(e)) => error!(error = %e, "Scheduler stopped with an error"),
        Err(e) => error!(error = %e, "Scheduler task panicked"),
    }

    Ok(())
}
