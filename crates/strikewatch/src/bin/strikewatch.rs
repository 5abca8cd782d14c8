//! Strikewatch CLI
//!
//! Usage:
//!   strikewatch query --lat 40.71 --lon -74.0           # One-shot activity report (JSON)
//!   strikewatch query --lat 40.71 --lon -74.0 -r 25     # Narrower search radius
//!   strikewatch watch --lat 40.71 --lon -74.0           # Log activity until Ctrl+C

use anyhow::Context;
use argh::FromArgs;
use std::path::PathBuf;
use std::time::Duration;
use strikewatch::config::{default_config_path, resolve_config};
use strikewatch::query::{DEFAULT_RADIUS_KM, DEFAULT_TIME_WINDOW_MINUTES};
use strikewatch::{LightningQuery, MqttFeed, QueryEngine, StrikeConfig, StrikeService};
use tokio::sync::watch;

/// Strikewatch - live lightning proximity from the Blitzortung network
#[derive(FromArgs)]
struct Args {
    /// show version information
    #[argh(switch, short = 'V')]
    version: bool,

    /// config file (default: ~/.strikewatch/config.yaml)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// broker URL, overrides config and STRIKEWATCH_BROKER_URL
    #[argh(option, short = 'b')]
    broker: Option<String>,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Query(QueryArgs),
    Watch(WatchArgs),
}

/// Print a lightning activity report as JSON
#[derive(FromArgs)]
#[argh(subcommand, name = "query")]
struct QueryArgs {
    /// latitude in degrees
    #[argh(option, short = 'y')]
    lat: f64,

    /// longitude in degrees
    #[argh(option, short = 'x')]
    lon: f64,

    /// search radius in km, 1-500 (default: 50)
    #[argh(option, short = 'r', default = "DEFAULT_RADIUS_KM")]
    radius: f64,

    /// time window in minutes, 5-120 (default: 30)
    #[argh(option, short = 'w', default = "DEFAULT_TIME_WINDOW_MINUTES")]
    window: u32,
}

/// Keep watching an area and log activity periodically
#[derive(FromArgs)]
#[argh(subcommand, name = "watch")]
struct WatchArgs {
    /// latitude in degrees
    #[argh(option, short = 'y')]
    lat: f64,

    /// longitude in degrees
    #[argh(option, short = 'x')]
    lon: f64,

    /// search radius in km, 1-500 (default: 50)
    #[argh(option, short = 'r', default = "DEFAULT_RADIUS_KM")]
    radius: f64,

    /// seconds between reports (default: 60)
    #[argh(option, short = 'i', default = "60")]
    interval: u64,
}

fn load_settings(args: &Args) -> anyhow::Result<StrikeConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let config = resolve_config(&path, args.broker.as_deref())
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(config)
}

fn setup_shutdown() -> anyhow::Result<watch::Receiver<()>> {
    let (tx, rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down gracefully...");
        let _ = tx.send(());
    })?;
    Ok(rx)
}

async fn run_query(
    service: StrikeService<MqttFeed>,
    args: QueryArgs,
) -> anyhow::Result<()> {
    let query = LightningQuery::new(args.lat, args.lon)
        .with_radius(args.radius)
        .with_time_window(args.window);
    query.validate()?;

    if let Err(e) = service.init().await {
        log::warn!("Feed unavailable, reporting without live data: {}", e);
    }

    let engine = QueryEngine::new(service.clone());
    let activity = engine.get_lightning_activity(&query).await?;
    service.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&activity)?);
    Ok(())
}

async fn run_watch(
    service: StrikeService<MqttFeed>,
    args: WatchArgs,
    mut shutdown: watch::Receiver<()>,
) -> anyhow::Result<()> {
    let query = LightningQuery::new(args.lat, args.lon).with_radius(args.radius);
    query.validate()?;

    if let Err(e) = service.init().await {
        log::warn!("Initial connection failed, will keep retrying: {}", e);
    }

    let engine = QueryEngine::new(service.clone());
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let activity = engine.get_lightning_activity(&query).await?;
                let status = service.status();
                log::info!(
                    "{} strikes within {} km (nearest: {}), level {}{} [{:?}, {} tiles, {} buffered]",
                    activity.statistics.total,
                    activity.search_radius_km,
                    activity
                        .safety
                        .nearest_km
                        .map(|d| format!("{:.1} km", d))
                        .unwrap_or_else(|| "none".to_string()),
                    activity.safety.level,
                    if activity.safety.is_active_thunderstorm { ", active storm" } else { "" },
                    status.state,
                    status.subscriptions,
                    status.buffered_strikes,
                );
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Args = argh::from_env();

    if args.version {
        println!("strikewatch {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_settings(&args)?;

    match args.command {
        None => {
            eprintln!("Strikewatch - live lightning proximity\n");
            eprintln!("Usage: strikewatch [-c config] [-b broker] <command>\n");
            eprintln!("Commands:");
            eprintln!("  query     Print a lightning activity report as JSON");
            eprintln!("              --lat, --lon, -r <km>, -w <minutes>");
            eprintln!("  watch     Log activity for an area until Ctrl+C");
            eprintln!("              --lat, --lon, -r <km>, -i <seconds>");
            eprintln!("\nRun 'strikewatch <command> --help' for more information.");
        }
        Some(Command::Query(query_args)) => {
            let feed = MqttFeed::new(&config)?;
            run_query(StrikeService::new(config, feed), query_args).await?;
        }
        Some(Command::Watch(watch_args)) => {
            let shutdown = setup_shutdown()?;
            let feed = MqttFeed::new(&config)?;
            run_watch(StrikeService::new(config, feed), watch_args, shutdown).await?;
        }
    }

    Ok(())
}
