use std::{path::Path, sync::Arc};

use axon_dash::{
    ApiHttpClient, ConnectionManager, EntityWatcher, GracefulShutdown, HttpQueueClient,
    HttpSnapshotFetcher, ReconcileSettings, ReconciliationEngine, SnapshotCache,
    WebSocketTransport,
    config::{ClientConfig, ClientConfigValidator, load_config_or_default},
    core::{
        backoff::BackoffPolicy,
        entity_watch::EntityReading,
        model::{Period, ViewStatus},
    },
    metrics,
    ports::{QueueApi, SnapshotSource},
    tracing_setup,
};
use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde_json::Value;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,

    /// Configuration file. Defaults plus `AXON_DASH__*` variables when omitted.
    #[clap(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow live usage metrics until interrupted
    Watch {
        /// Reporting period (24h, 7d, 30d, 90d). Defaults to the configured one.
        #[clap(short, long)]
        period: Option<Period>,
        /// Also follow the live metrics of this API
        #[clap(long)]
        api: Option<String>,
    },
    /// Fetch one snapshot and print it as JSON
    Snapshot {
        #[clap(short, long)]
        period: Option<Period>,
    },
    /// Inspect and manage the request queue
    Queues {
        #[clap(subcommand)]
        action: QueueCommand,
    },
    /// Validate configuration file
    Validate,
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "dash.toml")]
        output: String,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    /// Queue overview
    List,
    /// Requests currently being processed
    Active,
    /// Current queue configuration
    Config,
    /// Replace the queue configuration with a JSON file
    SetConfig { file: String },
    /// Cancel a queued request
    Cancel { request_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match &args.command {
        Commands::Validate => return validate_config_command(args.config.as_deref()).await,
        Commands::Init { output } => return init_config_command(output).await,
        _ => {}
    }

    let config =
        load_config_or_default(args.config.as_deref()).wrap_err("Failed to load configuration")?;
    ClientConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing_setup::init_from_config(&config.logging)?;
    metrics::init_metrics()?;

    match args.command {
        Commands::Watch { period, api } => {
            watch_command(&config, period.unwrap_or(config.period), api).await
        }
        Commands::Snapshot { period } => {
            snapshot_command(&config, period.unwrap_or(config.period)).await
        }
        Commands::Queues { action } => queues_command(&config, action).await,
        Commands::Validate | Commands::Init { .. } => Ok(()),
    }
}

async fn watch_command(config: &ClientConfig, period: Period, api: Option<String>) -> Result<()> {
    let transport = WebSocketTransport::from_config(config)?;
    let policy =
        BackoffPolicy::try_from(&config.reconnect).wrap_err("Invalid reconnect settings")?;
    let manager = ConnectionManager::init(Arc::new(transport), policy);

    println!("🚀 Connecting to {}", manager.endpoint());
    if let Err(e) = manager.connect(config.token()).await {
        // Snapshots keep flowing without the channel
        tracing::error!(error = %e, "Live updates unavailable");
        eprintln!("❌ Live updates unavailable: {e}");
    }

    let client = ApiHttpClient::from_config(config)?;
    let engine = ReconciliationEngine::start(
        period,
        &manager,
        Arc::new(HttpSnapshotFetcher::new(client)),
        Arc::new(SnapshotCache::new()),
        ReconcileSettings::from(&config.snapshot),
    );
    let watcher = api.map(|id| EntityWatcher::watch(&manager, id));

    let shutdown = GracefulShutdown::new();
    let signal = shutdown.wait_for_signal();
    tokio::pin!(signal);

    let mut views = engine.watch();
    let mut channel = manager.watch_state();
    let mut readings = watcher.as_ref().map(EntityWatcher::subscribe);
    print_view(&views.borrow_and_update());

    loop {
        tokio::select! {
            reason = &mut signal => {
                let reason = reason?;
                tracing::info!(?reason, "Stopping watch");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                print_view(&views.borrow_and_update());
            }
            changed = channel.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *channel.borrow_and_update();
                println!("📡 Channel {state}");
            }
            Some(reading) = next_reading(&mut readings) => {
                print_reading(&reading);
            }
        }
    }

    shutdown
        .drain(async {
            engine.stop();
            if let Some(watcher) = &watcher {
                watcher.stop();
            }
            ConnectionManager::shutdown_global().await;
        })
        .await;
    println!("👋 Bye");
    Ok(())
}

async fn next_reading(
    readings: &mut Option<watch::Receiver<Option<EntityReading>>>,
) -> Option<EntityReading> {
    match readings.as_mut() {
        Some(rx) => {
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
            rx.borrow_and_update().clone()
        }
        None => std::future::pending().await,
    }
}

fn print_view(status: &ViewStatus) {
    let (marker, view) = match status {
        ViewStatus::Loading => {
            println!("⏳ Loading snapshot...");
            return;
        }
        ViewStatus::Live(view) => ("🟢 live ", view),
        ViewStatus::Stale(view) => ("🟡 stale", view),
    };
    println!(
        "{marker} [{}] streams={} data={:.3} GB avg={:.1}ms max={:.1}ms deltas={}",
        view.period,
        view.total_streams,
        view.total_bytes_gb,
        view.avg_duration_ms,
        view.max_duration_ms,
        view.deltas_applied,
    );
}

fn print_reading(reading: &EntityReading) {
    let m = &reading.metrics;
    println!(
        "🔎 {} ({}) today={} hour={} success={:.1}% avg={:.1}ms p95={:.1}ms errors={}",
        reading.api_name,
        reading.api_id,
        m.requests_today,
        m.requests_hour,
        m.success_rate,
        m.avg_latency_ms,
        m.p95_latency_ms,
        m.error_count,
    );
}

async fn snapshot_command(config: &ClientConfig, period: Period) -> Result<()> {
    let fetcher = HttpSnapshotFetcher::new(ApiHttpClient::from_config(config)?);
    let snapshot = fetcher
        .fetch(period)
        .await
        .wrap_err_with(|| format!("Failed to fetch {period} snapshot"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn queues_command(config: &ClientConfig, action: QueueCommand) -> Result<()> {
    let queues = HttpQueueClient::new(ApiHttpClient::from_config(config)?);

    let body = match action {
        QueueCommand::List => queues.list_queues().await?,
        QueueCommand::Active => queues.active_requests().await?,
        QueueCommand::Config => queues.queue_config().await?,
        QueueCommand::SetConfig { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .wrap_err_with(|| format!("Failed to read {file}"))?;
            let update: Value = serde_json::from_str(&raw)
                .wrap_err_with(|| format!("{file} is not valid JSON"))?;
            queues.update_queue_config(&update).await?
        }
        QueueCommand::Cancel { request_id } => {
            queues.cancel_request(&request_id).await?;
            println!("✅ Cancelled request {request_id}");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: Option<&str>) -> Result<()> {
    match config_path {
        Some(path) => {
            println!("🔍 Validating configuration file: {path}");
            if !Path::new(path).exists() {
                eprintln!("❌ Error: Configuration file '{path}' not found");
                std::process::exit(1);
            }
        }
        None => println!("🔍 Validating configuration from environment"),
    }

    let config = match load_config_or_default(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ClientConfigValidator::validate(&config) {
        Ok(()) => {
            let channel_url = config
                .resolved_channel_url()
                .map_err(|e| eyre!("Cannot derive channel URL: {e}"))?;
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • API Base URL: {}", config.api_base_url);
            println!("   • Channel URL: {channel_url}");
            println!("   • Period: {}", config.period);
            println!("   • Auth Token: {}", if config.token().is_empty() { "not set" } else { "set" });
            println!(
                "   • Reconnect: {} → {} (x{}, ±{:.0}%), give up after {} failures",
                config.reconnect.base_delay,
                config.reconnect.max_delay,
                config.reconnect.multiplier,
                config.reconnect.jitter * 100.0,
                config.reconnect.max_consecutive_failures
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure api_base_url starts with http:// or https://");
            println!("   • Ensure channel_url starts with ws:// or wss://");
            println!("   • Use humantime durations for delays (e.g. '500ms', '30s')");
            println!("   • Keep jitter between 0.0 and 1.0");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Axon Dash Configuration

# Dashboard REST API
api_base_url = "http://127.0.0.1:8000/api/v1"

# Push channel, derived from api_base_url when omitted
# channel_url = "ws://127.0.0.1:8000/api/v1/ws"

# Bearer token, or set AXON_DASH__AUTH_TOKEN
# auth_token = ""

# Reporting period: 24h, 7d, 30d, 90d
period = "30d"

[reconnect]
base_delay = "500ms"
max_delay = "30s"
multiplier = 2.0
jitter = 0.3
max_consecutive_failures = 8

[snapshot]
freshness_window_secs = 60
retry_interval_secs = 5
# 0 disables periodic refresh
refresh_interval_secs = 0
request_timeout_secs = 10
max_pending_deltas = 10000

[logging]
level = "info"
json = false
include_spans = false
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'axon-dash --config {config_path} watch' to follow live metrics");
    Ok(())
}
