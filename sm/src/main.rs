//! StatMon - status monitor dispatch core
//!
//! CLI entry point: feeds a recorded or piped monitor stream through the
//! dispatcher, with the main thread acting as the owning context.

use std::collections::BTreeSet;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tokio::sync::watch;
use tracing::{debug, info};

use statmon::cli::{Cli, Command};
use statmon::config::Config;
use statmon::context;
use statmon::dispatch::{DispatchMetrics, Dispatcher, StaticSource};
use statmon::feed::{FeedStats, read_feed};
use statmon::registry::parse_channel_list;
use statmon::watch::{ConfigWatch, PrintWatch};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // stdout is reserved for watch output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            input,
            snapshot,
            channels,
        } => cmd_run(&config, input, snapshot, channels),
        Command::Config => cmd_config(&config),
    }
}

fn cmd_run(
    config: &Config,
    input: Option<PathBuf>,
    snapshot: Option<PathBuf>,
    channels: Option<String>,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let (ctx, mut ctx_queue) = context::channel();
    let ctx = ctx.with_call_timeout(config.dispatch.call_timeout());
    let (quit_tx, quit_rx) = watch::channel(false);

    let mut dispatcher = Dispatcher::new(config.dispatch.clone(), ctx);
    if let Some(path) = snapshot {
        let json = fs::read_to_string(&path).context(format!("Failed to read snapshot {}", path.display()))?;
        let source = StaticSource::from_json(&json).context("Failed to parse snapshot")?;
        dispatcher = dispatcher.with_source(Arc::new(source));
    }
    // Backfill fetches spawn on the runtime entered here
    let handle = {
        let _guard = runtime.enter();
        dispatcher.handle()
    };

    for watch in &config.watches {
        PrintWatch::new(watch.id.clone(), watch.keys.clone())
            .register(&handle)
            .context(format!("Failed to register watch '{}'", watch.id))?;
    }

    if config.config_watch {
        let config_watch = ConfigWatch::new();
        config_watch.on_change(|change| {
            println!(
                "{} focus={} instrument={}",
                "config".green().bold(),
                change.focus,
                change.instrument
            );
            Ok(())
        });
        config_watch.register(&handle)?;
    }

    let mut printed: BTreeSet<String> = config
        .monitor
        .channels
        .iter()
        .filter(|c| c.as_str() != "status")
        .cloned()
        .collect();
    if let Some(extra) = channels {
        printed.extend(parse_channel_list(&extra));
    }
    if !printed.is_empty() {
        let printed: Vec<String> = printed.into_iter().collect();
        PrintWatch::register_channels(&handle, "print-channels", &printed)?;
    }

    let mut subscribed: BTreeSet<String> = config.monitor.channels.iter().cloned().collect();
    subscribed.extend(handle.channels()?);
    info!(channels = ?subscribed, "Subscribing to monitor channels");

    let dispatch_task = runtime.spawn(dispatcher.run(quit_rx.clone()));

    let feed_handle = handle.clone();
    let feed_thread = std::thread::spawn(move || -> Result<FeedStats> {
        match input {
            Some(path) => {
                let file = fs::File::open(&path).context(format!("Failed to open feed {}", path.display()))?;
                read_feed(BufReader::new(file), &feed_handle)
            }
            None => read_feed(std::io::stdin().lock(), &feed_handle),
        }
    });

    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            let _ = quit_tx.send(true);
        }
    });

    // The feed thread now holds the last handle; the loops end once it finishes
    drop(handle);
    ctx_queue
        .run_blocking(quit_rx, config.dispatch.poll_timeout())
        .context("Owning context loop failed")?;

    let metrics = runtime.block_on(dispatch_task).context("Dispatcher task failed")??;

    // An interrupted reader may still be blocked on stdin
    let stats = if feed_thread.is_finished() {
        Some(feed_thread.join().map_err(|_| eyre!("Feed reader panicked"))??)
    } else {
        None
    };

    print_summary(&metrics, stats.as_ref());
    Ok(())
}

fn print_summary(metrics: &DispatchMetrics, stats: Option<&FeedStats>) {
    println!();
    println!("{}", "Summary".bold());
    if let Some(stats) = stats {
        println!("  Feed lines:          {}", stats.lines);
        println!("  Delivered:           {}", stats.delivered);
        if stats.malformed > 0 {
            println!("  Malformed:           {}", stats.malformed.to_string().yellow());
        }
    }
    println!("  Batches applied:     {}", metrics.batches_applied);
    if metrics.batches_dropped > 0 {
        println!("  Batches dropped:     {}", metrics.batches_dropped.to_string().red());
    }
    println!("  Channel events:      {}", metrics.channel_events);
    println!("  Callbacks scheduled: {}", metrics.callbacks_scheduled);
    if metrics.callback_failures > 0 {
        println!("  Callback failures:   {}", metrics.callback_failures.to_string().red());
    }
    if metrics.latency_warnings > 0 {
        println!("  Latency warnings:    {}", metrics.latency_warnings.to_string().yellow());
    }
    println!("  Subscriptions:       {}", metrics.subscriptions);
}

fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
