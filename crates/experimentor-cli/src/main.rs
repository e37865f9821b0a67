//! `experimentor` – command line front end.
//!
//! ```text
//! experimentor relay                       # run the central relay
//! experimentor listen --topic camera       # print what arrives on a topic
//! experimentor push --topic camera '{"exposure": 10}'
//! experimentor stop [--topic camera]       # send an exit sentinel
//! experimentor run scan.toml               # load devices, start, wait for Ctrl-C
//! experimentor config [--init]             # show or write ~/.experimentor/config.toml
//! ```
//!
//! Ctrl-C raises the shared stop flag; relays and subscribers notice it
//! within one poll interval and exit cleanly.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use experimentor_hal::DriverRegistry;
use experimentor_middleware::{Publisher, Pusher, RelayContext, StopFlag, Subscriber};
use experimentor_runtime::{Experiment, ExperimentConfig, ModelRegistry};
use experimentor_types::{ExpError, Payload};
use serde_json::Value;
use tracing::warn;

#[derive(Parser)]
#[command(name = "experimentor")]
#[command(about = "Laboratory experiment orchestration and data relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until it receives the exit sentinel or Ctrl-C
    Relay,

    /// Publish one message
    Push {
        #[arg(long, default_value = "")]
        topic: String,
        /// JSON value; anything that is not JSON is sent as a string
        data: String,
    },

    /// Print every message on a topic (all topics if empty)
    Listen {
        #[arg(long, default_value = "")]
        topic: String,
    },

    /// Stop the subscribers of a topic, or the relay when no topic is given
    Stop {
        #[arg(long)]
        topic: Option<String>,
    },

    /// Load an experiment file, start its relay and devices, wait for Ctrl-C
    Run {
        /// Experiment file (TOML); defaults to `default_experiment` of the config
        file: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Before the runtime exists: the span exporter must not need one.
    let _guard = experimentor_runtime::telemetry::init_tracing("experimentor");

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };

    let stop = StopFlag::new();
    let on_ctrlc = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "Ctrl-C received, shutting down".yellow().bold());
        on_ctrlc.set();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Cannot start runtime".red());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli.command, cfg, stop)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command, cfg: config::Config, stop: StopFlag) -> Result<(), ExpError> {
    let ctx = RelayContext::with_stop(cfg.relay.clone(), stop.clone());
    match command {
        Command::Relay => relay(ctx).await,
        Command::Push { topic, data } => push(ctx, &topic, &data).await,
        Command::Listen { topic } => listen(ctx, topic).await,
        Command::Stop { topic } => send_stop(ctx, topic).await,
        Command::Run { file } => {
            let Some(file) = file.or(cfg.default_experiment) else {
                return Err(ExpError::InvalidConfig(
                    "no experiment file given and no default_experiment configured".to_string(),
                ));
            };
            run_experiment(file, stop).await
        }
        Command::Config { init } => show_config(&cfg, init),
    }
}

async fn relay(ctx: RelayContext) -> Result<(), ExpError> {
    let mut publisher = Publisher::new(ctx);
    let addrs = publisher.start().await?;
    println!(
        "  {} fan-in {}  fan-out {}",
        "relay up".green().bold(),
        addrs.fanin.to_string().bold(),
        addrs.fanout.to_string().bold()
    );
    let stats = publisher.join().await?;
    println!("  {} after {} message(s)", "relay stopped".green(), stats.relayed);
    Ok(())
}

fn parse_data(data: &str) -> Payload {
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Payload::Object(value),
        Err(_) => Payload::text(data),
    }
}

async fn push(ctx: RelayContext, topic: &str, data: &str) -> Result<(), ExpError> {
    let pusher = Pusher::connect(ctx).await?;
    pusher.publish(parse_data(data), topic).await?;
    pusher.finish().await;
    println!("  {} on '{}'", "sent".green(), topic);
    Ok(())
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Object(value) => value.to_string(),
        Payload::Array(array) => format!("<{} array {:?}>", array.dtype(), array.shape()),
    }
}

async fn listen(ctx: RelayContext, topic: String) -> Result<(), ExpError> {
    let label = if topic.is_empty() { "*".to_string() } else { topic.clone() };
    let mut subscriber = Subscriber::start(ctx, topic, move |payload| {
        println!("{} {}", format!("[{label}]").cyan(), describe(&payload));
        Ok(())
    })
    .await?;
    println!("  {} (Ctrl-C to quit)", "listening".green().bold());
    let stats = subscriber.join().await?;
    println!("  {} after {} message(s)", "done".green(), stats.delivered);
    Ok(())
}

async fn send_stop(ctx: RelayContext, topic: Option<String>) -> Result<(), ExpError> {
    let (sentinel, topic) = match topic {
        Some(t) => (ctx.config.subscriber_exit.clone(), t),
        None => (ctx.config.publisher_exit.clone(), String::new()),
    };
    let pusher = Pusher::connect(ctx).await?;
    pusher.publish(Payload::text(sentinel.as_str()), &topic).await?;
    pusher.finish().await;
    println!("  {} '{}' on '{}'", "sent".green(), sentinel, topic);
    Ok(())
}

async fn run_experiment(file: PathBuf, stop: StopFlag) -> Result<(), ExpError> {
    let mut exp_cfg = ExperimentConfig::load(&file)?;
    let mut overridden = config::Config {
        relay: exp_cfg.relay,
        default_experiment: None,
    };
    config::apply_env_overrides(&mut overridden);
    exp_cfg.relay = overridden.relay;

    let name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "experiment".to_string());
    let mut experiment = Experiment::from_config(
        name,
        exp_cfg,
        stop.clone(),
        DriverRegistry::with_sim_drivers(),
        Arc::new(ModelRegistry::new()),
    )?;

    let addrs = experiment.start().await?;
    println!(
        "  {} {} (fan-in {}, fan-out {})",
        "experiment".bold(),
        experiment.name().bold().cyan(),
        addrs.fanin,
        addrs.fanout
    );

    let report = experiment.initialize_devices();
    for name in &report.initialized {
        println!("    {} {name}", "✓".green());
    }
    for name in &report.without_driver {
        println!("    {} {name} (no driver)", "-".dimmed());
    }
    for (name, e) in &report.failed {
        println!("    {} {name}: {e}", "✗".red());
    }

    let poll = experiment.client_context()?.config.poll_interval;
    while !stop.is_set() && experiment.is_running() {
        tokio::time::sleep(poll).await;
    }

    // The stop flag already ended the relay thread; finalize only collects it.
    let stats = experiment.finalize().await?;
    println!("  {} after {} message(s)", "experiment finished".green(), stats.relayed);
    Ok(())
}

fn show_config(cfg: &config::Config, init: bool) -> Result<(), ExpError> {
    let path = config::config_path();
    if init {
        if path.exists() {
            println!("  {} already exists", path.display().to_string().bold());
        } else {
            config::save(&config::Config::default())
                .map_err(|e| ExpError::InvalidConfig(e.to_string()))?;
            println!("  {} {}", "✓".green().bold(), path.display().to_string().bold());
        }
    }
    let text = toml::to_string_pretty(cfg).map_err(|e| ExpError::Serialization(e.to_string()))?;
    println!("# {}", path.display());
    println!("{text}");
    Ok(())
}
