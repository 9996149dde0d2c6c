//! Fleet CLI - start, stop, reload and list the apps of a fleet.
//!
//! Commands other than `start` are sent to the fleet's host over the control
//! socket next to the config file; `start` spawns app entries directly.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::{
    AppStat, Command, CommandSpawner, ControlAddress, FleetConfig, GuestConnector, GuestOptions,
    ProcessSpawner, SpawnRequest,
};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(about = "Manage a fleet of cooperating RPC apps")]
struct Args {
    /// Fleet config file
    #[arg(short, long, global = true, default_value = "fleet.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Start one app, or every serving app that is not running yet
    Start { app: Option<String> },
    /// Stop one app, or all of them
    Stop { app: Option<String> },
    /// Reload one app, or all of them
    Reload { app: Option<String> },
    /// Show every declared app and whether it is running
    List,
    /// Stop, then start again
    Restart { app: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = FleetConfig::load(&args.config)
        .with_context(|| format!("Failed to load fleet config {}", args.config.display()))?;
    debug!("Using fleet config {}", config.path.display());

    match args.command {
        Action::Start { app } => start(&config, app.as_deref()).await,
        Action::Stop { app } => send(&config, Command::Stop, app.as_deref()).await,
        Action::Reload { app } => send(&config, Command::Reload, app.as_deref()).await,
        Action::List => list(&config).await,
        Action::Restart { app } => {
            if let Some(connector) = try_connect(&config).await {
                let result = connector.request(Command::Stop, app.as_deref()).await?;
                print_outcome(app.as_deref(), &result);
            }
            start(&config, app.as_deref()).await
        }
    }
}

/// Connect to the fleet's host as an anonymous guest.
async fn connect(config: &FleetConfig) -> Result<GuestConnector> {
    let address = ControlAddress::for_config(&config.path)?;
    let connector = GuestConnector::new(address.clone(), GuestOptions::default());
    connector
        .connect()
        .await
        .with_context(|| format!("No fleet is running at {}", address))?;
    Ok(connector)
}

async fn try_connect(config: &FleetConfig) -> Option<GuestConnector> {
    match connect(config).await {
        Ok(connector) => Some(connector),
        Err(e) => {
            debug!("{:#}", e);
            None
        }
    }
}

async fn send(config: &FleetConfig, cmd: Command, app: Option<&str>) -> Result<()> {
    let connector = connect(config).await?;
    let result = connector.request(cmd, app).await?;
    print_outcome(app, &result);
    Ok(())
}

async fn start(config: &FleetConfig, app: Option<&str>) -> Result<()> {
    let targets: Vec<&str> = match app {
        Some(name) => {
            if config.app(name).is_none() {
                bail!("App '{}' is not declared in {}", name, config.path.display());
            }
            vec![name]
        }
        None => config
            .apps
            .iter()
            .filter(|a| a.is_server())
            .map(|a| a.name.as_str())
            .collect(),
    };

    let running = running_apps(config).await;
    for name in targets {
        if running.contains(name) {
            println!("{}: already running", name);
            continue;
        }
        let request = SpawnRequest::for_app(config, name)?;
        let pid = CommandSpawner.spawn(&request)?;
        println!("{}: started (pid {})", name, pid);
    }
    Ok(())
}

async fn running_apps(config: &FleetConfig) -> HashSet<String> {
    let Some(connector) = try_connect(config).await else {
        return HashSet::new();
    };
    match connector.request(Command::List, None).await {
        Ok(rows) => serde_json::from_value::<Vec<AppStat>>(rows)
            .unwrap_or_default()
            .into_iter()
            .filter(|row| row.available)
            .map(|row| row.app)
            .collect(),
        Err(e) => {
            debug!("Listing running apps failed: {}", e);
            HashSet::new()
        }
    }
}

async fn list(config: &FleetConfig) -> Result<()> {
    let rows: Vec<AppStat> = match try_connect(config).await {
        Some(connector) => {
            let value = connector.request(Command::List, None).await?;
            serde_json::from_value(value).context("Malformed list reply")?
        }
        None => config.apps.iter().map(|app| AppStat::new(app, None)).collect(),
    };

    println!(
        "{:<20} {:<32} {:<8} {:>8} {:>10} {:>10} {:>6}",
        "APP", "URI", "STATUS", "PID", "UPTIME", "MEMORY", "CPU"
    );
    for row in rows {
        println!(
            "{:<20} {:<32} {:<8} {:>8} {:>10} {:>10} {:>6}",
            row.app,
            row.uri,
            if row.available { "running" } else { "stopped" },
            row.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            row.uptime.map_or_else(|| "-".to_string(), format_uptime),
            row.memory.map_or_else(|| "-".to_string(), format_memory),
            row.cpu.map_or_else(|| "-".to_string(), |c| format!("{:.1}%", c)),
        );
    }
    Ok(())
}

fn print_outcome(app: Option<&str>, result: &Value) {
    match (app, result) {
        (None, Value::Array(rows)) => {
            if rows.is_empty() {
                println!("No apps are running");
            }
            for row in rows {
                let name = row["app"].as_str().unwrap_or("?");
                match row.get("error") {
                    Some(error) => println!("{}: error: {}", name, display(error)),
                    None => println!("{}: {}", name, display(&row["result"])),
                }
            }
        }
        (Some(name), value) => println!("{}: {}", name, display(value)),
        (None, value) => println!("{}", display(value)),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

fn format_memory(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}
