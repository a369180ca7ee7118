use anyhow::Context;
use cellwright_core::CellEvent;
use cellwright_orchestrator::{CellConfig, SensorSuite, SimCell, SimScenario, TaskScheduler};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cellwright", about = "cellwright: task orchestration for a kitting cell")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cellwright.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario against the simulated cell
    Simulate {
        /// Scenario file
        scenario: PathBuf,
        /// Print scheduler events to stdout as JSON lines
        #[arg(long)]
        events: bool,
        /// Period of simulated sensor callbacks, in milliseconds
        #[arg(long, default_value_t = 1000)]
        publish_ms: u64,
    },
    /// Validate the config file and print the effective settings
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the config file, or the defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<CellConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(CellConfig::default());
    }
    CellConfig::load(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

async fn simulate(
    config: CellConfig,
    scenario_path: &Path,
    print_events: bool,
    publish_every: Duration,
) -> anyhow::Result<()> {
    let scenario = SimScenario::load(scenario_path)
        .with_context(|| format!("Failed to load scenario '{}'", scenario_path.display()))?;

    let sensors = SensorSuite::from_config(&config);
    let cell = SimCell::new(&sensors);
    let mut background = cell.apply(&scenario)?;
    background.push(cell.spawn_publisher(publish_every));
    info!(
        parts = scenario.parts.len(),
        conveyor = scenario.conveyor.len(),
        orders = scenario.orders.len(),
        blackouts = scenario.blackouts.len(),
        "Scenario loaded"
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<CellEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !print_events {
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }
    });

    let scheduler = TaskScheduler::new(config, sensors, cell.collaborators())?.with_events(tx);
    let monitor = scheduler.monitor().clone();
    let report = scheduler.run().await?;
    drop(scheduler);
    printer.await?;
    for handle in background {
        handle.abort();
    }

    let summary = serde_json::json!({
        "report": report,
        "actuators": monitor.to_json().await,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Simulate {
            scenario,
            events,
            publish_ms,
        } => {
            info!(config = %cli.config.display(), "Starting simulated cell");
            simulate(config, &scenario, events, Duration::from_millis(publish_ms)).await?;
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            info!("Configuration is valid");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "cellwright",
            "--config",
            "cell.toml",
            "simulate",
            "demos/scenario.toml",
            "--events",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("cell.toml"));
        match cli.command {
            Commands::Simulate {
                scenario,
                events,
                publish_ms,
            } => {
                assert_eq!(scenario, PathBuf::from("demos/scenario.toml"));
                assert!(events);
                assert_eq!(publish_ms, 1000);
            }
            Commands::CheckConfig => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CellConfig::default());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_ms = 0").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config file"));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&CellConfig::default()).unwrap();
        let parsed = CellConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, CellConfig::default());
    }
}
