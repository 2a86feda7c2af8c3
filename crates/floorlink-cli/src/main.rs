//! `floorlink` - drive the loaders against an in-process simulated plant

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use floorlink_cache::{CachePriority, RefreshStrategy, WidgetConfig};
use floorlink_loaders::{
    FloorlinkConfig, LoadAllParams, LoaderMode, LoaderRegistry, PlantLayout, SimulatedPlant,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Settle time for push updates to reach the monitoring loader
const PUSH_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
struct SimulateOptions {
    modes: Vec<LoaderMode>,
    config: Option<PathBuf>,
    equipment: usize,
    updates: usize,
}

fn cli() -> Command {
    Command::new("floorlink")
        .version(floorlink_loaders::VERSION)
        .about("Floorlink loaders against a simulated plant")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Initialize and load loaders, then print their status as JSON")
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .default_value("all")
                        .value_parser(["monitoring", "mapping", "dashboard", "all"])
                        .help("Loader to run"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML configuration file"),
                )
                .arg(
                    Arg::new("equipment")
                        .long("equipment")
                        .default_value("12")
                        .value_parser(value_parser!(usize))
                        .help("Number of simulated units"),
                )
                .arg(
                    Arg::new("updates")
                        .long("updates")
                        .default_value("0")
                        .value_parser(value_parser!(usize))
                        .help("Push updates to send after loading"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Validate a configuration file and print it resolved")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML configuration file"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // a second init only happens in tests and is harmless
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn simulate_options(args: &ArgMatches) -> Result<SimulateOptions> {
    let mode = args.get_one::<String>("mode").map_or("all", String::as_str);
    let modes = if mode == "all" {
        LoaderMode::ALL.to_vec()
    } else {
        vec![mode.parse::<LoaderMode>()?]
    };
    Ok(SimulateOptions {
        modes,
        config: args.get_one::<PathBuf>("config").cloned(),
        equipment: args.get_one::<usize>("equipment").copied().unwrap_or(12),
        updates: args.get_one::<usize>("updates").copied().unwrap_or_default(),
    })
}

fn load_config(path: Option<&Path>) -> Result<FloorlinkConfig> {
    match path {
        Some(path) => FloorlinkConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(FloorlinkConfig::default()),
    }
}

/// Widgets used when the configuration registers none
fn with_demo_widgets(mut config: FloorlinkConfig) -> FloorlinkConfig {
    if config.dashboard.widgets.is_empty() {
        config.dashboard = config
            .dashboard
            .with_widget("oee", WidgetConfig::new(CachePriority::High))
            .with_widget(
                "alarms",
                WidgetConfig::new(CachePriority::Critical).with_strategy(RefreshStrategy::Hybrid),
            )
            .with_widget("shift-report", WidgetConfig::new(CachePriority::Low));
    }
    config
}

/// Run one simulation; returns the JSON report and whether every step passed
async fn simulate(options: &SimulateOptions) -> Result<(Value, bool)> {
    let config = with_demo_widgets(load_config(options.config.as_deref())?);
    let plant = SimulatedPlant::new(PlantLayout {
        equipment: options.equipment,
        ..PlantLayout::default()
    });
    let registry = LoaderRegistry::new();
    registry.configure(plant.deps(), config);

    for &mode in &options.modes {
        registry
            .get_loader(mode, None)
            .await
            .with_context(|| format!("building {mode} loader"))?;
    }
    info!(modes = ?options.modes, equipment = options.equipment, "simulation started");

    let initialized = registry.initialize_all().await;
    let loaded = registry.load_all(&LoadAllParams::default()).await;
    let mut passed = initialized.iter().all(|r| r.result.is_ok()) && loaded.iter().all(|r| r.result.is_ok());

    let mut monitoring = Value::Null;
    if let Some(handle) = registry.cached(LoaderMode::Monitoring) {
        if options.updates > 0 {
            let delivered = plant.push_updates(options.updates);
            if delivered < options.updates {
                warn!(delivered, requested = options.updates, "push channel not open for every update");
                passed = false;
            }
            tokio::time::sleep(PUSH_SETTLE).await;
        }
        if let Some(loader) = handle.as_monitoring() {
            monitoring = json!({
                "stats": loader.stats(),
                "statusCounts": loader.status_counts(),
                "subscribed": loader.is_subscribed(),
            });
        }
    }

    let report = json!({
        "initialize": initialized,
        "load": loaded,
        "monitoring": monitoring,
        "health": registry.health_all().await,
        "status": registry.status(),
        "calls": plant.call_counts(),
    });
    registry.dispose_all().await;
    Ok((report, passed))
}

async fn run(matches: ArgMatches) -> Result<ExitCode> {
    match matches.subcommand() {
        Some(("simulate", args)) => {
            let options = simulate_options(args)?;
            let (report, passed) = simulate(&options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Some(("config", args)) => {
            let Some(path) = args.get_one::<PathBuf>("file") else {
                bail!("missing configuration file");
            };
            let config = load_config(Some(path))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        _ => bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    run(matches).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn fast_config() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitoring]\nsubscribe_delay_ms = 0\n\n[retry]\nretries = 0").unwrap();
        file
    }

    #[test]
    fn command_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn options_from_args() {
        let matches = cli()
            .try_get_matches_from(["floorlink", "simulate", "--mode", "mapping", "--equipment", "4"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(
            simulate_options(args).unwrap(),
            SimulateOptions {
                modes: vec![LoaderMode::Mapping],
                config: None,
                equipment: 4,
                updates: 0,
            }
        );
    }

    #[test]
    fn unknown_mode_is_rejected_by_parser() {
        assert!(cli()
            .try_get_matches_from(["floorlink", "simulate", "--mode", "reports"])
            .is_err());
    }

    #[test]
    fn demo_widgets_only_fill_an_empty_dashboard() {
        let config = with_demo_widgets(FloorlinkConfig::default());
        assert_eq!(config.dashboard.widgets.len(), 3);

        let custom = FloorlinkConfig::default().with_dashboard(
            floorlink_loaders::DashboardConfig::default().with_widget("kpi", WidgetConfig::default()),
        );
        assert_eq!(with_demo_widgets(custom).dashboard.widgets.len(), 1);
    }

    #[tokio::test]
    async fn simulate_all_modes() {
        let file = fast_config();
        let options = SimulateOptions {
            modes: LoaderMode::ALL.to_vec(),
            config: Some(file.path().to_path_buf()),
            equipment: 6,
            updates: 10,
        };

        let (report, passed) = simulate(&options).await.unwrap();

        assert!(passed, "{report:#}");
        assert_eq!(report["load"].as_array().unwrap().len(), 3);
        assert_eq!(report["monitoring"]["stats"]["total"], 6);
        assert_eq!(report["monitoring"]["stats"]["updatesApplied"], 10);
        assert_eq!(report["calls"]["snapshot"], 1);
    }

    #[tokio::test]
    async fn bad_config_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nretries = \"many\"").unwrap();
        let options = SimulateOptions {
            modes: vec![LoaderMode::Mapping],
            config: Some(file.path().to_path_buf()),
            equipment: 2,
            updates: 0,
        };

        let err = simulate(&options).await.unwrap_err();
        assert!(err.to_string().contains("loading configuration"));
    }
}
