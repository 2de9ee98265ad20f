use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use reconf_cli::{init_tracing, render_item, run_simulation, Scenario, SimulatorConfig};
use reconf_core::EngineConfig;

fn cli() -> Command {
    Command::new("reconfctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulate, render and check configuration reconfiguration scenarios")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Default log level when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a scenario against a simulated replica set")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Scenario YAML file"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.0")
                        .value_parser(value_parser!(f64))
                        .help("Probability that a single instance reload fails"),
                )
                .arg(
                    Arg::new("settle-timeout-ms")
                        .long("settle-timeout-ms")
                        .default_value("10000")
                        .value_parser(value_parser!(u64))
                        .help("How long to wait for items to settle after each step"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("render")
                .about("Print the merged files and revision of one item")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Scenario YAML file"),
                )
                .arg(
                    Arg::new("item")
                        .long("item")
                        .required(true)
                        .help("Item name"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate an engine config file (.toml, .yaml or .yml)")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    init_tracing(level, matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("render", args)) => render(args),
        Some(("check-config", args)) => check_config(args),
        _ => Ok(()),
    }
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<()> {
    let path = required::<PathBuf>(args, "scenario")?;
    let failure_rate = required::<f64>(args, "failure-rate")?;
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("--failure-rate must be between 0.0 and 1.0, got {failure_rate}");
    }
    let config = SimulatorConfig {
        seed: required::<u64>(args, "seed")?,
        failure_rate,
        settle_timeout: Duration::from_millis(required::<u64>(args, "settle-timeout-ms")?),
    };

    let scenario = Scenario::load(&path)?;
    let report = run_simulation(&scenario, &config).await?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.generate_text());
    }
    std::process::exit(if report.converged() { 0 } else { 1 });
}

fn render(args: &ArgMatches) -> anyhow::Result<()> {
    let path = required::<PathBuf>(args, "scenario")?;
    let item = required::<String>(args, "item")?;
    let scenario = Scenario::load(&path)?;
    let report = render_item(&scenario, &item)?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.generate_text());
    }
    Ok(())
}

fn check_config(args: &ArgMatches) -> anyhow::Result<()> {
    let path = required::<PathBuf>(args, "file")?;
    let config = EngineConfig::load(&path)
        .with_context(|| format!("{} is not a valid engine config", path.display()))?;
    println!("{}: ok", path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn required<T: Clone + Send + Sync + 'static>(args: &ArgMatches, id: &str) -> anyhow::Result<T> {
    args.get_one::<T>(id)
        .cloned()
        .with_context(|| format!("missing --{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_defaults() {
        let matches = cli()
            .try_get_matches_from(["reconfctl", "simulate", "--scenario", "s.yaml"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(required::<u64>(args, "seed").unwrap(), 42);
        assert!((required::<f64>(args, "failure-rate").unwrap()).abs() < f64::EPSILON);
    }

    #[test]
    fn render_requires_item() {
        assert!(cli()
            .try_get_matches_from(["reconfctl", "render", "--scenario", "s.yaml"])
            .is_err());
    }
}
