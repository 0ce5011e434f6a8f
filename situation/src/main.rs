//! situation: host-resident discovery agent. Probes the machine it runs on
//! and its networks, reconciles what it finds in a local store, and ships a
//! payload to the configured backends.
#![recursion_limit = "256"]

mod agent;
mod backends;
mod run;
mod schema;
mod task;
mod update;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use situation_core::{Config, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "situation", version, about = "autonomous network discovery agent")]
struct Cli {
    /// Path to a YAML config file (defaults to ./situation.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Verbosity, from 0 (silent) to 5 (debug)
    #[arg(long, global = true, default_value_t = 3)]
    log_level: u8,
    /// Override a single option, as module.key=value
    #[arg(short = 'o', long = "option", global = true, value_name = "KEY=VALUE")]
    options: Vec<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Perform scans and export the results (the default)
    Run(RunArgs),
    /// Print the agent version
    Version,
    /// Print the identifier of this agent
    Id,
    /// Print the JSON schema of the exported payload
    Schema,
    /// Print the default configuration as YAML
    Defaults,
    /// Replace this binary with the latest released one
    Update(update::UpdateArgs),
    /// Install (or remove) a recurring scan
    Task(task::TaskArgs),
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Number of scans, 0 means forever
    #[arg(long)]
    scans: Option<u64>,
    /// Seconds between two scans
    #[arg(long)]
    period: Option<u64>,
    /// Store path, or :memory: for a dry run
    #[arg(long)]
    store: Option<String>,
    /// Abort the scan on the first module failure
    #[arg(long)]
    fail_fast: bool,
    /// Disable a module by name (repeatable)
    #[arg(long, value_name = "MODULE")]
    disable: Vec<String>,
}

fn init_logging(level: u8) {
    let max = match level {
        0..=2 => tracing::Level::ERROR,
        3 => tracing::Level::WARN,
        4 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(max)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the config from defaults, the YAML file, the environment and the
/// -o overrides, in increasing precedence.
fn build_config(cli: &Cli, scheduler: &Scheduler) -> Result<Config> {
    let mut config = Config::new();
    run::bind(&mut config);
    scheduler.bind_all(&mut config);

    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = PathBuf::from("situation.yaml");
            default.exists().then_some(default)
        }
    };
    if let Some(path) = path {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        config
            .load_yaml(&text)
            .with_context(|| format!("cannot parse {}", path.display()))?;
    }

    for option in &cli.options {
        let Some((key, value)) = option.split_once('=') else {
            anyhow::bail!("malformed option {option:?}, expected KEY=VALUE");
        };
        config.set_flag(key, value);
    }
    Ok(config)
}

async fn run_command(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut scheduler = Scheduler::new();
    for module in run::registry() {
        scheduler.register(module);
    }
    for name in &args.disable {
        scheduler.disable(name);
    }
    scheduler.fail_fast(args.fail_fast);

    let mut config = build_config(cli, &scheduler)?;
    if let Some(scans) = args.scans {
        config.set_flag("scans", &scans.to_string());
    }
    if let Some(period) = args.period {
        config.set_flag("period", &period.to_string());
    }
    if let Some(store) = &args.store {
        config.set_flag("store", store);
    }

    run::run_loop(scheduler, config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match &cli.command {
        None => run_command(&cli, &RunArgs::default()).await,
        Some(Commands::Run(args)) => run_command(&cli, args).await,
        Some(Commands::Version) => {
            println!("{}", situation_core::version());
            Ok(())
        }
        Some(Commands::Id) => {
            println!("{}", agent::agent());
            Ok(())
        }
        Some(Commands::Schema) => {
            println!("{}", serde_json::to_string_pretty(&schema::payload_schema())?);
            Ok(())
        }
        Some(Commands::Defaults) => {
            let mut scheduler = Scheduler::new();
            for module in run::registry() {
                scheduler.register(module);
            }
            let config = build_config(&cli, &scheduler)?;
            print!("{}", config.defaults_yaml());
            Ok(())
        }
        Some(Commands::Update(args)) => update::update(args).await,
        Some(Commands::Task(args)) => task::task(args),
    }
}
