//! `babyseg-state`: inspect an experiment's configuration and checkpoints.
//!
//! Merges the given configuration files, applies `-s key:sub=value`
//! overrides, and lists the checkpoints matching the experiment name,
//! optionally filtered by epoch.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use babyseg::{log_collector, CheckpointStore, ConfigLoader, EpochFilter, ErrorKind, ResumeState};

#[derive(Parser, Debug)]
#[command(name = "babyseg-state", version, about = "List experiment checkpoints")]
struct Cli {
    /// Configuration files, merged in order
    #[arg(value_name = "CONFIG", required = true)]
    configs: Vec<PathBuf>,

    /// Override a setting, e.g. `training:resume=12`
    #[arg(short = 's', value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Skip the shipped defaults document
    #[arg(long)]
    no_defaults: bool,

    /// List only this epoch
    #[arg(long, conflicts_with_all = ["min", "max", "step"])]
    epoch: Option<u64>,

    /// Smallest epoch to list
    #[arg(long)]
    min: Option<u64>,

    /// Largest epoch to list
    #[arg(long)]
    max: Option<u64>,

    /// Minimum distance between listed epochs
    #[arg(long)]
    step: Option<u64>,

    /// Print the merged configuration before listing
    #[arg(long)]
    print_config: bool,

    /// Report how training would start
    #[arg(long)]
    plan: bool,

    /// Repeat to increase verbosity
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn filter(&self) -> EpochFilter {
        match self.epoch {
            Some(epoch) => EpochFilter::Exact(epoch),
            None if self.min.is_none() && self.max.is_none() && self.step.is_none() => {
                EpochFilter::All
            }
            None => EpochFilter::Range {
                min: self.min,
                max: self.max,
                step: self.step,
            },
        }
    }
}

fn describe(state: &ResumeState) -> String {
    match state {
        ResumeState::Fresh => "fresh start".to_string(),
        ResumeState::Initialized(path) => format!("fresh start from \"{}\"", path.display()),
        ResumeState::ResumedLatest { epoch, path } => {
            format!("resume latest epoch {} from \"{}\"", epoch, path.display())
        }
        ResumeState::ResumedAt { epoch, path } => {
            format!("resume epoch {} from \"{}\"", epoch, path.display())
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let loader = if cli.no_defaults {
        ConfigLoader::without_defaults()
    } else {
        ConfigLoader::new()
    };
    let mut config = loader.load(&cli.configs).context("loading configuration")?;
    config.apply_options(&cli.set).context("applying options")?;

    if cli.print_config {
        println!("{}", config.to_pretty_string()?);
    }

    let store = CheckpointStore::from_config(&config)?;
    if cli.plan {
        println!("{}", describe(&store.plan()?));
    }

    let filter = cli.filter();
    match store.list(filter) {
        Ok(files) => {
            for file in files {
                let epoch = store.epoch(&file)?;
                println!("{:>6}  {}", epoch, file.display());
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            println!("no checkpoints for \"{}\"", store.naming().name());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = match log_collector::init(cli.verbose, None) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = run(&cli);
    let _ = logger.wait_for_empty();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::from(1)
        }
    }
}
