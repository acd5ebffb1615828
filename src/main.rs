//! `babyseg`: brain segmentation across the first years of life.
//!
//! Resolves configuration, device, model weights and output geometry for the
//! given images and prints the resulting segmentation plan as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser};

use babyseg::config::paths::{glob_files, home_dir, HOME_VAR};
use babyseg::{log_collector, ConfigLoader, ModelInit, SegmentRequest, SegmentationPlan};

/// BabySeg integrates image volumes of variable size, resolution, and
/// contrast in any order, provided their header geometries are correct and
/// they are aligned in world space.
#[derive(Parser, Debug)]
#[command(name = "babyseg", version, after_help = "Website: https://w3id.org/babyseg")]
struct Cli {
    /// Input images
    #[arg(value_name = "IMAGE", required = true)]
    images: Vec<PathBuf>,

    /// Model JSON file [default: last config/babyseg.*.json]
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Model weights: `latest`, an epoch, or a path [default: last checkpoints/babyseg.*]
    #[arg(short = 'k')]
    checkpoint: Option<String>,

    /// Enable GPU acceleration
    #[arg(short = 'g')]
    gpu: bool,

    /// Output label map
    #[arg(short = 'o')]
    out_seg: Option<PathBuf>,

    /// Output probability maps
    #[arg(short = 'p')]
    out_prob: Option<PathBuf>,

    /// Output conformed lead image
    #[arg(short = 'l')]
    out_lead: Option<PathBuf>,

    /// CPU threads (default: 1/core)
    #[arg(short = 'j')]
    threads: Option<usize>,

    /// Extent of the cropped lead image, e.g. 192,192,160
    #[arg(long, value_delimiter = ',')]
    shape: Option<Vec<u64>>,

    /// Repeat to increase verbosity
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Append log lines to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Last file in `folder` matching `pattern`, in sorted order.
fn last_match(folder: &Path, pattern: &str) -> Result<PathBuf> {
    glob_files(folder, pattern)
        .with_context(|| format!("listing \"{}\"", folder.display()))?
        .pop()
        .with_context(|| format!("no files matching \"{}\" in \"{}\"", pattern, folder.display()))
}

/// `-k` value as a weight selector. Parsing cannot fail: anything that is
/// not `latest` or an epoch is a path.
fn checkpoint_selector(selector: &str) -> ModelInit {
    match selector.parse::<ModelInit>() {
        Ok(init) => init,
        Err(never) => match never {},
    }
}

fn run(cli: Cli, home: &Path) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => last_match(&home.join("config"), "babyseg.*.json")?,
    };
    let checkpoint = match cli.checkpoint {
        Some(selector) => checkpoint_selector(&selector),
        None => ModelInit::Path(last_match(&home.join("checkpoints"), "babyseg.*")?),
    };

    let request = SegmentRequest {
        images: cli.images,
        checkpoint,
        out_seg: cli.out_seg,
        out_prob: cli.out_prob,
        out_lead: cli.out_lead,
        device: if cli.gpu { "cuda" } else { "cpu" }.to_string(),
        threads: cli.threads,
        lead_shape: cli.shape,
    };

    let config = ConfigLoader::new()
        .load(&[&config_path])
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let plan = SegmentationPlan::resolve(&config, &request)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn main() -> ExitCode {
    let Some(home) = home_dir() else {
        eprintln!("ERROR: no environment variable {}", HOME_VAR);
        return ExitCode::from(1);
    };

    if std::env::args_os().len() <= 1 {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    if cli.out_seg.is_none() && cli.out_prob.is_none() && cli.out_lead.is_none() {
        eprintln!("{}", Cli::command().render_usage());
        eprintln!("ERROR: no output file paths specified");
        return ExitCode::from(2);
    }

    let logger = match log_collector::init(cli.verbose, cli.log_file.as_deref()) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = run(cli, &home);
    let _ = logger.wait_for_empty();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::from(1)
        }
    }
}
