//! opticgold - immunogold EM and RNAscope quantification pipeline.
//!
//! Exit codes:
//!   0 - all configured analyses completed
//!   1 - configuration error or at least one analysis failed

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use opticgold::analysis::{run_em_workbook, run_rnascope_workbook};
use opticgold::cli::Args;
use opticgold::config::RunConfig;

fn main() {
    let args = Args::parse_args();

    if args.init_config {
        std::process::exit(handle_init_config());
    }

    init_logging(&args);

    match run(&args) {
        Ok(0) => std::process::exit(0),
        Ok(failures) => {
            error!(failures, "run finished with failed analyses");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn handle_init_config() -> i32 {
    let path = Path::new("opticgold.toml");
    if path.exists() {
        eprintln!("opticgold.toml already exists; remove it first or edit it in place.");
        return 1;
    }
    if let Err(e) = std::fs::write(path, RunConfig::default_toml()) {
        eprintln!("Error: failed to write opticgold.toml: {e}");
        return 1;
    }
    println!("Created opticgold.toml with default settings.");
    0
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Run every configured analysis block. Returns the number of failures.
fn run(args: &Args) -> Result<usize> {
    let mut config = RunConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    if let Some(out_dir) = &args.out_dir {
        config.out_dir = out_dir.clone();
    }
    if args.export_intermediate {
        config.export_intermediate = true;
    }
    std::fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("failed to create {}", config.out_dir.display()))?;

    info!(
        config = %args.config.display(),
        out_dir = %config.out_dir.display(),
        stains = ?config.stains,
        "starting run"
    );

    let mut failures = 0;
    if let Some(workbook) = config.em_workbook.clone() {
        failures += run_em_workbook(&config, &workbook, "on");
    }
    if let Some(workbook) = config.em_ca2_workbook.clone() {
        failures += run_em_workbook(&config, &workbook, "on_ca2");
    }
    if let Some(workbook) = config.rnascope_workbook.clone() {
        failures += run_rnascope_workbook(&config, &workbook);
    }

    info!(failures, "run complete");
    Ok(failures)
}
