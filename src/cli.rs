//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Immunogold EM and RNAscope quantification pipeline for mouse optic nerve.
///
/// Reads quantification workbooks listed in the TOML config, reshapes them
/// into tidy tables, fits mixed-effects models of staining density, g-ratio
/// and transcript counts, and writes summary tables and plots.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "opticgold.toml", value_name = "FILE")]
    pub config: PathBuf,

    /// Output directory for plots and tables (overrides the config file)
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Write tidy intermediate tables as CSV next to the plots
    #[arg(long)]
    pub export_intermediate: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Generate a default opticgold.toml configuration file and exit
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Log level implied by the verbosity flags.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            config: PathBuf::from("opticgold.toml"),
            out_dir: None,
            export_intermediate: false,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
