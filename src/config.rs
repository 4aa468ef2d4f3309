//! Run configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Paths and switches for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// EM optic-nerve quantification workbook ("OL - <stain>" and
    /// "Axons - <stain>" sheets).
    pub em_workbook: Option<PathBuf>,

    /// EM optic-nerve + CA2 quantification workbook (same sheet layout).
    pub em_ca2_workbook: Option<PathBuf>,

    /// RNAscope quantification workbook (one sheet per probe).
    pub rnascope_workbook: Option<PathBuf>,

    /// Antibody/probe names; sheet names are derived from these.
    #[serde(default = "default_stains")]
    pub stains: Vec<String>,

    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Write tidy intermediate tables as CSV next to the plots.
    #[serde(default)]
    pub export_intermediate: bool,

    /// Seed for the diagnostic bootstrap.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of bootstrap replicates for the residual diagnostics.
    #[serde(default = "default_n_sim")]
    pub n_sim: usize,
}

fn default_stains() -> Vec<String> {
    vec!["LDHA".to_string(), "LDHB".to_string()]
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("opticgold_out")
}

fn default_seed() -> u64 {
    42
}

fn default_n_sim() -> usize {
    250
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            em_workbook: None,
            em_ca2_workbook: None,
            rnascope_workbook: None,
            stains: default_stains(),
            out_dir: default_out_dir(),
            export_intermediate: false,
            seed: default_seed(),
            n_sim: default_n_sim(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Template written by `--init-config`.
    pub fn default_toml() -> String {
        let mut config = RunConfig::default();
        config.em_workbook = Some(PathBuf::from("data/em_optic_nerve.xlsx"));
        config.em_ca2_workbook = Some(PathBuf::from("data/em_optic_nerve_ca2.xlsx"));
        config.rnascope_workbook = Some(PathBuf::from("data/rnascope.xlsx"));
        toml::to_string_pretty(&config).expect("default config serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_for_sparse_config() {
        let config: RunConfig =
            toml::from_str("em_workbook = \"a.xlsx\"\n").unwrap();
        assert_eq!(config.em_workbook.unwrap(), PathBuf::from("a.xlsx"));
        assert_eq!(config.stains, vec!["LDHA", "LDHB"]);
        assert!(!config.export_intermediate);
        assert_eq!(config.seed, 42);
        assert_eq!(config.n_sim, 250);
    }

    #[test]
    fn test_default_template_round_trips() {
        let parsed: RunConfig = toml::from_str(&RunConfig::default_toml()).unwrap();
        assert!(parsed.rnascope_workbook.is_some());
    }
}
