use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the quantification pipeline.
///
/// Loading and structural problems abort the affected analysis only;
/// row-level problems (missing Area/Gold cells) are dropped and audited
/// rather than raised.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open workbook {path}: {reason}")]
    Workbook { path: PathBuf, reason: String },

    #[error("workbook {path} has no sheet named {sheet:?}")]
    MissingSheet { path: PathBuf, sheet: String },

    #[error("sheet {sheet:?} is missing required column {column:?}")]
    MissingColumn { sheet: String, column: String },

    #[error("sheet {sheet:?} has no data rows")]
    EmptySheet { sheet: String },

    #[error("animal {animal:?} carries conflicting genotype labels {labels:?}")]
    MixedGenotype { animal: String, labels: Vec<String> },

    #[error("unrecognized genotype label {label:?}")]
    UnknownGenotype { label: String },

    #[error("no rows survived filtering at stage {stage:?}")]
    NoSurvivingRows { stage: String },

    #[error("column {column:?} not present in analysis table")]
    UnknownVariable { column: String },

    #[error("model fit failed after {iterations} iterations (last delta {last_delta:.3e}): {reason}")]
    ModelFit {
        reason: String,
        iterations: usize,
        last_delta: f64,
    },

    #[error("plot rendering failed: {0}")]
    Plot(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
