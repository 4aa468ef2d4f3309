//! opticgold: mixed-model analysis of immunogold EM and RNAscope data
//!
//! This library quantifies metabolic enzyme expression in mouse optic nerve
//! from two assay types: immunogold electron microscopy (gold particles per
//! structural region) and RNAscope in-situ hybridization (transcript puncta
//! per cell), comparing conditional-knockout animals against littermate
//! controls.
//!
//! The main components of this library are:
//! - `sheet`: Excel workbook ingestion into typed cell grids
//! - `tidy`: wide-to-long reshaping with per-stage drop auditing
//! - `summary`: image -> animal -> genotype summary hierarchy
//! - `engine`: Gaussian and count-family mixed-model fitting
//! - `inference`: estimated marginal means and pairwise contrasts
//! - `diagnostics`: simulation-based residual checks
//! - `analysis`: the concrete analysis blocks wired end to end

pub mod analysis;
pub mod cli;
pub mod config;
pub mod design;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod inference;
mod math;
pub mod plot;
pub mod schema;
pub mod sheet;
pub mod summary;
pub mod tidy;

pub use config::RunConfig;
pub use design::{AnalysisTable, Formula};
pub use engine::{fit, Family, FittedModel};
pub use error::{Error, Result};
pub use inference::{marginal_means, EmmTable};
