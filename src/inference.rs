//! Estimated marginal means and pairwise contrasts.
//!
//! Means are computed over a reference grid: the factor of interest crossed
//! with every level of the other factors, continuous covariates held at
//! their observed means. Contrasts are formed on the link scale and
//! back-transformed for reporting under a log link; p-values are
//! Bonferroni-adjusted across the pairwise set.

use adjustp::{adjust, Procedure};
use itertools::Itertools;
use nalgebra::DVector;

use crate::design::{AnalysisTable, Term};
use crate::engine::{normal_two_sided_p, FittedModel};
use crate::error::{Error, Result};
use crate::math::arithmetic_mean;

#[derive(Debug, Clone)]
pub struct EmmRow {
    pub level: String,
    /// Marginal mean on the link scale.
    pub emmean: f64,
    pub std_error: f64,
    /// Marginal mean back-transformed to the response scale (equals
    /// `emmean` under the identity link).
    pub response: f64,
}

#[derive(Debug, Clone)]
pub struct ContrastRow {
    pub contrast: String,
    /// Difference on the link scale (a log ratio under a log link).
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    pub p_value: f64,
    pub p_adjusted: f64,
}

#[derive(Debug, Clone)]
pub struct EmmTable {
    pub factor: String,
    pub rows: Vec<EmmRow>,
    pub contrasts: Vec<ContrastRow>,
    pub log_link: bool,
}

/// Estimated marginal means of `factor` with all pairwise contrasts.
pub fn marginal_means(
    model: &FittedModel,
    table: &AnalysisTable,
    factor: &str,
) -> Result<EmmTable> {
    let levels = model
        .design
        .factor_levels
        .get(factor)
        .cloned()
        .ok_or_else(|| Error::UnknownVariable {
            column: factor.to_string(),
        })?;

    // covariate means and the other factors' level sets
    let mut covariates: Vec<(String, f64)> = Vec::new();
    let mut other_factors: Vec<(String, Vec<String>)> = Vec::new();
    for term in &model.formula.fixed {
        match term {
            Term::Covariate(c) => {
                if !covariates.iter().any(|(n, _)| n == c) {
                    covariates.push((c.clone(), arithmetic_mean(table.numeric(c)?)));
                }
            }
            Term::Factor(f) | Term::Interaction(_, f) => {
                if f != factor && !other_factors.iter().any(|(n, _)| n == f) {
                    let lv = model
                        .design
                        .factor_levels
                        .get(f)
                        .cloned()
                        .unwrap_or_default();
                    other_factors.push((f.clone(), lv));
                }
            }
        }
    }

    let mut rows = Vec::new();
    let mut means: Vec<(String, DVector<f64>)> = Vec::new();
    for level in &levels {
        let grid = reference_grid(level, factor, &covariates, &other_factors);
        let x = model.design_rows(&grid)?;
        // average the design rows: the EMM is a linear function of beta
        let c = x.row_mean().transpose();
        let emmean = c.dot(&model.beta);
        let variance = (c.transpose() * &model.cov_beta * &c)[(0, 0)];
        let std_error = variance.max(0.0).sqrt();
        rows.push(EmmRow {
            level: level.clone(),
            emmean,
            std_error,
            response: if model.family.log_link() {
                emmean.exp()
            } else {
                emmean
            },
        });
        means.push((level.clone(), c));
    }

    let mut contrasts = Vec::new();
    for (a, b) in means.iter().tuple_combinations() {
        let c = &a.1 - &b.1;
        let estimate = c.dot(&model.beta);
        let variance = (c.transpose() * &model.cov_beta * &c)[(0, 0)];
        let std_error = variance.max(0.0).sqrt();
        let z_value = if std_error > 0.0 {
            estimate / std_error
        } else {
            f64::NAN
        };
        contrasts.push(ContrastRow {
            contrast: format!("{} - {}", a.0, b.0),
            estimate,
            std_error,
            z_value,
            p_value: normal_two_sided_p(z_value),
            p_adjusted: f64::NAN,
        });
    }
    let raw: Vec<f64> = contrasts.iter().map(|c| c.p_value).collect();
    for (row, adjusted) in contrasts
        .iter_mut()
        .zip(adjust(&raw, Procedure::Bonferroni))
    {
        row.p_adjusted = adjusted;
    }

    Ok(EmmTable {
        factor: factor.to_string(),
        rows,
        contrasts,
        log_link: model.family.log_link(),
    })
}

fn reference_grid(
    level: &str,
    factor: &str,
    covariates: &[(String, f64)],
    other_factors: &[(String, Vec<String>)],
) -> AnalysisTable {
    let combos: Vec<Vec<&String>> = if other_factors.is_empty() {
        vec![Vec::new()]
    } else {
        other_factors
            .iter()
            .map(|(_, lv)| lv.iter())
            .multi_cartesian_product()
            .collect()
    };

    let n = combos.len();
    let mut grid = AnalysisTable::new();
    grid.push_factor(factor, vec![level.to_string(); n]);
    for (i, (name, _)) in other_factors.iter().enumerate() {
        grid.push_factor(name, combos.iter().map(|c| c[i].clone()).collect());
    }
    for (name, mean) in covariates {
        grid.push_numeric(name, vec![*mean; n]);
    }
    grid
}

impl EmmTable {
    /// Retrieve a contrast by its `"a - b"` label.
    pub fn contrast(&self, label: &str) -> Option<&ContrastRow> {
        self.contrasts.iter().find(|c| c.contrast == label)
    }

    pub fn pprint(&self) {
        println!("{}\temmean\tSE\tresponse", self.factor);
        for row in &self.rows {
            println!(
                "{}\t{:.6}\t{:.6}\t{:.6}",
                row.level, row.emmean, row.std_error, row.response
            );
        }
        println!("contrast\testimate\tSE\tz\tp\tp_adj");
        for c in &self.contrasts {
            println!(
                "{}\t{:.6}\t{:.6}\t{:.3}\t{:.4e}\t{:.4e}",
                c.contrast, c.estimate, c.std_error, c.z_value, c.p_value, c.p_adjusted
            );
        }
        if self.log_link {
            println!("(means back-transformed from the log scale; contrasts are log ratios)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Formula;
    use crate::engine::{fit, Family};
    use approx::assert_relative_eq;

    fn density_table() -> AnalysisTable {
        let mut t = AnalysisTable::new();
        t.push_numeric("Density", vec![2.0, 2.2, 1.8, 1.0, 1.1, 0.9]);
        t.push_factor(
            "Genotype",
            vec!["ctr", "ctr", "ctr", "mut", "mut", "mut"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        t
    }

    #[test]
    fn test_emm_matches_group_means_for_identity_link() {
        let t = density_table();
        let f = Formula::new("Density").factor("Genotype");
        let model = fit(&f, &t, Family::Gaussian).unwrap();
        let emm = marginal_means(&model, &t, "Genotype").unwrap();
        assert_eq!(emm.rows.len(), 2);
        assert_relative_eq!(emm.rows[0].response, 2.0, epsilon = 1e-8);
        assert_relative_eq!(emm.rows[1].response, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_pairwise_contrast_direction_and_adjustment() {
        let t = density_table();
        let f = Formula::new("Density").factor("Genotype");
        let model = fit(&f, &t, Family::Gaussian).unwrap();
        let emm = marginal_means(&model, &t, "Genotype").unwrap();
        let c = emm.contrast("ctr - mut").unwrap();
        assert_relative_eq!(c.estimate, 1.0, epsilon = 1e-8);
        assert!(c.p_value > 0.0 && c.p_value < 0.05);
        // a single contrast is unchanged by Bonferroni
        assert_relative_eq!(c.p_adjusted, c.p_value, epsilon = 1e-12);
    }

    #[test]
    fn test_log_link_means_back_transformed() {
        let mut t = AnalysisTable::new();
        t.push_numeric("Count", vec![2.0, 2.0, 2.0, 8.0, 8.0, 8.0]);
        t.push_factor(
            "Genotype",
            vec!["ctr", "ctr", "ctr", "mut", "mut", "mut"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        let f = Formula::new("Count").factor("Genotype");
        let model = fit(&f, &t, Family::Poisson).unwrap();
        let emm = marginal_means(&model, &t, "Genotype").unwrap();
        assert_relative_eq!(emm.rows[0].response, 2.0, epsilon = 1e-3);
        assert_relative_eq!(emm.rows[1].response, 8.0, epsilon = 1e-3);
        // contrast is a log ratio
        let c = emm.contrast("ctr - mut").unwrap();
        assert_relative_eq!(c.estimate, (2.0f64 / 8.0).ln(), epsilon = 1e-3);
    }

    #[test]
    fn test_covariate_held_at_mean() {
        let mut t = AnalysisTable::new();
        // y = x + 1 for ctr, y = x for mut; x means differ per group
        t.push_numeric("y", vec![2.0, 3.0, 4.0, 3.0, 4.0, 5.0]);
        t.push_numeric("x", vec![1.0, 2.0, 3.0, 3.0, 4.0, 5.0]);
        t.push_factor(
            "Genotype",
            vec!["ctr", "ctr", "ctr", "mut", "mut", "mut"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        let f = Formula::new("y").covariate("x").factor("Genotype");
        let model = fit(&f, &t, Family::Gaussian).unwrap();
        let emm = marginal_means(&model, &t, "Genotype").unwrap();
        // at the shared mean x = 3: ctr 4, mut 3
        assert_relative_eq!(emm.rows[0].response, 4.0, epsilon = 1e-6);
        assert_relative_eq!(emm.rows[1].response, 3.0, epsilon = 1e-6);
    }
}
