//! Model-ready tables, formula terms and design-matrix construction.
//!
//! Factors are treatment-coded against their first observed level, the way
//! the downstream Wald tables expect; the level ordering captured at fit
//! time is reused verbatim when building prediction grids so coefficients
//! and new design rows always line up.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use itertools::Itertools;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// A column-oriented table feeding the model fitter. Complete cases only:
/// the shaper has already dropped rows with missing values.
#[derive(Debug, Clone, Default)]
pub struct AnalysisTable {
    numeric: BTreeMap<String, Vec<f64>>,
    factors: BTreeMap<String, Vec<String>>,
    n_rows: usize,
}

impl AnalysisTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn push_numeric(&mut self, name: &str, values: Vec<f64>) -> &mut Self {
        self.n_rows = self.n_rows.max(values.len());
        self.numeric.insert(name.to_string(), values);
        self
    }

    pub fn push_factor(&mut self, name: &str, values: Vec<String>) -> &mut Self {
        self.n_rows = self.n_rows.max(values.len());
        self.factors.insert(name.to_string(), values);
        self
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        self.numeric
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| Error::UnknownVariable {
                column: name.to_string(),
            })
    }

    pub fn factor(&self, name: &str) -> Result<&[String]> {
        self.factors
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| Error::UnknownVariable {
                column: name.to_string(),
            })
    }

    pub fn has_factor(&self, name: &str) -> bool {
        self.factors.contains_key(name)
    }

    /// Unique levels in first-seen order; the first level is the reference.
    pub fn levels(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.factor(name)?.iter().unique().cloned().collect())
    }
}

/// One fixed-effect term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Continuous covariate, one column.
    Covariate(String),
    /// Categorical factor, one dummy column per non-reference level.
    Factor(String),
    /// Covariate-by-factor interaction (`AxonDiameter * Genotype` expands to
    /// covariate + factor + this term).
    Interaction(String, String),
}

impl Term {
    pub fn label(&self) -> String {
        match self {
            Term::Covariate(c) => c.clone(),
            Term::Factor(f) => f.clone(),
            Term::Interaction(c, f) => format!("{c}:{f}"),
        }
    }
}

/// Random-intercept grouping; two columns model a nested `a:b` intercept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub columns: Vec<String>,
}

impl Grouping {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn label(&self) -> String {
        self.columns.join(":")
    }

    /// Per-row grouping level keys.
    pub fn keys(&self, table: &AnalysisTable) -> Result<Vec<String>> {
        let cols: Vec<&[String]> = self
            .columns
            .iter()
            .map(|c| table.factor(c))
            .collect::<Result<_>>()?;
        Ok((0..table.n_rows())
            .map(|i| cols.iter().map(|c| c[i].as_str()).join(":"))
            .collect())
    }
}

/// A model formula: response, fixed terms, random-intercept groupings.
#[derive(Debug, Clone)]
pub struct Formula {
    pub response: String,
    pub fixed: Vec<Term>,
    pub random: Vec<Grouping>,
}

impl Formula {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            fixed: Vec::new(),
            random: Vec::new(),
        }
    }

    pub fn covariate(mut self, name: &str) -> Self {
        self.fixed.push(Term::Covariate(name.to_string()));
        self
    }

    pub fn factor(mut self, name: &str) -> Self {
        self.fixed.push(Term::Factor(name.to_string()));
        self
    }

    /// Full covariate-by-factor crossing: main effects plus interaction.
    pub fn crossed(mut self, covariate: &str, factor: &str) -> Self {
        self.fixed.push(Term::Covariate(covariate.to_string()));
        self.fixed.push(Term::Factor(factor.to_string()));
        self.fixed
            .push(Term::Interaction(covariate.to_string(), factor.to_string()));
        self
    }

    pub fn random_intercept(mut self, columns: &[&str]) -> Self {
        self.random.push(Grouping::new(columns));
        self
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms: Vec<String> = self.fixed.iter().map(Term::label).collect();
        if terms.is_empty() {
            terms.push("1".to_string());
        }
        terms.extend(self.random.iter().map(|g| format!("(1|{})", g.label())));
        write!(f, "{} ~ {}", self.response, terms.join(" + "))
    }
}

/// Column names, per-term column spans and factor levels of a fitted design.
#[derive(Debug, Clone)]
pub struct DesignInfo {
    pub names: Vec<String>,
    pub terms: Vec<(String, Range<usize>)>,
    pub factor_levels: BTreeMap<String, Vec<String>>,
}

/// Record first-seen levels for every factor referenced by the fixed terms.
pub fn factor_levels(
    table: &AnalysisTable,
    fixed: &[Term],
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut levels = BTreeMap::new();
    for term in fixed {
        let factor = match term {
            Term::Factor(f) | Term::Interaction(_, f) => f,
            Term::Covariate(_) => continue,
        };
        if !levels.contains_key(factor) {
            levels.insert(factor.clone(), table.levels(factor)?);
        }
    }
    Ok(levels)
}

fn dummy(values: &[String], level: &str) -> DVector<f64> {
    DVector::from_iterator(
        values.len(),
        values.iter().map(|v| if v == level { 1.0 } else { 0.0 }),
    )
}

/// Build the fixed-effect design matrix for `table` against a fixed level
/// ordering (captured at fit time; also used for prediction grids).
pub fn design_matrix(
    table: &AnalysisTable,
    fixed: &[Term],
    levels: &BTreeMap<String, Vec<String>>,
) -> Result<(DMatrix<f64>, DesignInfo)> {
    let n = table.n_rows();
    let mut columns: Vec<DVector<f64>> = vec![DVector::from_element(n, 1.0)];
    let mut names = vec!["(Intercept)".to_string()];
    let mut terms = Vec::new();

    for term in fixed {
        let start = columns.len();
        match term {
            Term::Covariate(c) => {
                columns.push(DVector::from_column_slice(table.numeric(c)?));
                names.push(c.clone());
            }
            Term::Factor(f) => {
                let values = table.factor(f)?;
                let lv = levels.get(f).ok_or_else(|| Error::UnknownVariable {
                    column: f.clone(),
                })?;
                for level in lv.iter().skip(1) {
                    columns.push(dummy(values, level));
                    names.push(format!("{f}[{level}]"));
                }
            }
            Term::Interaction(c, f) => {
                let cov = table.numeric(c)?;
                let values = table.factor(f)?;
                let lv = levels.get(f).ok_or_else(|| Error::UnknownVariable {
                    column: f.clone(),
                })?;
                for level in lv.iter().skip(1) {
                    let d = dummy(values, level);
                    columns.push(DVector::from_iterator(
                        n,
                        cov.iter().zip(d.iter()).map(|(x, z)| x * z),
                    ));
                    names.push(format!("{c}:{f}[{level}]"));
                }
            }
        }
        terms.push((term.label(), start..columns.len()));
    }

    let x = DMatrix::from_columns(&columns);
    Ok((
        x,
        DesignInfo {
            names,
            terms,
            factor_levels: levels.clone(),
        },
    ))
}

/// Indicator matrix Z (n x q) for a random-intercept grouping, with the
/// level labels in column order.
pub fn random_design(
    table: &AnalysisTable,
    grouping: &Grouping,
) -> Result<(Vec<String>, DMatrix<f64>)> {
    let keys = grouping.keys(table)?;
    let levels: Vec<String> = keys.iter().unique().cloned().collect();
    let mut z = DMatrix::zeros(keys.len(), levels.len());
    for (i, key) in keys.iter().enumerate() {
        let j = levels.iter().position(|l| l == key).unwrap();
        z[(i, j)] = 1.0;
    }
    Ok((levels, z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> AnalysisTable {
        let mut t = AnalysisTable::new();
        t.push_numeric("y", vec![1.0, 2.0, 3.0, 4.0]);
        t.push_numeric("x", vec![0.5, 1.0, 1.5, 2.0]);
        t.push_factor(
            "Genotype",
            vec!["ctr".into(), "ctr".into(), "mut".into(), "mut".into()],
        );
        t.push_factor(
            "Animal",
            vec!["m1".into(), "m1".into(), "m2".into(), "m2".into()],
        );
        t
    }

    #[test]
    fn test_factor_design_treatment_coding() {
        let t = table();
        let fixed = vec![Term::Factor("Genotype".into())];
        let levels = factor_levels(&t, &fixed).unwrap();
        let (x, info) = design_matrix(&t, &fixed, &levels).unwrap();
        assert_eq!(x.ncols(), 2);
        assert_eq!(info.names, vec!["(Intercept)", "Genotype[mut]"]);
        assert_relative_eq!(x[(0, 1)], 0.0);
        assert_relative_eq!(x[(2, 1)], 1.0);
        assert_eq!(info.terms, vec![("Genotype".to_string(), 1..2)]);
    }

    #[test]
    fn test_interaction_columns() {
        let t = table();
        let f = Formula::new("y").crossed("x", "Genotype");
        let levels = factor_levels(&t, &f.fixed).unwrap();
        let (x, info) = design_matrix(&t, &f.fixed, &levels).unwrap();
        assert_eq!(
            info.names,
            vec!["(Intercept)", "x", "Genotype[mut]", "x:Genotype[mut]"]
        );
        // interaction column is x where Genotype == mut, else 0
        assert_relative_eq!(x[(1, 3)], 0.0);
        assert_relative_eq!(x[(3, 3)], 2.0);
    }

    #[test]
    fn test_random_design_indicator() {
        let t = table();
        let (levels, z) = random_design(&t, &Grouping::new(&["Animal"])).unwrap();
        assert_eq!(levels, vec!["m1", "m2"]);
        assert_relative_eq!(z[(0, 0)], 1.0);
        assert_relative_eq!(z[(3, 1)], 1.0);
        assert_relative_eq!(z[(3, 0)], 0.0);
    }

    #[test]
    fn test_formula_display() {
        let f = Formula::new("gRatio")
            .crossed("AxonDiameter", "Genotype")
            .random_intercept(&["Animal"]);
        assert_eq!(
            f.to_string(),
            "gRatio ~ AxonDiameter + Genotype + AxonDiameter:Genotype + (1|Animal)"
        );
    }

    #[test]
    fn test_nested_grouping_keys() {
        let mut t = table();
        t.push_factor(
            "Type",
            vec!["Axon".into(), "Myelin".into(), "Axon".into(), "Myelin".into()],
        );
        let g = Grouping::new(&["Animal", "Type"]);
        let keys = g.keys(&t).unwrap();
        assert_eq!(keys[0], "m1:Axon");
        assert_eq!(keys[3], "m2:Myelin");
        assert_eq!(g.label(), "Animal:Type");
    }
}
