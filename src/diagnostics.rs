//! Simulation-based residual checks for fitted models.
//!
//! A parametric bootstrap draws replicate datasets from the fitted family,
//! conditional on the estimated group intercepts. Each observation's scaled
//! residual is its mid-rank among the simulated values, uniform on (0, 1)
//! when the family matches the data. Two tests are derived: a dispersion
//! test (observed vs simulated Pearson statistic) and a Kolmogorov-Smirnov
//! uniformity test. Both only report; neither alters the pipeline.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use rayon::prelude::*;

use crate::engine::{Family, FittedModel};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ScaledResiduals {
    pub values: Vec<f64>,
    observed_pearson: f64,
    simulated_pearson: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct DispersionTest {
    /// Observed Pearson statistic over the simulated average.
    pub ratio: f64,
    pub p_value: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct UniformityTest {
    pub statistic: f64,
    pub p_value: f64,
    pub flagged: bool,
}

const ALPHA: f64 = 0.05;

/// One draw from the fitted family at conditional mean `mu`.
pub(crate) fn draw(
    family: Family,
    mu: f64,
    sigma2: f64,
    theta: f64,
    rng: &mut ChaCha8Rng,
) -> f64 {
    match family {
        Family::Gaussian => Normal::new(mu, sigma2.sqrt().max(1e-12))
            .unwrap()
            .sample(rng),
        Family::Poisson => Poisson::new(mu.max(1e-12)).unwrap().sample(rng),
        Family::NegativeBinomial => {
            // gamma-Poisson mixture with shape theta and mean mu
            let rate = Gamma::new(theta, mu.max(1e-12) / theta).unwrap().sample(rng);
            Poisson::new(rate.max(1e-12)).unwrap().sample(rng)
        }
    }
}

fn pearson_statistic(observed: &[f64], mu: &[f64], family: Family, sigma2: f64, theta: f64) -> f64 {
    observed
        .iter()
        .zip(mu.iter())
        .map(|(y, m)| (y - m).powi(2) / family.variance(*m, sigma2, theta).max(1e-12))
        .sum()
}

/// Parametric bootstrap of scaled residuals.
///
/// Simulations are seeded per replicate index, so the rayon scheduling
/// never changes the result.
pub fn simulate_residuals(model: &FittedModel, n_sim: usize, seed: u64) -> Result<ScaledResiduals> {
    let mu = model.fitted().to_vec();
    let observed = model.response().to_vec();
    let family = model.family();
    let sigma2 = model.sigma2();
    let theta = model.theta().unwrap_or(f64::INFINITY.min(1e8));

    let simulations: Vec<Vec<f64>> = (0..n_sim)
        .into_par_iter()
        .map(|s| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(s as u64));
            mu.iter()
                .map(|m| draw(family, *m, sigma2, theta, &mut rng))
                .collect()
        })
        .collect();

    let values: Vec<f64> = observed
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let mut less = 0usize;
            let mut equal = 0usize;
            for sim in &simulations {
                if sim[i] < *y {
                    less += 1;
                } else if sim[i] == *y {
                    equal += 1;
                }
            }
            (less as f64 + 0.5 * (equal as f64 + 1.0)) / (n_sim as f64 + 1.0)
        })
        .collect();

    let simulated_pearson: Vec<f64> = simulations
        .iter()
        .map(|sim| pearson_statistic(sim, &mu, family, sigma2, theta))
        .collect();

    Ok(ScaledResiduals {
        values,
        observed_pearson: pearson_statistic(&observed, &mu, family, sigma2, theta),
        simulated_pearson,
    })
}

impl ScaledResiduals {
    /// Two-sided bootstrap test of over/under-dispersion.
    pub fn dispersion_test(&self) -> DispersionTest {
        let n_sim = self.simulated_pearson.len();
        let mean_sim =
            self.simulated_pearson.iter().sum::<f64>() / (n_sim as f64).max(1.0);
        let greater = self
            .simulated_pearson
            .iter()
            .filter(|s| **s >= self.observed_pearson)
            .count();
        let lesser = self
            .simulated_pearson
            .iter()
            .filter(|s| **s <= self.observed_pearson)
            .count();
        let tail = greater.min(lesser);
        let p_value =
            (2.0 * (tail as f64 + 1.0) / (n_sim as f64 + 1.0)).min(1.0);
        DispersionTest {
            ratio: self.observed_pearson / mean_sim.max(1e-300),
            p_value,
            flagged: p_value < ALPHA,
        }
    }

    /// One-sample Kolmogorov-Smirnov test against U(0, 1).
    pub fn uniformity_test(&self) -> UniformityTest {
        let mut sorted = self.values.clone();
        sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len() as f64;
        let mut d: f64 = 0.0;
        for (i, v) in sorted.iter().enumerate() {
            let upper = (i as f64 + 1.0) / n - v;
            let lower = v - i as f64 / n;
            d = d.max(upper.max(lower));
        }
        let p_value = ks_p_value(d, sorted.len());
        UniformityTest {
            statistic: d,
            p_value,
            flagged: p_value < ALPHA,
        }
    }

    /// Overall family-misfit flag: either test rejecting marks the fit.
    ///
    /// The dispersion test alone cannot expose a count family mis-specified
    /// as Gaussian, because the free residual variance absorbs the excess;
    /// the shape of the residual distribution still betrays it through the
    /// uniformity test, so the reported flag combines both.
    pub fn family_misfit(&self) -> bool {
        self.dispersion_test().flagged || self.uniformity_test().flagged
    }

    pub fn pprint(&self) {
        let dispersion = self.dispersion_test();
        let uniformity = self.uniformity_test();
        println!(
            "dispersion ratio {:.3} (p = {:.4}{})",
            dispersion.ratio,
            dispersion.p_value,
            if dispersion.flagged { ", FLAGGED" } else { "" }
        );
        println!(
            "uniformity KS D {:.4} (p = {:.4}{})",
            uniformity.statistic,
            uniformity.p_value,
            if uniformity.flagged { ", FLAGGED" } else { "" }
        );
        if dispersion.flagged || uniformity.flagged {
            println!("family misfit: FLAGGED");
        }
    }
}

/// Asymptotic Kolmogorov distribution tail with the small-sample correction.
fn ks_p_value(d: f64, n: usize) -> f64 {
    if n == 0 || d <= 0.0 {
        return 1.0;
    }
    let sqrt_n = (n as f64).sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d;
    let mut p = 0.0;
    for k in 1..=100 {
        let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
        p += sign * (-2.0 * (k as f64 * lambda).powi(2)).exp();
    }
    (2.0 * p).clamp(0.0, 1.0)
}
