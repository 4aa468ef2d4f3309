//! Hierarchical averaging: measurement -> image -> animal -> genotype.
//!
//! Output columns follow the statistic-prefix naming contract
//! (`mean_<metric>`, `StDev_<metric>`, `SEM_<metric>`); nested aggregation
//! would otherwise stack prefixes (`mean_mean_Area`), so prefixes introduced
//! by an inner level are collapsed before the outer statistic is attached.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::math::{arithmetic_mean, sample_std_dev, sem};
use crate::schema::{Genotype, Structure};
use crate::tidy::MeasurementRow;

/// Metric columns keyed by their contract name.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub animal: String,
    pub image: String,
    pub genotype: Genotype,
    pub structure: Structure,
    pub metrics: Metrics,
    /// Measurement rows contributing to this image (1 for oligodendrocytes,
    /// one cell per image).
    pub n_measurements: usize,
}

#[derive(Debug, Clone)]
pub struct AnimalSummary {
    pub animal: String,
    pub genotype: Genotype,
    pub structure: Structure,
    pub metrics: Metrics,
    pub n_images: usize,
}

#[derive(Debug, Clone)]
pub struct GenotypeSummary {
    pub genotype: Genotype,
    pub structure: Structure,
    pub metrics: Metrics,
    pub n_animals: usize,
    pub n_images: usize,
}

/// Collapse a double statistic prefix introduced by nested aggregation:
/// `mean_mean_Area` -> `mean_Area`, `StDev_mean_Area` -> `StDev_Area`.
pub fn collapse_prefix(name: &str) -> String {
    for stat in ["mean_", "StDev_", "SEM_"] {
        if let Some(rest) = name.strip_prefix(stat) {
            if let Some(inner) = rest.strip_prefix("mean_") {
                return format!("{stat}{inner}");
            }
        }
    }
    name.to_string()
}

fn base_metrics(rows: &[&MeasurementRow]) -> Vec<(String, Vec<f64>)> {
    vec![
        (
            "Area".to_string(),
            rows.iter().map(|r| r.area_um2).collect(),
        ),
        ("Gold".to_string(), rows.iter().map(|r| r.gold).collect()),
        (
            "StainingDensity".to_string(),
            rows.iter().map(|r| r.staining_density()).collect(),
        ),
    ]
}

/// Measurement -> image: arithmetic mean per (image, structure, metric).
/// No dispersion is reported at this level.
pub fn by_image(rows: &[MeasurementRow]) -> Vec<ImageSummary> {
    rows.iter()
        .map(|r| ((r.animal.clone(), r.image.clone(), r.structure), r))
        .into_group_map()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|((animal, image, structure), group)| {
            let genotype = group[0].genotype;
            let mut metrics = Metrics::new();
            for (name, values) in base_metrics(&group) {
                metrics.insert(format!("mean_{name}"), arithmetic_mean(&values));
            }
            ImageSummary {
                animal,
                image,
                genotype,
                structure,
                metrics,
                n_measurements: group.len(),
            }
        })
        .collect()
}

/// Fold one summary level into the next: mean over the inner `mean_` columns
/// plus StDev/SEM where at least two contributors exist.
fn fold_metrics(groups: &[&Metrics]) -> Metrics {
    let mut out = Metrics::new();
    let names: Vec<String> = groups
        .iter()
        .flat_map(|m| m.keys())
        .filter(|k| k.starts_with("mean_"))
        .unique()
        .cloned()
        .collect();
    for name in names {
        let values: Vec<f64> = groups.iter().filter_map(|m| m.get(&name)).copied().collect();
        if values.is_empty() {
            continue;
        }
        out.insert(
            collapse_prefix(&format!("mean_{name}")),
            arithmetic_mean(&values),
        );
        if let Some(sd) = sample_std_dev(&values) {
            out.insert(collapse_prefix(&format!("StDev_{name}")), sd);
        }
        if let Some(se) = sem(&values) {
            out.insert(collapse_prefix(&format!("SEM_{name}")), se);
        }
    }
    out
}

/// Image -> animal: mean/StDev/SEM of per-image means, per structure.
pub fn by_animal(images: &[ImageSummary]) -> Vec<AnimalSummary> {
    images
        .iter()
        .map(|s| ((s.animal.clone(), s.structure), s))
        .into_group_map()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|((animal, structure), group)| {
            let genotype = group[0].genotype;
            let metrics = fold_metrics(&group.iter().map(|s| &s.metrics).collect::<Vec<_>>());
            AnimalSummary {
                animal,
                genotype,
                structure,
                metrics,
                n_images: group.len(),
            }
        })
        .collect()
}

/// Animal -> genotype: mean/StDev/SEM of per-animal means, per structure.
pub fn by_genotype(animals: &[AnimalSummary]) -> Vec<GenotypeSummary> {
    animals
        .iter()
        .map(|s| ((s.genotype, s.structure), s))
        .into_group_map()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|((genotype, structure), group)| {
            let metrics = fold_metrics(&group.iter().map(|s| &s.metrics).collect::<Vec<_>>());
            GenotypeSummary {
                genotype,
                structure,
                metrics,
                n_animals: group.len(),
                n_images: group.iter().map(|s| s.n_images).sum(),
            }
        })
        .collect()
}

fn metric_names(tables: &[&Metrics]) -> Vec<String> {
    tables
        .iter()
        .flat_map(|m| m.keys())
        .unique()
        .cloned()
        .collect()
}

pub fn pprint_animals(animals: &[AnimalSummary]) {
    let names = metric_names(&animals.iter().map(|s| &s.metrics).collect::<Vec<_>>());
    println!("Animal\tGenotype\tType\tn_images\t{}", names.join("\t"));
    for s in animals {
        let cells: Vec<String> = names
            .iter()
            .map(|n| s.metrics.get(n).map_or(String::new(), |v| format!("{v:.6}")))
            .collect();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            s.animal,
            s.genotype,
            s.structure,
            s.n_images,
            cells.join("\t")
        );
    }
}

pub fn pprint_genotypes(genotypes: &[GenotypeSummary]) {
    let names = metric_names(&genotypes.iter().map(|s| &s.metrics).collect::<Vec<_>>());
    println!(
        "Genotype\tType\tn_animals\tn_images\t{}",
        names.join("\t")
    );
    for s in genotypes {
        let cells: Vec<String> = names
            .iter()
            .map(|n| s.metrics.get(n).map_or(String::new(), |v| format!("{v:.6}")))
            .collect();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            s.genotype,
            s.structure,
            s.n_animals,
            s.n_images,
            cells.join("\t")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn measurement(animal: &str, image: &str, area: f64, gold: f64) -> MeasurementRow {
        MeasurementRow::new(
            animal.into(),
            image.into(),
            Genotype::Ctr,
            Structure::Axon,
            area,
            gold,
        )
    }

    #[test]
    fn test_collapse_prefix() {
        assert_eq!(collapse_prefix("mean_mean_Area"), "mean_Area");
        assert_eq!(collapse_prefix("StDev_mean_Area"), "StDev_Area");
        assert_eq!(collapse_prefix("SEM_mean_Gold"), "SEM_Gold");
        assert_eq!(collapse_prefix("mean_Area"), "mean_Area");
    }

    #[test]
    fn test_image_level_mean() {
        let rows = vec![
            measurement("m1", "i1", 1.0, 2.0),
            measurement("m1", "i1", 3.0, 4.0),
        ];
        let images = by_image(&rows);
        assert_eq!(images.len(), 1);
        assert_relative_eq!(images[0].metrics["mean_Area"], 2.0);
        assert_relative_eq!(images[0].metrics["mean_Gold"], 3.0);
        assert_eq!(images[0].n_measurements, 2);
        // no dispersion reported at image level
        assert!(!images[0].metrics.contains_key("StDev_Area"));
    }

    #[test]
    fn test_animal_level_roundtrip() {
        // images with per-image AxonArea means 1, 2, 3
        let rows = vec![
            measurement("m1", "i1", 1.0, 1.0),
            measurement("m1", "i2", 2.0, 1.0),
            measurement("m1", "i3", 3.0, 1.0),
        ];
        let animals = by_animal(&by_image(&rows));
        assert_eq!(animals.len(), 1);
        let m = &animals[0].metrics;
        assert_relative_eq!(m["mean_Area"], 2.0);
        assert_relative_eq!(m["StDev_Area"], 1.0);
        assert_relative_eq!(m["SEM_Area"], 1.0 / 3f64.sqrt());
        assert_eq!(animals[0].n_images, 3);
    }

    #[test]
    fn test_no_dispersion_for_single_image() {
        let rows = vec![measurement("m1", "i1", 1.0, 1.0)];
        let animals = by_animal(&by_image(&rows));
        assert!(animals[0].metrics.contains_key("mean_Area"));
        assert!(!animals[0].metrics.contains_key("StDev_Area"));
    }

    #[test]
    fn test_genotype_level_counts() {
        let mut rows = vec![
            measurement("m1", "i1", 1.0, 1.0),
            measurement("m1", "i2", 2.0, 1.0),
            measurement("m2", "i3", 3.0, 1.0),
            measurement("m2", "i4", 5.0, 1.0),
        ];
        let mut mut_row = measurement("m3", "i5", 10.0, 1.0);
        mut_row.genotype = Genotype::Mut;
        rows.push(mut_row);

        let genotypes = by_genotype(&by_animal(&by_image(&rows)));
        assert_eq!(genotypes.len(), 2);
        let ctr = genotypes.iter().find(|g| g.genotype == Genotype::Ctr).unwrap();
        assert_eq!(ctr.n_animals, 2);
        assert_eq!(ctr.n_images, 4);
        // animal means 1.5 and 4.0
        assert_relative_eq!(ctr.metrics["mean_Area"], 2.75);
    }
}
