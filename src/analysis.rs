//! The concrete analysis blocks.
//!
//! Each block is an explicit stage taking named inputs and returning named
//! outputs; nothing is shared mutably between analyses, so one failing
//! block never contaminates the next. Failures are logged and counted by
//! the workbook runners, and the run carries on with the remaining sheets.

use std::path::Path;

use itertools::Itertools;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::design::{AnalysisTable, Formula};
use crate::diagnostics::{simulate_residuals, ScaledResiduals};
use crate::engine::{fit, Family, FittedModel};
use crate::error::Result;
use crate::inference::{marginal_means, EmmTable};
use crate::plot::{covariate_grid, scatter_with_fit, FitCurve, PointGroup};
use crate::schema::{Genotype, AXON_MAPPING, CELL_MAPPING};
use crate::sheet::Sheet;
use crate::summary::{
    by_animal, by_genotype, by_image, pprint_animals, pprint_genotypes, AnimalSummary,
    GenotypeSummary, ImageSummary,
};
use crate::tidy::{
    fiber_rows, pivot_long, rnascope_rows, valid_fibers, write_csv, CountRow, DropAudit, FiberRow,
    MeasurementRow,
};

/// Hierarchical summaries of a tidy table.
#[derive(Debug, Clone)]
pub struct SummaryStage {
    pub images: Vec<ImageSummary>,
    pub animals: Vec<AnimalSummary>,
    pub genotypes: Vec<GenotypeSummary>,
}

pub fn summary_stage(rows: &[MeasurementRow]) -> SummaryStage {
    let images = by_image(rows);
    let animals = by_animal(&images);
    let genotypes = by_genotype(&animals);
    SummaryStage {
        images,
        animals,
        genotypes,
    }
}

/// Fitted staining-density model with its inference and diagnostics.
pub struct DensityStage {
    pub table: AnalysisTable,
    pub model: FittedModel,
    pub emm: EmmTable,
    pub residuals: ScaledResiduals,
}

fn density_table(rows: &[MeasurementRow]) -> AnalysisTable {
    let mut table = AnalysisTable::new();
    table.push_numeric(
        "StainingDensity",
        rows.iter().map(|r| r.staining_density()).collect(),
    );
    table.push_factor("Genotype", rows.iter().map(|r| r.genotype.to_string()).collect());
    table.push_factor("Type", rows.iter().map(|r| r.structure.to_string()).collect());
    table.push_factor("Animal", rows.iter().map(|r| r.animal.clone()).collect());
    table
}

/// Gaussian mixed model of staining density on genotype, with per-animal
/// (and, when several structures are present, per animal-by-type) random
/// intercepts.
pub fn density_stage(rows: &[MeasurementRow], seed: u64, n_sim: usize) -> Result<DensityStage> {
    let table = density_table(rows);
    let multi_type = rows.iter().map(|r| r.structure).unique().count() > 1;
    let mut formula = Formula::new("StainingDensity").factor("Genotype");
    if multi_type {
        formula = formula.factor("Type").random_intercept(&["Animal", "Type"]);
    }
    formula = formula.random_intercept(&["Animal"]);

    let model = fit(&formula, &table, Family::Gaussian)?;
    let emm = marginal_means(&model, &table, "Genotype")?;
    let residuals = simulate_residuals(&model, n_sim, seed)?;
    Ok(DensityStage {
        table,
        model,
        emm,
        residuals,
    })
}

/// Fitted g-ratio model and its prediction curves.
pub struct GRatioStage {
    pub table: AnalysisTable,
    pub model: FittedModel,
    pub emm: EmmTable,
    pub residuals: ScaledResiduals,
    /// Population-level curve per genotype.
    pub curves: Vec<FitCurve>,
}

fn fiber_table(fibers: &[&FiberRow]) -> AnalysisTable {
    let mut table = AnalysisTable::new();
    table.push_numeric("gRatio", fibers.iter().map(|r| r.g_ratio).collect());
    table.push_numeric(
        "AxonDiameter",
        fibers.iter().map(|r| r.axon_diameter).collect(),
    );
    table.push_factor(
        "Genotype",
        fibers.iter().map(|r| r.genotype.to_string()).collect(),
    );
    table.push_factor("Animal", fibers.iter().map(|r| r.animal.clone()).collect());
    table
}

/// g-ratio against axon diameter crossed with genotype, per-animal random
/// intercepts. Only unflagged fibers enter the fit.
pub fn g_ratio_stage(fibers: &[FiberRow], seed: u64, n_sim: usize) -> Result<GRatioStage> {
    let usable = valid_fibers(fibers);
    let table = fiber_table(&usable);
    let formula = Formula::new("gRatio")
        .crossed("AxonDiameter", "Genotype")
        .random_intercept(&["Animal"]);
    let model = fit(&formula, &table, Family::Gaussian)?;
    let emm = marginal_means(&model, &table, "Genotype")?;
    let residuals = simulate_residuals(&model, n_sim, seed)?;

    let diameters: Vec<f64> = usable.iter().map(|r| r.axon_diameter).collect();
    let (lo, hi) = diameters
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
            (lo.min(*d), hi.max(*d))
        });
    let grid = covariate_grid(lo, hi, 50);

    let mut curves = Vec::new();
    let mut color_index = 0;
    for genotype in [Genotype::Ctr, Genotype::Mut] {
        let label = genotype.to_string();
        if !usable.iter().any(|r| r.genotype == genotype) {
            continue;
        }
        let mut grid_table = AnalysisTable::new();
        grid_table.push_numeric("AxonDiameter", grid.clone());
        grid_table.push_factor("Genotype", vec![label.clone(); grid.len()]);
        let predicted = model.predict(&grid_table)?;
        curves.push(FitCurve {
            label,
            points: grid.iter().copied().zip(predicted).collect(),
            emphasized: true,
            color_index,
        });

        // thin conditional curve per animal, in the genotype's color
        for animal in usable
            .iter()
            .filter(|r| r.genotype == genotype)
            .map(|r| r.animal.clone())
            .unique()
        {
            let mut animal_table = AnalysisTable::new();
            animal_table.push_numeric("AxonDiameter", grid.clone());
            animal_table.push_factor("Genotype", vec![genotype.to_string(); grid.len()]);
            animal_table.push_factor("Animal", vec![animal.clone(); grid.len()]);
            let conditional = model.predict_conditional(&animal_table)?;
            curves.push(FitCurve {
                label: animal,
                points: grid.iter().copied().zip(conditional).collect(),
                emphasized: false,
                color_index,
            });
        }
        color_index += 1;
    }

    Ok(GRatioStage {
        table,
        model,
        emm,
        residuals,
        curves,
    })
}

/// Fitted RNAscope transcript-count model.
pub struct CountStage {
    pub table: AnalysisTable,
    pub model: FittedModel,
    pub emm: EmmTable,
    pub residuals: ScaledResiduals,
}

fn count_table(rows: &[CountRow]) -> AnalysisTable {
    let mut table = AnalysisTable::new();
    table.push_numeric("Count", rows.iter().map(|r| r.count).collect());
    table.push_factor("Genotype", rows.iter().map(|r| r.genotype.to_string()).collect());
    table.push_factor("Animal", rows.iter().map(|r| r.animal.clone()).collect());
    table
}

/// Negative-binomial mixed model of per-cell transcript counts on genotype.
pub fn count_stage(rows: &[CountRow], seed: u64, n_sim: usize) -> Result<CountStage> {
    let table = count_table(rows);
    let formula = Formula::new("Count")
        .factor("Genotype")
        .random_intercept(&["Animal"]);
    let model = fit(&formula, &table, Family::NegativeBinomial)?;
    let emm = marginal_means(&model, &table, "Genotype")?;
    let residuals = simulate_residuals(&model, n_sim, seed)?;
    Ok(CountStage {
        table,
        model,
        emm,
        residuals,
    })
}

fn report_model(header: &str, model: &FittedModel, emm: &EmmTable, residuals: &ScaledResiduals) {
    println!("\n== {header} ==");
    model.pprint_summary();
    if let Err(e) = model.pprint_anova() {
        error!(error = %e, "ANOVA table unavailable");
    }
    emm.pprint();
    residuals.pprint();
}

fn genotype_points(images: &[ImageSummary], genotype: Genotype) -> PointGroup {
    let offset = match genotype {
        Genotype::Ctr => -0.12,
        Genotype::Mut => 0.12,
    };
    PointGroup {
        label: genotype.to_string(),
        points: images
            .iter()
            .filter(|s| s.genotype == genotype)
            .filter_map(|s| {
                let index = crate::schema::Structure::ALL
                    .iter()
                    .position(|t| *t == s.structure)? as f64;
                let density = s.metrics.get("mean_StainingDensity")?;
                Some((index + offset, *density))
            })
            .collect(),
    }
}

fn density_plot(path: &Path, title: &str, stage: &DensityStage, images: &[ImageSummary]) -> Result<()> {
    let groups: Vec<PointGroup> = [Genotype::Ctr, Genotype::Mut]
        .into_iter()
        .map(|g| genotype_points(images, g))
        .filter(|g| !g.points.is_empty())
        .collect();
    let span = crate::schema::Structure::ALL.len() as f64 - 1.0;
    let curves: Vec<FitCurve> = stage
        .emm
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| FitCurve {
            label: format!("{} mean", row.level),
            points: vec![(-0.3, row.response), (span + 0.3, row.response)],
            emphasized: true,
            color_index: i,
        })
        .collect();
    scatter_with_fit(
        path,
        title,
        "structure (Axon/Myelin/Astrocyte/Oligo)",
        "gold particles per um^2",
        &groups,
        &curves,
    )
}

fn g_ratio_plot(path: &Path, title: &str, stage: &GRatioStage, fibers: &[FiberRow]) -> Result<()> {
    let groups: Vec<PointGroup> = [Genotype::Ctr, Genotype::Mut]
        .into_iter()
        .map(|genotype| PointGroup {
            label: genotype.to_string(),
            points: valid_fibers(fibers)
                .iter()
                .filter(|r| r.genotype == genotype)
                .map(|r| (r.axon_diameter, r.g_ratio))
                .collect(),
        })
        .filter(|g| !g.points.is_empty())
        .collect();
    scatter_with_fit(
        path,
        title,
        "axon diameter (um)",
        "g-ratio",
        &groups,
        &stage.curves,
    )
}

fn count_plot(path: &Path, title: &str, stage: &CountStage, rows: &[CountRow]) -> Result<()> {
    let animals: Vec<String> = rows.iter().map(|r| r.animal.clone()).unique().collect();
    let groups: Vec<PointGroup> = [Genotype::Ctr, Genotype::Mut]
        .into_iter()
        .map(|genotype| PointGroup {
            label: genotype.to_string(),
            points: rows
                .iter()
                .filter(|r| r.genotype == genotype)
                .filter_map(|r| {
                    let index = animals.iter().position(|a| *a == r.animal)? as f64;
                    Some((index, r.count))
                })
                .collect(),
        })
        .filter(|g| !g.points.is_empty())
        .collect();
    let span = animals.len() as f64 - 1.0;
    let curves: Vec<FitCurve> = stage
        .emm
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| FitCurve {
            label: format!("{} mean", row.level),
            points: vec![(-0.3, row.response), (span + 0.3, row.response)],
            emphasized: true,
            color_index: i,
        })
        .collect();
    scatter_with_fit(path, title, "animal", "transcript count per cell", &groups, &curves)
}

/// Run the EM staining-density and g-ratio analyses of one workbook.
/// Returns the number of failed analysis blocks.
pub fn run_em_workbook(config: &RunConfig, workbook: &Path, tag: &str) -> usize {
    let mut failures = 0;
    for stain in &config.stains {
        if let Err(e) = em_density_block(config, workbook, tag, stain) {
            error!(workbook = %workbook.display(), stain, error = %e, "density analysis failed");
            failures += 1;
        }
        if let Err(e) = em_g_ratio_block(config, workbook, tag, stain) {
            error!(workbook = %workbook.display(), stain, error = %e, "g-ratio analysis failed");
            failures += 1;
        }
    }
    failures
}

fn em_density_block(config: &RunConfig, workbook: &Path, tag: &str, stain: &str) -> Result<()> {
    info!(workbook = %workbook.display(), stain, "EM staining density");
    let mut rows = Vec::new();
    let mut audit = DropAudit::default();
    for (sheet_name, mapping) in [
        (format!("OL - {stain}"), &CELL_MAPPING),
        (format!("Axons - {stain}"), &AXON_MAPPING),
    ] {
        let sheet = Sheet::read(workbook, &sheet_name)?;
        let (mut sheet_rows, sheet_audit) = pivot_long(&sheet, mapping)?;
        rows.append(&mut sheet_rows);
        audit = merge_audits(audit, sheet_audit);
    }
    audit.log(&format!("{tag} {stain} density"));

    let summaries = summary_stage(&rows);
    pprint_animals(&summaries.animals);
    pprint_genotypes(&summaries.genotypes);

    let stage = density_stage(&rows, config.seed, config.n_sim)?;
    report_model(&format!("{tag} {stain} staining density"), &stage.model, &stage.emm, &stage.residuals);

    if config.export_intermediate {
        write_csv(&rows, &config.out_dir.join(format!("{tag}_{stain}_tidy.csv")))?;
    }
    density_plot(
        &config.out_dir.join(format!("{tag}_{stain}_density.png")),
        &format!("{stain} staining density ({tag})"),
        &stage,
        &summaries.images,
    )
}

fn em_g_ratio_block(config: &RunConfig, workbook: &Path, tag: &str, stain: &str) -> Result<()> {
    let sheet = Sheet::read(workbook, &format!("Axons - {stain}"))?;
    if !sheet.has_column("FiberArea") {
        info!(stain, "no FiberArea column; skipping g-ratio block");
        return Ok(());
    }
    let (fibers, _audit) = fiber_rows(&sheet)?;
    let stage = g_ratio_stage(&fibers, config.seed, config.n_sim)?;
    report_model(&format!("{tag} {stain} g-ratio"), &stage.model, &stage.emm, &stage.residuals);
    g_ratio_plot(
        &config.out_dir.join(format!("{tag}_{stain}_gratio.png")),
        &format!("g-ratio vs axon diameter ({tag}, {stain})"),
        &stage,
        &fibers,
    )
}

/// Run the RNAscope transcript-count analysis of one workbook.
/// Returns the number of failed analysis blocks.
pub fn run_rnascope_workbook(config: &RunConfig, workbook: &Path) -> usize {
    let mut failures = 0;
    for stain in &config.stains {
        if let Err(e) = rnascope_block(config, workbook, stain) {
            error!(workbook = %workbook.display(), stain, error = %e, "RNAscope analysis failed");
            failures += 1;
        }
    }
    failures
}

fn rnascope_block(config: &RunConfig, workbook: &Path, stain: &str) -> Result<()> {
    info!(workbook = %workbook.display(), stain, "RNAscope transcript counts");
    let sheet = Sheet::read(workbook, stain)?;
    let (rows, _audit) = rnascope_rows(&sheet)?;
    let stage = count_stage(&rows, config.seed, config.n_sim)?;
    report_model(&format!("RNAscope {stain} transcripts"), &stage.model, &stage.emm, &stage.residuals);
    count_plot(
        &config.out_dir.join(format!("rnascope_{stain}.png")),
        &format!("RNAscope {stain} transcripts per cell"),
        &stage,
        &rows,
    )
}

fn merge_audits(a: DropAudit, b: DropAudit) -> DropAudit {
    DropAudit {
        missing_key: a.missing_key + b.missing_key,
        missing_area: a.missing_area + b.missing_area,
        missing_gold: a.missing_gold + b.missing_gold,
        missing_both: a.missing_both + b.missing_both,
        nonpositive_area: a.nonpositive_area + b.nonpositive_area,
        negative_gold: a.negative_gold + b.negative_gold,
        negative_control: a.negative_control + b.negative_control,
        zero_fiber: a.zero_fiber + b.zero_fiber,
        flagged_ratio: a.flagged_ratio + b.flagged_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Structure;
    use approx::assert_relative_eq;

    fn measurement(
        animal: &str,
        image: &str,
        genotype: Genotype,
        area: f64,
        gold: f64,
    ) -> MeasurementRow {
        MeasurementRow::new(
            animal.into(),
            image.into(),
            genotype,
            Structure::Axon,
            area,
            gold,
        )
    }

    /// Two animals, two images each; ctr densities {2, 2}, mut {1, 0.5}.
    fn two_animal_rows() -> Vec<MeasurementRow> {
        vec![
            measurement("m1", "i1", Genotype::Ctr, 1.0, 2.0),
            measurement("m1", "i2", Genotype::Ctr, 2.0, 4.0),
            measurement("m2", "i3", Genotype::Mut, 1.0, 1.0),
            measurement("m2", "i4", Genotype::Mut, 2.0, 1.0),
        ]
    }

    #[test]
    fn test_end_to_end_density_contrast() {
        let rows = two_animal_rows();
        let stage = density_stage(&rows, 3, 50).unwrap();
        assert!(stage.model.converged);
        let contrast = stage.emm.contrast("ctr - mut").unwrap();
        // ctr mean 2.0, mut mean 0.75
        assert!(contrast.estimate > 0.0);
        assert_relative_eq!(contrast.estimate, 1.25, epsilon = 1e-6);
        assert!(contrast.p_value > 0.0 && contrast.p_value <= 1.0);
        assert!(contrast.p_adjusted >= contrast.p_value);
    }

    #[test]
    fn test_density_stage_adds_type_terms_for_mixed_structures() {
        // every image measured for both Axon and Myelin
        let mut extended = two_animal_rows();
        for base in two_animal_rows() {
            let mut myelin = base.clone();
            myelin.structure = Structure::Myelin;
            myelin.gold += 1.0;
            extended.push(myelin);
        }
        let stage = density_stage(&extended, 3, 50).unwrap();
        assert_eq!(stage.model.variance_components().len(), 2);
        let anova = stage.model.anova().unwrap();
        assert!(anova.iter().any(|r| r.term == "Type"));
    }

    #[test]
    fn test_g_ratio_stage_excludes_flagged_fibers() {
        let mut fibers = Vec::new();
        for (animal, genotype, base) in
            [("m1", Genotype::Ctr, 0.60), ("m2", Genotype::Mut, 0.75)]
        {
            for i in 0..8 {
                let axon_diameter = 0.5 + 0.1 * i as f64;
                let wiggle = if i % 2 == 0 { 0.004 } else { -0.004 };
                let g_ratio = base + 0.01 * i as f64 + wiggle;
                fibers.push(FiberRow::new(
                    animal.into(),
                    format!("i{i}"),
                    genotype,
                    axon_diameter,
                    axon_diameter / g_ratio,
                    1.0,
                    g_ratio,
                    false,
                ));
            }
        }
        fibers.push(FiberRow::new(
            "m1".into(),
            "bad".into(),
            Genotype::Ctr,
            2.0,
            1.0,
            -0.5,
            2.0,
            true,
        ));
        let stage = g_ratio_stage(&fibers, 3, 50).unwrap();
        assert_eq!(stage.table.n_rows(), 16);
        // one emphasized population curve per genotype, plus animal curves
        let emphasized = stage.curves.iter().filter(|c| c.emphasized).count();
        assert_eq!(emphasized, 2);
        let anova = stage.model.anova().unwrap();
        assert!(anova.iter().any(|r| r.term == "AxonDiameter:Genotype"));
    }

    #[test]
    fn test_g_ratio_conditional_curves_share_genotype_color() {
        let mut fibers = Vec::new();
        for (animal, genotype, base) in [
            ("m1", Genotype::Ctr, 0.60),
            ("m2", Genotype::Ctr, 0.62),
            ("m3", Genotype::Mut, 0.75),
        ] {
            for i in 0..8 {
                let axon_diameter = 0.5 + 0.1 * i as f64;
                let wiggle = if i % 2 == 0 { 0.004 } else { -0.004 };
                let g_ratio = base + 0.01 * i as f64 + wiggle;
                fibers.push(FiberRow::new(
                    animal.into(),
                    format!("i{i}"),
                    genotype,
                    axon_diameter,
                    axon_diameter / g_ratio,
                    1.0,
                    g_ratio,
                    false,
                ));
            }
        }
        let stage = g_ratio_stage(&fibers, 3, 50).unwrap();
        // ctr: population + two animal curves, all palette slot 0;
        // mut: population + one animal curve, slot 1
        let ctr = &stage.curves[..3];
        assert!(ctr[0].emphasized && ctr[0].label == "ctr");
        assert!(ctr.iter().all(|c| c.color_index == 0));
        let mutant = &stage.curves[3..];
        assert_eq!(mutant.len(), 2);
        assert!(mutant[0].emphasized && mutant[0].label == "mut");
        assert!(mutant.iter().all(|c| c.color_index == 1));
    }

    #[test]
    fn test_count_stage_reports_genotype_ratio() {
        let mut rows = Vec::new();
        for (animal, genotype, counts) in [
            ("m1", Genotype::Ctr, [12.0, 9.0, 15.0, 11.0, 13.0]),
            ("m2", Genotype::Ctr, [10.0, 14.0, 12.0, 9.0, 16.0]),
            ("m3", Genotype::Mut, [4.0, 2.0, 5.0, 3.0, 4.0]),
            ("m4", Genotype::Mut, [3.0, 6.0, 2.0, 4.0, 3.0]),
        ] {
            for (i, count) in counts.into_iter().enumerate() {
                rows.push(CountRow::new(
                    animal.into(),
                    format!("{animal}_c{i}"),
                    genotype,
                    count,
                ));
            }
        }
        let stage = count_stage(&rows, 3, 50).unwrap();
        let emm = &stage.emm;
        assert!(emm.log_link);
        let ctr = &emm.rows[0];
        let mutant = &emm.rows[1];
        assert!(ctr.response > mutant.response);
        let contrast = emm.contrast("ctr - mut").unwrap();
        // log ratio of roughly 12 vs 3.6 transcripts per cell
        assert!(contrast.estimate > 0.5);
        assert!(contrast.p_value < 0.05);
    }
}
