//! Wide-to-long reshaping and derived metrics.
//!
//! Rows are dropped only for row-level reasons (missing cells, invalid
//! geometry) and every drop is counted in a [`DropAudit`] so the sheets can
//! be checked against what actually entered the models.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use derive_new::new;
use itertools::Itertools;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::math::diameter_from_area;
use crate::schema::{Genotype, Structure, WideMapping, KEY_COLUMNS};
use crate::sheet::Sheet;

/// One structural region on one micrograph, in long format.
#[derive(Debug, Clone, new)]
pub struct MeasurementRow {
    pub animal: String,
    pub image: String,
    pub genotype: Genotype,
    pub structure: Structure,
    /// Region area in square micrometers. Always > 0 for surviving rows.
    pub area_um2: f64,
    /// Immunogold particle count. Always >= 0 for surviving rows.
    pub gold: f64,
}

impl MeasurementRow {
    /// Gold particles per square micrometer.
    pub fn staining_density(&self) -> f64 {
        self.gold / self.area_um2
    }
}

/// One myelinated fiber with its geometry-derived metrics.
#[derive(Debug, Clone, new)]
pub struct FiberRow {
    pub animal: String,
    pub image: String,
    pub genotype: Genotype,
    pub axon_diameter: f64,
    pub fiber_diameter: f64,
    pub myelin_area: f64,
    pub g_ratio: f64,
    /// True when the g-ratio falls outside (0, 1). Flagged rows are kept in
    /// the table for reporting but excluded from model fitting.
    pub flagged: bool,
}

/// One RNAscope-quantified cell.
#[derive(Debug, Clone, new)]
pub struct CountRow {
    pub animal: String,
    pub image: String,
    pub genotype: Genotype,
    pub count: f64,
}

/// Per-stage tally of rows that did not survive reshaping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DropAudit {
    pub missing_key: usize,
    pub missing_area: usize,
    pub missing_gold: usize,
    pub missing_both: usize,
    pub nonpositive_area: usize,
    pub negative_gold: usize,
    pub negative_control: usize,
    pub zero_fiber: usize,
    pub flagged_ratio: usize,
}

impl DropAudit {
    pub fn total_dropped(&self) -> usize {
        self.missing_key
            + self.missing_area
            + self.missing_gold
            + self.missing_both
            + self.nonpositive_area
            + self.negative_gold
            + self.negative_control
            + self.zero_fiber
    }

    pub fn log(&self, stage: &str) {
        info!(
            stage,
            missing_key = self.missing_key,
            missing_area = self.missing_area,
            missing_gold = self.missing_gold,
            missing_both = self.missing_both,
            nonpositive_area = self.nonpositive_area,
            negative_gold = self.negative_gold,
            negative_control = self.negative_control,
            zero_fiber = self.zero_fiber,
            flagged_ratio = self.flagged_ratio,
            total_dropped = self.total_dropped(),
            "row drop audit"
        );
    }
}

fn row_keys(sheet: &Sheet, row: usize) -> Option<(String, String, Genotype)> {
    let animal = sheet.label(row, "Animal")?;
    let image = sheet.label(row, "Image")?;
    let genotype = Genotype::from_str(&sheet.label(row, "Genotype")?).ok()?;
    Some((animal, image, genotype))
}

/// Image labels containing this marker denote negative-control micrographs.
const NEGATIVE_CONTROL_MARKER: &str = "neg";

fn is_negative_control(image: &str) -> bool {
    image.to_ascii_lowercase().contains(NEGATIVE_CONTROL_MARKER)
}

/// Pivot a wide measurement sheet into long rows via its mapping table.
///
/// A (structure, row) pair survives only when both its Area and Gold cells
/// are present, the area is positive and the gold count non-negative.
pub fn pivot_long(sheet: &Sheet, mapping: &WideMapping) -> Result<(Vec<MeasurementRow>, DropAudit)> {
    sheet.require(&KEY_COLUMNS)?;
    let pairs = mapping.pairs();
    for (_, area_col, gold_col) in &pairs {
        sheet.require(&[*area_col, *gold_col])?;
    }

    let mut rows = Vec::new();
    let mut audit = DropAudit::default();
    for row in 0..sheet.n_rows() {
        let Some((animal, image, genotype)) = row_keys(sheet, row) else {
            audit.missing_key += 1;
            continue;
        };
        for (structure, area_col, gold_col) in &pairs {
            let area = sheet.number(row, area_col);
            let gold = sheet.number(row, gold_col);
            match (area, gold) {
                (None, None) => audit.missing_both += 1,
                (None, Some(_)) => audit.missing_area += 1,
                (Some(_), None) => audit.missing_gold += 1,
                (Some(area), Some(gold)) => {
                    if area <= 0.0 {
                        audit.nonpositive_area += 1;
                    } else if gold < 0.0 {
                        audit.negative_gold += 1;
                    } else {
                        rows.push(MeasurementRow::new(
                            animal.clone(),
                            image.clone(),
                            genotype,
                            *structure,
                            area,
                            gold,
                        ));
                    }
                }
            }
        }
    }

    audit.log(&format!("pivot_long[{}]", sheet.name));
    check_genotype_invariant(rows.iter().map(|r| (r.animal.as_str(), r.genotype)))?;
    if rows.is_empty() {
        return Err(Error::NoSurvivingRows {
            stage: format!("pivot_long[{}]", sheet.name),
        });
    }
    Ok((rows, audit))
}

/// Genotype never varies within an animal. Any animal carrying more than one
/// label makes the whole sheet unusable and is rejected outright.
pub fn check_genotype_invariant<'a, I>(pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, Genotype)>,
{
    let mut seen: BTreeMap<&str, Genotype> = BTreeMap::new();
    for (animal, genotype) in pairs {
        match seen.get(animal) {
            None => {
                seen.insert(animal, genotype);
            }
            Some(prev) if *prev != genotype => {
                return Err(Error::MixedGenotype {
                    animal: animal.to_string(),
                    labels: vec![prev.to_string(), genotype.to_string()],
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Extract fiber geometry rows (g-ratio analysis) from an axon sheet.
///
/// Negative-control images and rows with an absent or zero fiber area are
/// excluded; rows whose g-ratio falls outside (0, 1) survive but are flagged.
pub fn fiber_rows(sheet: &Sheet) -> Result<(Vec<FiberRow>, DropAudit)> {
    sheet.require(&KEY_COLUMNS)?;
    sheet.require(&["AxonArea", "FiberArea"])?;

    let mut rows = Vec::new();
    let mut audit = DropAudit::default();
    for row in 0..sheet.n_rows() {
        let Some((animal, image, genotype)) = row_keys(sheet, row) else {
            audit.missing_key += 1;
            continue;
        };
        if is_negative_control(&image) {
            audit.negative_control += 1;
            continue;
        }
        // both columns are areas, so a single absent cell tallies as
        // missing_area rather than missing_both
        let (axon_area, fiber_area) = match (
            sheet.number(row, "AxonArea"),
            sheet.number(row, "FiberArea"),
        ) {
            (Some(a), Some(f)) => (a, f),
            (None, None) => {
                audit.missing_both += 1;
                continue;
            }
            _ => {
                audit.missing_area += 1;
                continue;
            }
        };
        if axon_area <= 0.0 || fiber_area <= 0.0 {
            audit.zero_fiber += 1;
            continue;
        }
        let axon_diameter = diameter_from_area(axon_area);
        let fiber_diameter = diameter_from_area(fiber_area);
        let g_ratio = axon_diameter / fiber_diameter;
        let flagged = !(g_ratio > 0.0 && g_ratio < 1.0);
        if flagged {
            audit.flagged_ratio += 1;
            warn!(animal = %animal, image = %image, g_ratio, "g-ratio outside (0, 1); flagged");
        }
        rows.push(FiberRow::new(
            animal,
            image,
            genotype,
            axon_diameter,
            fiber_diameter,
            fiber_area - axon_area,
            g_ratio,
            flagged,
        ));
    }

    audit.log(&format!("fiber_rows[{}]", sheet.name));
    check_genotype_invariant(rows.iter().map(|r| (r.animal.as_str(), r.genotype)))?;
    if rows.is_empty() {
        return Err(Error::NoSurvivingRows {
            stage: format!("fiber_rows[{}]", sheet.name),
        });
    }
    Ok((rows, audit))
}

/// Fibers eligible for model fitting (unflagged g-ratio only).
pub fn valid_fibers(rows: &[FiberRow]) -> Vec<&FiberRow> {
    rows.iter().filter(|r| !r.flagged).collect()
}

/// Extract per-cell transcript counts from an RNAscope sheet.
pub fn rnascope_rows(sheet: &Sheet) -> Result<(Vec<CountRow>, DropAudit)> {
    sheet.require(&["Animal", "Genotype", "Count"])?;

    let mut rows = Vec::new();
    let mut audit = DropAudit::default();
    for row in 0..sheet.n_rows() {
        let (Some(animal), Some(genotype)) = (
            sheet.label(row, "Animal"),
            sheet
                .label(row, "Genotype")
                .and_then(|g| Genotype::from_str(&g).ok()),
        ) else {
            audit.missing_key += 1;
            continue;
        };
        let image = sheet.label(row, "Image").unwrap_or_default();
        let Some(count) = sheet.number(row, "Count") else {
            audit.missing_gold += 1;
            continue;
        };
        if count < 0.0 {
            audit.negative_gold += 1;
            continue;
        }
        rows.push(CountRow::new(animal, image, genotype, count));
    }

    audit.log(&format!("rnascope_rows[{}]", sheet.name));
    check_genotype_invariant(rows.iter().map(|r| (r.animal.as_str(), r.genotype)))?;
    if rows.is_empty() {
        return Err(Error::NoSurvivingRows {
            stage: format!("rnascope_rows[{}]", sheet.name),
        });
    }
    Ok((rows, audit))
}

/// Intermediate export of the tidy table as CSV.
pub fn write_csv(rows: &[MeasurementRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "Animal",
        "Image",
        "Genotype",
        "Type",
        "Area",
        "Gold",
        "StainingDensity",
    ])?;
    for row in rows {
        writer.write_record([
            row.animal.clone(),
            row.image.clone(),
            row.genotype.to_string(),
            row.structure.to_string(),
            row.area_um2.to_string(),
            row.gold.to_string(),
            row.staining_density().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Animals present in a tidy table, in first-seen order.
pub fn animals(rows: &[MeasurementRow]) -> Vec<String> {
    rows.iter().map(|r| r.animal.clone()).unique().collect()
}
