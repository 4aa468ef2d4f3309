//! Declarative layout of the quantification workbooks.
//!
//! The wide measurement sheets are translated to long format through a fixed
//! mapping table rather than by pattern-matching column names at runtime, so
//! the set of recognized columns is visible here in full.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Experimental genotype: wild-type littermate vs LDHA/LDHB conditional
/// knockout. Fixed per animal; any within-animal disagreement is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Genotype {
    Ctr,
    Mut,
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Genotype::Ctr => write!(f, "ctr"),
            Genotype::Mut => write!(f, "mut"),
        }
    }
}

impl FromStr for Genotype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ctr" | "wt" | "control" | "ctrl" => Ok(Genotype::Ctr),
            "mut" | "ko" | "cko" | "mutant" => Ok(Genotype::Mut),
            _ => Err(Error::UnknownGenotype {
                label: s.to_string(),
            }),
        }
    }
}

/// Structural region quantified on a micrograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Structure {
    Axon,
    Myelin,
    Astrocyte,
    Oligo,
}

impl Structure {
    pub const ALL: [Structure; 4] = [
        Structure::Axon,
        Structure::Myelin,
        Structure::Astrocyte,
        Structure::Oligo,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Structure::Axon => "Axon",
            Structure::Myelin => "Myelin",
            Structure::Astrocyte => "Astrocyte",
            Structure::Oligo => "Oligo",
        }
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which of the two uniform long-format fields a wide column feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Area,
    Gold,
}

/// One wide column and its long-format destination.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRule {
    pub column: &'static str,
    pub structure: Structure,
    pub field: Field,
}

const fn rule(column: &'static str, structure: Structure, field: Field) -> ColumnRule {
    ColumnRule {
        column,
        structure,
        field,
    }
}

/// A complete wide-to-long mapping for one sheet layout.
#[derive(Debug, Clone, Copy)]
pub struct WideMapping {
    pub rules: &'static [ColumnRule],
}

impl WideMapping {
    /// Structures covered by this mapping, each with its (Area, Gold)
    /// column pair. Mappings are authored pairwise, so a structure with
    /// only one of the two columns is a layout bug caught at load time.
    pub fn pairs(&self) -> Vec<(Structure, &'static str, &'static str)> {
        Structure::ALL
            .iter()
            .filter_map(|s| {
                let area = self
                    .rules
                    .iter()
                    .find(|r| r.structure == *s && r.field == Field::Area)?;
                let gold = self
                    .rules
                    .iter()
                    .find(|r| r.structure == *s && r.field == Field::Gold)?;
                Some((*s, area.column, gold.column))
            })
            .collect()
    }

    pub fn columns(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.column).collect()
    }
}

/// Key columns shared by every measurement sheet.
pub const KEY_COLUMNS: [&str; 3] = ["Animal", "Image", "Genotype"];

/// "Axons - <stain>" sheets: per-fiber axon and myelin compartments.
pub const AXON_MAPPING: WideMapping = WideMapping {
    rules: &[
        rule("AxonArea", Structure::Axon, Field::Area),
        rule("AxonGold", Structure::Axon, Field::Gold),
        rule("MyelinArea", Structure::Myelin, Field::Area),
        rule("MyelinGold", Structure::Myelin, Field::Gold),
    ],
};

/// "OL - <stain>" sheets: glial cell bodies. Exactly one oligodendrocyte is
/// quantified per image.
pub const CELL_MAPPING: WideMapping = WideMapping {
    rules: &[
        rule("AstroArea", Structure::Astrocyte, Field::Area),
        rule("AstroGold", Structure::Astrocyte, Field::Gold),
        rule("OligoArea", Structure::Oligo, Field::Area),
        rule("OligoGold", Structure::Oligo, Field::Gold),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genotype_parsing() {
        assert_eq!("ctr".parse::<Genotype>().unwrap(), Genotype::Ctr);
        assert_eq!("WT".parse::<Genotype>().unwrap(), Genotype::Ctr);
        assert_eq!("cKO".parse::<Genotype>().unwrap(), Genotype::Mut);
        assert!("het".parse::<Genotype>().is_err());
    }

    #[test]
    fn test_axon_mapping_pairs() {
        let pairs = AXON_MAPPING.pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (Structure::Axon, "AxonArea", "AxonGold"));
        assert_eq!(pairs[1], (Structure::Myelin, "MyelinArea", "MyelinGold"));
    }

    #[test]
    fn test_cell_mapping_pairs() {
        let pairs = CELL_MAPPING.pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, Structure::Astrocyte);
        assert_eq!(pairs[1].0, Structure::Oligo);
    }
}
