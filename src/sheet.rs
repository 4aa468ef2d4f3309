use std::path::Path;

use calamine::{open_workbook_auto, DataType, Reader};
use tracing::debug;

use crate::error::{Error, Result};

/// A single spreadsheet cell.
///
/// Blank cells are an explicit `Absent`, never coerced to zero; whether a
/// missing value drops the row is decided downstream, per analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
    Absent,
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Textual rendering of the cell; numbers keyed as labels (animal
    /// identifiers are often numeric in the workbooks) come out trimmed.
    pub fn label(&self) -> Option<String> {
        match self {
            Cell::Text(s) => Some(s.clone()),
            Cell::Number(v) => {
                if v.fract() == 0.0 {
                    Some(format!("{}", *v as i64))
                } else {
                    Some(format!("{v}"))
                }
            }
            Cell::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Cell::Absent)
    }
}

fn convert(cell: &DataType) -> Cell {
    match cell {
        DataType::Empty => Cell::Absent,
        DataType::Float(v) => Cell::Number(*v),
        DataType::Int(v) => Cell::Number(*v as f64),
        DataType::DateTime(v) => Cell::Number(*v),
        DataType::Bool(b) => Cell::Text(b.to_string()),
        DataType::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Cell::Absent
            } else if let Ok(v) = trimmed.parse::<f64>() {
                // numbers stored as text in hand-edited sheets
                Cell::Number(v)
            } else {
                Cell::Text(trimmed.to_string())
            }
        }
        _ => Cell::Absent,
    }
}

/// An in-memory measurement sheet: header row plus row-oriented cells.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Sheet {
    /// Read one named sheet from an xlsx/xls workbook.
    pub fn read(path: &Path, sheet: &str) -> Result<Self> {
        let mut workbook = open_workbook_auto(path).map_err(|e| Error::Workbook {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let range = workbook
            .worksheet_range(sheet)
            .ok_or_else(|| Error::MissingSheet {
                path: path.to_path_buf(),
                sheet: sheet.to_string(),
            })?
            .map_err(|e| Error::Workbook {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut rows_iter = range.rows();
        let columns: Vec<String> = rows_iter
            .next()
            .ok_or_else(|| Error::EmptySheet {
                sheet: sheet.to_string(),
            })?
            .iter()
            .map(|c| convert(c).label().unwrap_or_default())
            .collect();
        debug!(sheet, ?columns, "sheet header");

        let rows: Vec<Vec<Cell>> = rows_iter
            .map(|row| {
                let mut cells: Vec<Cell> = row.iter().map(convert).collect();
                cells.resize(columns.len(), Cell::Absent);
                cells
            })
            .filter(|cells| cells.iter().any(|c| !c.is_absent()))
            .collect();

        Ok(Self {
            name: sheet.to_string(),
            columns,
            rows,
        })
    }

    /// Construct a sheet from literal rows (synthetic data in tests).
    pub fn from_rows(name: &str, columns: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Validate that every column a downstream stage expects is present.
    pub fn require(&self, names: &[&str]) -> Result<()> {
        for name in names {
            if !self.has_column(name) {
                return Err(Error::MissingColumn {
                    sheet: self.name.clone(),
                    column: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn cell(&self, row: usize, column: &str) -> &Cell {
        match self.column_index(column) {
            Some(idx) => &self.rows[row][idx],
            None => &Cell::Absent,
        }
    }

    pub fn number(&self, row: usize, column: &str) -> Option<f64> {
        self.cell(row, column).as_f64()
    }

    pub fn label(&self, row: usize, column: &str) -> Option<String> {
        self.cell(row, column).label()
    }

    /// Flat-file export of the raw sheet (the optional intermediate export
    /// point; gated by `export_intermediate` in the run configuration).
    pub fn to_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<String> = row.iter().map(|c| c.label().unwrap_or_default()).collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
