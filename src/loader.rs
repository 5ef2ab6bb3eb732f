use calamine::{Data, Range, Reader, Xlsx, open_workbook};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::HashSet;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use crate::error::{EntryError, Result};
use crate::model::{FIXED_COLUMNS, TreatmentFields};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// A parsed tabular file: one header row plus data rows, every cell as text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grid {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// The structure an admin upload defines: treatment rows (columns A–G) and
/// trait names (headers from column H on).
///
/// Values below the trait headers are ignored; an upload seeds structure only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentUpload {
    pub experiment_id: String,
    pub treatments: Vec<TreatmentFields>,
    pub traits: Vec<String>,
}

impl ExperimentUpload {
    /// Validate a grid and split it into treatments and trait names.
    ///
    /// # Errors
    /// * fewer than eight columns (A–G plus at least one trait)
    /// * no data rows
    /// * a data row shorter than seven cells, or missing its experiment id or
    ///   treatment name
    /// * a blank or repeated trait header
    pub fn from_grid(grid: &Grid) -> Result<Self> {
        if grid.headers.len() <= FIXED_COLUMNS.len() {
            return Err(EntryError::Validation(format!(
                "upload must contain columns A–G plus at least one trait column (found {} columns)",
                grid.headers.len()
            )));
        }

        let mut traits = Vec::new();
        let mut seen = HashSet::new();
        for (idx, header) in grid.headers.iter().enumerate().skip(FIXED_COLUMNS.len()) {
            let name = normalize_header(header);
            if name.is_empty() {
                return Err(EntryError::Validation(format!(
                    "trait header in column {} is blank",
                    column_letter(idx + 1)
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(EntryError::Validation(format!(
                    "trait '{}' appears more than once",
                    name
                )));
            }
            traits.push(name);
        }

        let mut treatments = Vec::new();
        for (idx, row) in grid.rows.iter().enumerate() {
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            // Header is spreadsheet row 1.
            let line = idx + 2;
            if row.len() < FIXED_COLUMNS.len() {
                return Err(EntryError::Validation(format!(
                    "row {} stops at column {}; columns A–G are required",
                    line,
                    column_letter(row.len())
                )));
            }
            let fields = TreatmentFields::from_cells(&row[..FIXED_COLUMNS.len()])
                .map_err(|e| EntryError::Validation(format!("row {}: {}", line, e)))?;
            treatments.push(fields);
        }

        let experiment_id = treatments
            .first()
            .map(|t| t.experiment_id.clone())
            .ok_or_else(|| EntryError::Validation("upload has no treatment rows".into()))?;

        Ok(ExperimentUpload {
            experiment_id,
            treatments,
            traits,
        })
    }
}

/// Read a CSV file into a grid. The first record is the header row.
pub fn from_csv(reader: impl Read) -> Result<Grid> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.iter().map(|h| h.to_string()).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(record?.iter().map(|c| c.to_string()).collect());
    }

    Ok(Grid { headers, rows })
}

/// Read the first worksheet of an XLSX workbook into a grid.
pub fn from_excel<RS: Read + Seek>(mut workbook: Xlsx<RS>) -> Result<Grid> {
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| EntryError::Grid("no sheets found in Excel file".into()))??;
    Ok(range_to_grid(&range))
}

/// Parse an uploaded file held in memory, picking the format by file name.
pub fn from_upload(filename: &str, bytes: &[u8]) -> Result<Grid> {
    let grid = match extension(Path::new(filename)).as_deref() {
        Some("csv") => from_csv(bytes)?,
        Some("xlsx") => from_excel(Xlsx::new(Cursor::new(bytes))?)?,
        Some(ext) => {
            return Err(EntryError::Grid(format!("unsupported file extension: {}", ext)));
        }
        None => return Err(EntryError::Grid("file has no extension".into())),
    };
    debug!(
        "parsed upload '{}': {} columns, {} rows",
        filename,
        grid.headers.len(),
        grid.rows.len()
    );
    Ok(grid)
}

/// Detect the file type from its extension and load it.
pub fn load_grid(filepath: impl AsRef<Path>) -> Result<Grid> {
    let path = filepath.as_ref();
    match extension(path).as_deref() {
        Some("csv") => from_csv(std::fs::File::open(path)?),
        Some("xlsx") => {
            let workbook: Xlsx<_> = open_workbook(path)?;
            from_excel(workbook)
        }
        Some(ext) => Err(EntryError::Grid(format!("unsupported file extension: {}", ext))),
        None => Err(EntryError::Grid("file has no extension".into())),
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

fn range_to_grid(range: &Range<Data>) -> Grid {
    let mut rows = range.rows().map(|row| row.iter().map(cell_text).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    Grid {
        headers,
        rows: rows.collect(),
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        // Excel stores years and block numbers as floats.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn normalize_header(header: &str) -> String {
    WHITESPACE.replace_all(header.trim(), " ").into_owned()
}

/// Convert a 1-based column number to its spreadsheet letter (A, B, …, AA).
pub fn column_letter(col: usize) -> String {
    let mut name = String::new();
    let mut n = col;

    while n > 0 {
        n -= 1;
        name.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }

    name
}
