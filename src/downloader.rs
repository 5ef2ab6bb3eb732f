use rust_xlsxwriter::{Format, Workbook, Worksheet};

use crate::error::{EntryError, Result};
use crate::model::{CellValue, EntryStatus};
use crate::observations::WideGrid;

/// Download format for a wide grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            other => Err(EntryError::Validation(format!(
                "unsupported export format '{}'",
                other
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

/// File name offered for a download, e.g. `Submitted_data.xlsx`.
pub fn export_filename(status: Option<EntryStatus>, format: ExportFormat) -> String {
    let prefix = status.map(|s| s.as_str()).unwrap_or("all");
    format!("{}_data.{}", prefix, format.extension())
}

/// Serialize a grid in the requested format.
pub fn render(grid: &WideGrid, format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Csv => Ok(to_csv(grid)?.into_bytes()),
        ExportFormat::Xlsx => to_xlsx(grid),
    }
}

/// Convert a wide grid to CSV.
///
/// The header row holds the seven fixed column names followed by the trait
/// names; blank cells stay empty.
pub fn to_csv(grid: &WideGrid) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(grid.headers())?;

    for row in &grid.rows {
        let record: Vec<String> = row
            .fields
            .as_cells()
            .iter()
            .map(|c| c.to_string())
            .chain(row.values.iter().map(|v| v.to_string()))
            .collect();
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| EntryError::Grid(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| EntryError::Grid(e.to_string()))
}

/// Convert a wide grid to an XLSX workbook held in memory.
///
/// Numeric-looking fixed fields (year, replication, block) and numeric trait
/// values are written as numbers so the sheet stays sortable in Excel.
pub fn to_xlsx(grid: &WideGrid) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    let bold = Format::new().set_bold();

    for (c, header) in grid.headers().iter().enumerate() {
        worksheet.write_string_with_format(0, c as u16, header.as_str(), &bold)?;
    }

    for (r, row) in grid.rows.iter().enumerate() {
        let r = (r + 1) as u32;
        for (c, field) in row.fields.as_cells().iter().enumerate() {
            match field.parse::<f64>().ok().filter(|n| n.is_finite()) {
                Some(n) => worksheet.write_number(r, c as u16, n)?,
                None => worksheet.write_string(r, c as u16, *field)?,
            };
        }
        let offset = row.fields.as_cells().len();
        for (c, value) in row.values.iter().enumerate() {
            let c = (offset + c) as u16;
            match value {
                CellValue::Number(n) => {
                    worksheet.write_number(r, c, *n)?;
                }
                CellValue::Text(s) => {
                    worksheet.write_string(r, c, s.as_str())?;
                }
                CellValue::Empty => {}
            }
        }
    }

    workbook.push_worksheet(worksheet);
    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}
