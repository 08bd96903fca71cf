//! Label sheet ingestion (CSV or Excel).
//!
//! A label sheet lists one scan per row: a column naming the image file and a
//! column with its numeric target. Rows with a blank image name or a label
//! that does not parse as a number are skipped and reported in
//! [`LabelTable::skipped`].

use anyhow::{Context, Result, anyhow};
use calamine::{Data as ExcelData, Reader as _, open_workbook_auto};
use csv::ReaderBuilder;
use log::{debug, warn};
use std::path::Path;

/// Supported label sheet formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelFormat {
    Csv,
    Excel,
}

impl LabelFormat {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Csv => "CSV / Delimited",
            Self::Excel => "Excel",
        }
    }

    /// Parse a user-supplied format token.
    pub fn parse_token(token: &str) -> Result<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "delimited" | "text" => Ok(Self::Csv),
            "excel" | "xlsx" | "xls" | "xlsm" | "ods" => Ok(Self::Excel),
            other => anyhow::bail!("unknown label format '{other}' (supported: csv, excel)"),
        }
    }
}

/// Column selector resolved against the sheet header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnSelector {
    Index(usize),
    Name(String),
}

impl ColumnSelector {
    pub fn describe(&self) -> String {
        match self {
            Self::Index(idx) => format!("column #{idx}"),
            Self::Name(name) => format!("column \"{name}\""),
        }
    }

    /// Parses `#3` or `3` as a zero-based index and anything else as a header name.
    pub fn parse_token(token: &str) -> Result<Self> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            anyhow::bail!("column selector cannot be empty");
        }
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::Index(digits.parse()?));
        }
        Ok(Self::Name(trimmed.to_string()))
    }
}

/// Options that influence how a label sheet is read.
#[derive(Clone, Debug, Default)]
pub struct LabelReadOptions {
    pub format: Option<LabelFormat>,
    pub has_headers: Option<bool>,
    pub delimiter: Option<u8>,
    pub sheet_name: Option<String>,
}

/// One usable row of the label sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelEntry {
    /// Image reference as written in the sheet.
    pub image: String,
    pub value: f64,
    /// One-based data row number, for diagnostics.
    pub row: usize,
}

/// Parsed label rows plus the count of rows that could not be used.
#[derive(Clone, Debug, Default)]
pub struct LabelTable {
    pub entries: Vec<LabelEntry>,
    pub skipped: usize,
}

struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Detects the sheet format from the file extension.
pub fn detect_format(path: &Path) -> LabelFormat {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
        .as_str()
    {
        "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" => LabelFormat::Excel,
        _ => LabelFormat::Csv,
    }
}

/// Loads every usable `(image, label)` row from the sheet.
pub fn load_label_entries(
    path: &Path,
    options: &LabelReadOptions,
    image_column: &ColumnSelector,
    label_column: &ColumnSelector,
) -> Result<LabelTable> {
    let format = options.format.unwrap_or_else(|| detect_format(path));
    debug!("Reading {} label sheet {}", format.display_name(), path.display());
    let table = match format {
        LabelFormat::Csv => read_csv(path, options)?,
        LabelFormat::Excel => read_excel(path, options)?,
    };

    let image_idx = resolve_selector(&table.columns, image_column)?;
    let label_idx = resolve_selector(&table.columns, label_column)?;

    let mut out = LabelTable::default();
    for (idx, row) in table.rows.into_iter().enumerate() {
        let row_no = idx + 1;
        let image = row.get(image_idx).map(|s| s.trim()).unwrap_or_default();
        let raw_label = row.get(label_idx).map(|s| s.trim()).unwrap_or_default();
        if image.is_empty() {
            debug!("label row {row_no}: empty image reference");
            out.skipped += 1;
            continue;
        }
        match parse_label(raw_label) {
            Some(value) => out.entries.push(LabelEntry {
                image: image.to_string(),
                value,
                row: row_no,
            }),
            None => {
                warn!("Skipping label row {row_no} ({image}): '{raw_label}' is not a number");
                out.skipped += 1;
            }
        }
    }
    Ok(out)
}

fn parse_label(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn read_csv(path: &Path, options: &LabelReadOptions) -> Result<RawTable> {
    let has_headers = options.has_headers.unwrap_or(true);
    let delimiter = options.delimiter.unwrap_or_else(|| {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
            _ => b',',
        }
    });
    let mut reader = ReaderBuilder::new()
        .has_headers(has_headers)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut columns = if has_headers {
        reader
            .headers()
            .context("failed to read CSV headers")?
            .iter()
            .enumerate()
            .map(|(idx, raw)| header_or_placeholder(raw.trim(), idx))
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("malformed row in {}", path.display()))?;
        let mut row: Vec<String> = record.iter().map(|v| v.trim().to_string()).collect();
        if row.iter().all(|v| v.is_empty()) {
            continue;
        }
        pad_columns(&mut columns, row.len());
        row.resize(columns.len(), String::new());
        rows.push(row);
    }
    Ok(RawTable { columns, rows })
}

fn read_excel(path: &Path, options: &LabelReadOptions) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let sheet_name = match options
        .sheet_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(explicit) => explicit.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("workbook {} has no sheets", path.display()))?,
    };

    let sheets = workbook.sheet_names();
    if !sheets.contains(&sheet_name) {
        anyhow::bail!(
            "sheet '{sheet_name}' not found in {}; available: {}",
            path.display(),
            sheets.join(", ")
        );
    }
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| anyhow!("failed to read sheet {sheet_name}: {e}"))?;

    let has_headers = options.has_headers.unwrap_or(true);
    let mut rows_iter = range.rows();
    let mut columns = if has_headers {
        rows_iter
            .next()
            .map(|header| {
                header
                    .iter()
                    .enumerate()
                    .map(|(idx, cell)| header_or_placeholder(&excel_cell_text(cell), idx))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for row in rows_iter {
        let mut values: Vec<String> = row.iter().map(excel_cell_text).collect();
        if values.iter().all(|v| v.is_empty()) {
            continue;
        }
        pad_columns(&mut columns, values.len());
        values.resize(columns.len(), String::new());
        rows.push(values);
    }
    Ok(RawTable { columns, rows })
}

fn resolve_selector(columns: &[String], selector: &ColumnSelector) -> Result<usize> {
    match selector {
        ColumnSelector::Index(idx) => {
            anyhow::ensure!(
                *idx < columns.len(),
                "{} is out of range ({} column(s) detected)",
                selector.describe(),
                columns.len()
            );
            Ok(*idx)
        }
        ColumnSelector::Name(name) => columns
            .iter()
            .position(|col| col.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                anyhow!(
                    "column named \"{name}\" not found (available: {})",
                    columns.join(", ")
                )
            }),
    }
}

fn header_or_placeholder(text: &str, idx: usize) -> String {
    if text.is_empty() {
        format!("Column {}", idx + 1)
    } else {
        text.to_string()
    }
}

fn pad_columns(columns: &mut Vec<String>, desired: usize) {
    for idx in columns.len()..desired {
        columns.push(format!("Column {}", idx + 1));
    }
}

fn excel_cell_text(cell: &ExcelData) -> String {
    match cell {
        ExcelData::Empty | ExcelData::Error(_) => String::new(),
        ExcelData::String(s) => s.trim().to_string(),
        ExcelData::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{f:.0}")
            } else {
                f.to_string()
            }
        }
        ExcelData::Int(i) => i.to_string(),
        ExcelData::Bool(b) => b.to_string(),
        ExcelData::DateTime(dt) => dt.as_f64().to_string(),
        ExcelData::DateTimeIso(s) | ExcelData::DurationIso(s) => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write sheet");
        path
    }

    #[test]
    fn selector_tokens() {
        assert_eq!(ColumnSelector::parse_token("#2").unwrap(), ColumnSelector::Index(2));
        assert_eq!(ColumnSelector::parse_token("7").unwrap(), ColumnSelector::Index(7));
        assert_eq!(
            ColumnSelector::parse_token(" Label ").unwrap(),
            ColumnSelector::Name("Label".into())
        );
        assert!(ColumnSelector::parse_token("  ").is_err());
    }

    #[test]
    fn detects_format_from_extension() {
        assert_eq!(detect_format(Path::new("Meta_pic_3.xlsx")), LabelFormat::Excel);
        assert_eq!(detect_format(Path::new("labels.ODS")), LabelFormat::Excel);
        assert_eq!(detect_format(Path::new("labels.csv")), LabelFormat::Csv);
        assert_eq!(detect_format(Path::new("labels")), LabelFormat::Csv);
    }

    #[test]
    fn loads_named_columns_and_skips_bad_rows() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "labels.csv",
            "Filename,Operator,Label\nscan_01.png,a,12.5\nscan_02.png,b,n/a\n,c,3\nscan_03.png,d,\"7,25\"\n",
        );
        let table = load_label_entries(
            &path,
            &LabelReadOptions::default(),
            &ColumnSelector::Name("filename".into()),
            &ColumnSelector::Name("LABEL".into()),
        )
        .unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.skipped, 2);
        assert_eq!(table.entries[0].image, "scan_01.png");
        assert_eq!(table.entries[0].value, 12.5);
        assert_eq!(table.entries[1].value, 7.25);
        assert_eq!(table.entries[1].row, 4);
    }

    #[test]
    fn loads_indexed_columns_without_headers() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "labels.tsv", "a.png\t1\nb.png\t2.5\n");
        let options = LabelReadOptions {
            has_headers: Some(false),
            ..Default::default()
        };
        let table = load_label_entries(
            &path,
            &options,
            &ColumnSelector::Index(0),
            &ColumnSelector::Index(1),
        )
        .unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[1].image, "b.png");
    }

    #[test]
    fn unknown_column_lists_available_headers() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "labels.csv", "name,value\na.png,1\n");
        let err = load_label_entries(
            &path,
            &LabelReadOptions::default(),
            &ColumnSelector::Name("filename".into()),
            &ColumnSelector::Name("value".into()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("available: name, value"));
    }

    #[test]
    fn missing_workbook_is_an_error() {
        let dir = tempdir().unwrap();
        let err = load_label_entries(
            &dir.path().join("missing.xlsx"),
            &LabelReadOptions::default(),
            &ColumnSelector::Name("filename".into()),
            &ColumnSelector::Name("label".into()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to open workbook"), "{err}");
    }
}
