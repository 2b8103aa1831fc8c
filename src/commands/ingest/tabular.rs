use std::io::{Cursor, Read};

use anyhow::Context;
use csv::{ReaderBuilder, StringRecord, Trim};
use regex::Regex;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::error::{PipelineError, StageResultExt};

#[derive(Debug, Clone)]
pub struct EntryPredicate {
    pattern: Regex,
    exclude: Option<String>,
}

impl EntryPredicate {
    pub fn new(pattern: &str, exclude: Option<&str>) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("failed to compile entry pattern {pattern:?}"))?;
        let exclude = exclude
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        Ok(Self { pattern, exclude })
    }

    pub fn matches(&self, entry_name: &str) -> bool {
        let file_name = entry_name.rsplit('/').next().unwrap_or(entry_name);
        if let Some(exclude) = &self.exclude {
            if file_name.contains(exclude.as_str()) {
                return false;
            }
        }
        self.pattern.is_match(file_name)
    }
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub year_column: String,
    pub value_column: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            year_column: "Year".to_string(),
            value_column: "Value".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YearValue {
    pub year: i32,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct ExtractedTable {
    pub entry_name: String,
    pub rows: Vec<YearValue>,
    pub dropped_rows: usize,
}

pub fn extract_year_values(
    bytes: &[u8],
    predicate: &EntryPredicate,
    schema: &TableSchema,
) -> Result<ExtractedTable, PipelineError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .context("failed to open indicator archive")
        .or_source_unavailable()?;

    let mut selected = None;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read indicator archive entry {index}"))
            .or_source_unavailable()?;
        if entry.is_dir() {
            continue;
        }
        if predicate.matches(entry.name()) {
            selected = Some(index);
            break;
        }
        debug!(entry = entry.name(), "skipping archive entry");
    }

    let Some(index) = selected else {
        return Err(PipelineError::source_unavailable(
            "indicator archive has no entry matching the data file pattern",
        ));
    };

    let entry = archive
        .by_index(index)
        .with_context(|| format!("failed to open indicator archive entry {index}"))
        .or_source_unavailable()?;
    let entry_name = entry.name().to_string();
    info!(entry = %entry_name, "selected indicator data file");

    let (rows, dropped_rows) = parse_year_values(entry, schema)?;
    Ok(ExtractedTable {
        entry_name,
        rows,
        dropped_rows,
    })
}

/// Column layout found at the header row.
///
/// World Bank downloads are wide (one column per year) and carry a few
/// preamble lines before the header; hand-made extracts are long
/// (`Year`/`Value` columns).
#[derive(Debug, Clone)]
enum TableLayout {
    Long { year: usize, value: usize },
    Wide { years: Vec<(usize, i32)> },
}

pub fn parse_year_values<R: Read>(
    reader: R,
    schema: &TableSchema,
) -> Result<(Vec<YearValue>, usize), PipelineError> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut layout = None;
    let mut preamble_lines = 0_usize;
    let mut rows = Vec::new();
    let mut dropped = 0_usize;

    for record in csv_reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                if layout.is_some() {
                    dropped += 1;
                }
                debug!(error = %err, "unreadable indicator record");
                continue;
            }
        };
        let line = record.position().map(|position| position.line()).unwrap_or_default();

        if layout.is_none() {
            layout = detect_layout(&record, schema);
            match &layout {
                Some(found) => info!(
                    line,
                    preamble_lines,
                    layout = layout_label(found),
                    "found indicator header row"
                ),
                None => preamble_lines += 1,
            }
            continue;
        }

        match &layout {
            None => {}
            Some(TableLayout::Long { year, value }) => {
                let parsed = parse_year(record.get(*year)).and_then(|year| {
                    parse_value(record.get(*value)).map(|value| YearValue { year, value })
                });
                match parsed {
                    Some(row) => rows.push(row),
                    None => {
                        dropped += 1;
                        debug!(line, "dropping unparseable indicator row");
                    }
                }
            }
            Some(TableLayout::Wide { years }) => {
                for (column, year) in years {
                    match parse_value(record.get(*column)) {
                        Some(value) => rows.push(YearValue { year: *year, value }),
                        None => {
                            dropped += 1;
                            debug!(line, year, "dropping empty or unparseable year cell");
                        }
                    }
                }
            }
        }
    }

    if layout.is_none() {
        return Err(PipelineError::malformed(format!(
            "indicator table has no {:?}/{:?} header and no year-named columns",
            schema.year_column, schema.value_column
        )));
    }
    if dropped > 0 {
        warn!(dropped, kept = rows.len(), "dropped malformed indicator rows");
    }
    if rows.is_empty() {
        return Err(PipelineError::malformed(format!(
            "indicator table has no parseable rows ({dropped} dropped)"
        )));
    }

    Ok((rows, dropped))
}

fn detect_layout(record: &StringRecord, schema: &TableSchema) -> Option<TableLayout> {
    let year = column_index(record, &schema.year_column);
    let value = column_index(record, &schema.value_column);
    if let (Some(year), Some(value)) = (year, value) {
        return Some(TableLayout::Long { year, value });
    }

    // A header row has at least one label next to its year columns.
    let has_label = record
        .iter()
        .map(normalize_header)
        .any(|cell| !cell.is_empty() && cell.parse::<f64>().is_err());
    let years = record
        .iter()
        .enumerate()
        .filter_map(|(index, cell)| year_header(normalize_header(cell)).map(|year| (index, year)))
        .collect::<Vec<_>>();

    (has_label && !years.is_empty()).then_some(TableLayout::Wide { years })
}

fn layout_label(layout: &TableLayout) -> &'static str {
    match layout {
        TableLayout::Long { .. } => "long",
        TableLayout::Wide { .. } => "wide",
    }
}

fn normalize_header(cell: &str) -> &str {
    cell.trim_start_matches('\u{feff}').trim()
}

fn year_header(cell: &str) -> Option<i32> {
    if cell.len() == 4 && cell.bytes().all(|byte| byte.is_ascii_digit()) {
        return cell.parse().ok();
    }
    None
}

fn column_index(headers: &StringRecord, wanted: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| normalize_header(header).eq_ignore_ascii_case(wanted.trim()))
}

fn parse_year(cell: Option<&str>) -> Option<i32> {
    cell?.trim().parse().ok()
}

fn parse_value(cell: Option<&str>) -> Option<f64> {
    let value = cell?.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}
