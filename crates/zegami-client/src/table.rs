// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Tabular row data: parsing, serialization, filtering and tags.
//!
//! Collection data is served as tab-separated text. Older collections may
//! still hold a spreadsheet, which is decoded with calamine.

use crate::Error;
use calamine::{Data, Reader as _, open_workbook_auto_from_rs};
use log::{debug, warn};
use polars::{
    io::{SerReader as _, SerWriter as _},
    prelude::*,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
};

static EMPTY_CELL: Data = Data::Empty;

const SPREADSHEET_MIME_TYPES: [&str; 5] = [
    "application/zip",
    "application/x-ole-storage",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.oasis.opendocument.spreadsheet",
];

/// Parses collection row data into a DataFrame.
///
/// Bytes that sniff as a spreadsheet go straight to calamine; everything else
/// is read as TSV, falling back to calamine when that fails.
pub fn parse_rows(bytes: &[u8]) -> Result<DataFrame, Error> {
    let sniffed = infer::get(bytes).map(|kind| kind.mime_type());
    if let Some(mime) = sniffed
        && SPREADSHEET_MIME_TYPES.contains(&mime)
    {
        debug!("Row data sniffed as {}", mime);
        return parse_spreadsheet(bytes);
    }

    match parse_tsv(bytes) {
        Ok(df) => Ok(df),
        Err(tsv_err) => {
            warn!("Row data is not valid TSV ({}), trying spreadsheet", tsv_err);
            parse_spreadsheet(bytes).map_err(|sheet_err| {
                Error::UnsupportedFormat(format!(
                    "row data is neither TSV ({}) nor a spreadsheet ({})",
                    tsv_err, sheet_err
                ))
            })
        }
    }
}

pub fn parse_tsv(bytes: &[u8]) -> Result<DataFrame, Error> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|opts| opts.with_separator(b'\t'))
        .into_reader_with_file_handle(Cursor::new(bytes.to_vec()))
        .finish()?;
    Ok(df)
}

/// Decodes the first worksheet of an xlsx, xls or ods workbook.
///
/// The first row holds the column names. Columns whose cells are all whole
/// numbers become `Int64`, other numeric columns `Float64`, all-boolean
/// columns `Boolean`, and anything else `String`. Empty cells are null.
pub fn parse_spreadsheet(bytes: &[u8]) -> Result<DataFrame, Error> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::UnsupportedFormat("workbook has no worksheets".to_string()))??;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| Error::UnsupportedFormat("worksheet is empty".to_string()))?;
    let names = header
        .iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Data::Empty => format!("column_{}", i),
            cell => cell.to_string(),
        })
        .collect::<Vec<_>>();

    let body = rows.collect::<Vec<_>>();
    let columns = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let cells = body
                .iter()
                .map(|row| row.get(i).unwrap_or(&EMPTY_CELL))
                .collect::<Vec<_>>();
            spreadsheet_column(name, &cells)
        })
        .collect::<Vec<_>>();

    Ok(DataFrame::new(columns)?)
}

fn spreadsheet_column(name: &str, cells: &[&Data]) -> Column {
    let filled = cells
        .iter()
        .filter(|cell| !matches!(cell, Data::Empty))
        .collect::<Vec<_>>();

    let numeric = filled
        .iter()
        .all(|cell| matches!(cell, Data::Int(_) | Data::Float(_)));
    let whole = filled.iter().all(|cell| match cell {
        Data::Int(_) => true,
        Data::Float(f) => f.fract() == 0.0,
        _ => false,
    });
    let boolean = filled.iter().all(|cell| matches!(cell, Data::Bool(_)));

    let series = if !filled.is_empty() && numeric && whole {
        let values = cells
            .iter()
            .map(|cell| match cell {
                Data::Int(i) => Some(*i),
                Data::Float(f) => Some(*f as i64),
                _ => None,
            })
            .collect::<Vec<_>>();
        Series::new(name.into(), values)
    } else if !filled.is_empty() && numeric {
        let values = cells
            .iter()
            .map(|cell| match cell {
                Data::Int(i) => Some(*i as f64),
                Data::Float(f) => Some(*f),
                _ => None,
            })
            .collect::<Vec<_>>();
        Series::new(name.into(), values)
    } else if !filled.is_empty() && boolean {
        let values = cells
            .iter()
            .map(|cell| match cell {
                Data::Bool(b) => Some(*b),
                _ => None,
            })
            .collect::<Vec<_>>();
        Series::new(name.into(), values)
    } else {
        let values = cells
            .iter()
            .map(|cell| match cell {
                Data::Empty => None,
                cell => Some(cell.to_string()),
            })
            .collect::<Vec<_>>();
        Series::new(name.into(), values)
    };

    Column::from(series)
}

/// Serializes a DataFrame as tab-separated text with a header row.
pub fn write_tsv(df: &DataFrame) -> Result<Vec<u8>, Error> {
    let mut df = df.clone();
    let mut buf = Vec::new();
    CsvWriter::new(&mut buf)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut df)?;
    Ok(buf)
}

/// A value a filtered column may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        FilterValue::Int(value as i64)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Float(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Str(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Str(value)
    }
}

impl FilterValue {
    /// Interprets command line text: integers, then floats, then booleans,
    /// and `null`; anything else is a string. Text wrapped in single or
    /// double quotes is always a string, so `'007'` keeps its zeros.
    pub fn parse(text: &str) -> Self {
        for quote in ['\'', '"'] {
            if let Some(inner) = text
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
            {
                return FilterValue::Str(inner.to_string());
            }
        }
        if let Ok(i) = text.parse::<i64>() {
            FilterValue::Int(i)
        } else if let Ok(f) = text.parse::<f64>() {
            FilterValue::Float(f)
        } else {
            match text {
                "true" | "True" => FilterValue::Bool(true),
                "false" | "False" => FilterValue::Bool(false),
                "null" => FilterValue::Null,
                text => FilterValue::Str(text.to_string()),
            }
        }
    }

    fn matches(&self, value: &AnyValue) -> bool {
        match self {
            FilterValue::Null => matches!(value, AnyValue::Null),
            FilterValue::Int(i) => numeric(value) == Some(*i as f64),
            FilterValue::Float(f) => numeric(value) == Some(*f),
            FilterValue::Bool(b) => matches!(value, AnyValue::Boolean(v) if v == b),
            FilterValue::Str(s) => match value {
                AnyValue::String(v) => v == s,
                AnyValue::StringOwned(v) => v.as_str() == s,
                _ => false,
            },
        }
    }
}

fn numeric(value: &AnyValue) -> Option<f64> {
    match *value {
        AnyValue::Int32(v) => Some(v as f64),
        AnyValue::Int64(v) => Some(v as f64),
        AnyValue::UInt32(v) => Some(v as f64),
        AnyValue::UInt64(v) => Some(v as f64),
        AnyValue::Float32(v) => Some(v as f64),
        AnyValue::Float64(v) => Some(v),
        _ => None,
    }
}

/// Column filter: a row passes when, for every column, its value is one of
/// the allowed values for that column.
///
/// ```rust
/// use zegami_client::RowFilter;
///
/// let filter = RowFilter::new()
///     .column("breed", ["Cairn", "Dingo"])
///     .column("age", [3]);
/// assert_eq!(filter.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    columns: Vec<(String, Vec<FilterValue>)>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `values` in column `name`. Repeating a column replaces its
    /// allowed values.
    pub fn column<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        match self.columns.iter_mut().find(|(column, _)| column == name) {
            Some(entry) => entry.1 = values,
            None => self.columns.push((name.to_string(), values)),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Row positions of `df` that pass the filter.
    pub fn matching_rows(&self, df: &DataFrame) -> Result<Vec<usize>, Error> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for (name, allowed) in &self.columns {
            let column = df.column(name).map_err(|_| {
                let available = df
                    .get_column_names()
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>();
                Error::InvalidParameters(format!(
                    "unknown column '{}', available: [{}]",
                    name,
                    available.join(", ")
                ))
            })?;
            columns.push((column, allowed));
        }

        let mut rows = Vec::new();
        'rows: for row in 0..df.height() {
            for (column, allowed) in &columns {
                let value = column.get(row)?;
                if !allowed.iter().any(|wanted| wanted.matches(&value)) {
                    continue 'rows;
                }
            }
            rows.push(row);
        }

        Ok(rows)
    }
}

/// A selection of rows with their positions in the full row table.
#[derive(Debug, Clone)]
pub struct RowSubset {
    indices: Vec<usize>,
    frame: DataFrame,
}

impl RowSubset {
    /// Selects `indices` of `df`, in the given order.
    pub fn select(df: &DataFrame, indices: Vec<usize>) -> Result<Self, Error> {
        if let Some(bad) = indices.iter().find(|&&i| i >= df.height()) {
            return Err(Error::OutOfRange(format!(
                "row index {} for {} rows",
                bad,
                df.height()
            )));
        }

        let idx = IdxCa::from_vec(
            "idx".into(),
            indices.iter().map(|&i| i as IdxSize).collect(),
        );
        let frame = df.take(&idx)?;
        Ok(RowSubset { indices, frame })
    }

    /// Row positions in the full table.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Tag name to tagged row positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagIndex {
    tags: BTreeMap<String, Vec<usize>>,
}

impl TagIndex {
    /// Builds the index from `tagRecords` entries of the form
    /// `{"key": row, "tag": name}`. Row keys may be numbers or numeric
    /// strings; other records are skipped with a warning.
    pub fn from_records(records: &[serde_json::Value]) -> Self {
        let mut tags: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for record in records {
            let key = record.get("key").and_then(|key| match key {
                serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });
            let tag = record.get("tag").and_then(|tag| tag.as_str());

            match (key, tag) {
                (Some(key), Some(tag)) => tags.entry(tag.to_string()).or_default().push(key),
                _ => warn!("Skipping malformed tag record {}", record),
            }
        }
        TagIndex { tags }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn get(&self, tag: &str) -> Option<&[usize]> {
        self.tags.get(tag).map(Vec::as_slice)
    }

    /// Sorted, de-duplicated rows carrying any of `tags`.
    pub fn rows_for<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<usize>, Error> {
        let mut rows = BTreeSet::new();
        for tag in tags {
            let tag = tag.as_ref();
            let tagged = self.tags.get(tag).ok_or_else(|| {
                Error::NotFound(format!(
                    "tag '{}', available: [{}]",
                    tag,
                    self.names().collect::<Vec<_>>().join(", ")
                ))
            })?;
            rows.extend(tagged.iter().copied());
        }
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DataFrame {
        parse_rows(b"name\ta\tb\nr0\t1\t3\nr1\t2\t3\nr2\t3\t3\nr3\t1\t4\nr4\t2\t\n").unwrap()
    }

    #[test]
    fn test_parse_tsv() {
        let df = sample();
        assert_eq!(df.height(), 5);
        assert_eq!(df.width(), 3);
        assert_eq!(df.column("a").unwrap().dtype(), &DataType::Int64);
    }

    #[test]
    fn test_filter_is_conjunction_of_disjunctions() {
        let df = sample();
        let filter = RowFilter::new().column("a", [1, 2]).column("b", [3]);
        assert_eq!(filter.matching_rows(&df).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_empty_filter_returns_all_rows() {
        let df = sample();
        assert_eq!(RowFilter::new().matching_rows(&df).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_filter_strings_and_nulls() {
        let df = sample();
        let filter = RowFilter::new().column("name", ["r2", "r4"]);
        assert_eq!(filter.matching_rows(&df).unwrap(), vec![2, 4]);

        let filter = RowFilter::new().column("b", [FilterValue::Null]);
        assert_eq!(filter.matching_rows(&df).unwrap(), vec![4]);
    }

    #[test]
    fn test_unknown_column_lists_available() {
        let df = sample();
        match RowFilter::new().column("c", [1]).matching_rows(&df) {
            Err(Error::InvalidParameters(msg)) => assert!(msg.contains("name, a, b")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_select_keeps_positions() {
        let df = sample();
        let subset = RowSubset::select(&df, vec![3, 1]).unwrap();
        assert_eq!(subset.indices(), &[3, 1]);
        assert_eq!(subset.frame().height(), 2);
        assert!(matches!(RowSubset::select(&df, vec![5]), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_tag_union_without_duplicates() {
        let tags = TagIndex::from_records(&[
            json!({"key": 0, "tag": "x"}),
            json!({"key": "2", "tag": "x"}),
            json!({"key": 2, "tag": "y"}),
            json!({"key": 4, "tag": "y"}),
            json!({"tag": "broken"}),
        ]);

        assert_eq!(tags.rows_for(&["x", "y"]).unwrap(), vec![0, 2, 4]);
        assert_eq!(tags.names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert!(matches!(tags.rows_for(&["z"]), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_tsv_written_back_parses() {
        let df = sample();
        let bytes = write_tsv(&df).unwrap();
        assert!(bytes.starts_with(b"name\ta\tb\n"));
        assert_eq!(parse_tsv(&bytes).unwrap().height(), 5);
    }

    #[test]
    fn test_filter_value_parse() {
        assert_eq!(FilterValue::parse("3"), FilterValue::Int(3));
        assert_eq!(FilterValue::parse("0.5"), FilterValue::Float(0.5));
        assert_eq!(FilterValue::parse("true"), FilterValue::Bool(true));
        assert_eq!(FilterValue::parse("Cairn"), FilterValue::Str("Cairn".to_string()));
        assert_eq!(FilterValue::parse("'"), FilterValue::Str("'".to_string()));
    }

    #[test]
    fn test_quoted_filter_value_stays_string() {
        assert_eq!(FilterValue::parse("007"), FilterValue::Int(7));
        assert_eq!(FilterValue::parse("'007'"), FilterValue::Str("007".to_string()));
        assert_eq!(FilterValue::parse("\"true\""), FilterValue::Str("true".to_string()));

        let df = df!("code" => ["007", "7", "070"]).unwrap();
        let quoted = RowFilter::new().column("code", [FilterValue::parse("'007'")]);
        assert_eq!(quoted.matching_rows(&df).unwrap(), vec![0]);
        let bare = RowFilter::new().column("code", [FilterValue::parse("007")]);
        assert!(bare.matching_rows(&df).unwrap().is_empty());
    }
}
