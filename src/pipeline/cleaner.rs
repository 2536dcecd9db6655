//! Row cleaning: coerce every raw cell into the representation its schema
//! field declares, or record why it could not be coerced.
//!
//! Field failures are data. A row with at least one failure is left out of the
//! load batch and all of its failures are reported, never just the first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::constants::is_null_token;
use crate::error::{EtlError, Result};
use crate::pipeline::columns::normalize_headers;
use crate::pipeline::dates::{DateResolution, DateResolver};
use crate::pipeline::schema::{ColumnBinding, FieldKind, FieldSchema, RowRule, TableSchema};
use crate::types::{CleanRow, CleanValue, RawRow, RawValue, SourceTable};

/// How enum cells that do not match a declared value exactly are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumMatching {
    #[default]
    Strict,
    /// Also accept a cell one edit away from exactly one declared value.
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanerOptions {
    pub day_first: bool,
    pub enum_matching: EnumMatching,
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            day_first: true,
            enum_matching: EnumMatching::Strict,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("required value is missing")]
    Missing,
    #[error("not a number")]
    NotANumber,
    #[error("not a whole number")]
    NotAnInteger,
    #[error("{}", describe_range(.min, .max))]
    OutOfRange { min: Option<f64>, max: Option<f64> },
    #[error("not one of [{}]", .allowed.join(", "))]
    NotInEnum { allowed: Vec<String> },
    #[error("not a recognised date")]
    InvalidDate,
    #[error("longer than {max} characters")]
    TooLong { max: usize },
    #[error("{rule}")]
    RuleViolated { rule: String },
}

fn describe_range(min: &Option<f64>, max: &Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("outside the range [{lo}, {hi}]"),
        (Some(lo), None) => format!("below the minimum {lo}"),
        (None, Some(hi)) => format!("above the maximum {hi}"),
        (None, None) => "out of range".to_string(),
    }
}

/// One field of one row that could not be cleaned
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFailure {
    pub field: String,
    #[serde(flatten)]
    pub reason: FailureReason,
    pub raw: Option<String>,
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "{}: '{}' {}", self.field, raw, self.reason),
            None => write!(f, "{}: {}", self.field, self.reason),
        }
    }
}

/// Every failure of one rejected row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub source_index: usize,
    /// 1-based row number as seen in the sheet, header row included.
    pub sheet_row: usize,
    pub failures: Vec<FieldFailure>,
}

/// Result of cleaning a whole worksheet. `rows` and `failures` both keep
/// source order.
#[derive(Debug, Clone, Default)]
pub struct CleanOutcome {
    pub headers: Vec<String>,
    pub rows: Vec<CleanRow>,
    pub failures: Vec<RowFailure>,
    pub blank: usize,
}

impl CleanOutcome {
    pub fn non_blank(&self) -> usize {
        self.rows.len() + self.failures.len()
    }
}

pub struct RecordCleaner {
    schema: TableSchema,
    options: CleanerOptions,
    dates: DateResolver,
    currency: Regex,
    unit_suffix: Regex,
    plain_number: Regex,
}

impl RecordCleaner {
    pub fn new(schema: TableSchema, options: CleanerOptions) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            dates: DateResolver::new(options.day_first),
            schema,
            options,
            currency: compile(r"(?i)[$€£₦¥]|\b(?:ngn|usd|eur|gbp)\b")?,
            unit_suffix: compile(
                r"(?i)\s*(?:kg|kgs|g|gm|gram|grams|mg|°c|c|%|mm|cm|l|ltr|ml|pcs|bags?)\.?$",
            )?,
            plain_number: compile(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?$")?,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Clean a whole worksheet. Headers are normalized and bound to the schema
    /// before any row is touched; a failure there is a stage-level error.
    pub fn clean_table(&self, table: &SourceTable) -> Result<CleanOutcome> {
        let headers = normalize_headers(&table.headers)?;
        let binding = self.schema.bind(&headers)?;

        let mut outcome = CleanOutcome::default();
        for (index, cells) in table.rows.iter().enumerate() {
            let row = RawRow::new(&headers, cells);
            if row.is_blank() {
                outcome.blank += 1;
                continue;
            }
            match self.clean_row(&binding, index, row) {
                Ok(clean) => outcome.rows.push(clean),
                Err(failures) => {
                    debug!(
                        table = %self.schema.table,
                        row = index,
                        failures = failures.len(),
                        "row rejected"
                    );
                    outcome.failures.push(RowFailure {
                        source_index: index,
                        sheet_row: index + 2,
                        failures,
                    });
                }
            }
        }

        outcome.headers = headers;
        Ok(outcome)
    }

    /// Clean one row against a binding produced by [`TableSchema::bind`].
    pub fn clean_row(
        &self,
        binding: &ColumnBinding,
        source_index: usize,
        row: RawRow<'_>,
    ) -> std::result::Result<CleanRow, Vec<FieldFailure>> {
        let mut clean = CleanRow::new(source_index);
        let mut failures = Vec::new();
        let empty = RawValue::Empty;

        for (i, field) in self.schema.fields.iter().enumerate() {
            let raw = binding
                .position(i)
                .and_then(|p| row.at(p))
                .unwrap_or(&empty);

            match self.clean_field(field, raw) {
                Ok(value) => {
                    clean.values.insert(field.name.clone(), value);
                }
                Err(reason) => failures.push(FieldFailure {
                    field: field.name.clone(),
                    reason,
                    raw: raw.display(),
                }),
            }
        }

        for rule in &self.schema.rules {
            let RowRule::NotBefore { field, reference } = rule;
            if failures.iter().any(|f| &f.field == field || &f.field == reference) {
                continue;
            }
            let (Some(value), Some(bound)) =
                (sort_key(clean.get(field)), sort_key(clean.get(reference)))
            else {
                continue;
            };
            if value < bound {
                failures.push(FieldFailure {
                    field: field.clone(),
                    reason: FailureReason::RuleViolated {
                        rule: format!("must not be before {reference}"),
                    },
                    raw: Some(clean.get(field).to_string()),
                });
            }
        }

        if failures.is_empty() {
            Ok(clean)
        } else {
            Err(failures)
        }
    }

    fn clean_field(
        &self,
        field: &FieldSchema,
        raw: &RawValue,
    ) -> std::result::Result<CleanValue, FailureReason> {
        let defaulted;
        let raw = if is_absent(raw) {
            match &field.default {
                Some(default) => {
                    defaulted = RawValue::Text(default.clone());
                    &defaulted
                }
                None if field.required => return Err(FailureReason::Missing),
                None => return Ok(CleanValue::Null),
            }
        } else {
            raw
        };

        match &field.kind {
            FieldKind::Text { max_len } => {
                let text = text_of(raw);
                match max_len {
                    Some(max) if text.chars().count() > *max => {
                        Err(FailureReason::TooLong { max: *max })
                    }
                    _ => Ok(CleanValue::Text(text)),
                }
            }
            FieldKind::Reference { .. } => Ok(CleanValue::Text(text_of(raw))),
            FieldKind::Integer { min, max } => {
                let n = self.parse_number(raw)?;
                if n.fract() != 0.0 || n.abs() > i64::MAX as f64 {
                    return Err(FailureReason::NotAnInteger);
                }
                let n = n as i64;
                let below = min.is_some_and(|lo| n < lo);
                let above = max.is_some_and(|hi| n > hi);
                if below || above {
                    return Err(FailureReason::OutOfRange {
                        min: min.map(|v| v as f64),
                        max: max.map(|v| v as f64),
                    });
                }
                Ok(CleanValue::Integer(n))
            }
            FieldKind::Decimal { min, max, scale } => {
                let mut n = self.parse_number(raw)?;
                if let Some(digits) = scale {
                    let factor = 10f64.powi(*digits as i32);
                    n = (n * factor).round() / factor;
                }
                let below = min.is_some_and(|lo| n < lo);
                let above = max.is_some_and(|hi| n > hi);
                if below || above {
                    return Err(FailureReason::OutOfRange {
                        min: *min,
                        max: *max,
                    });
                }
                Ok(CleanValue::Float(n))
            }
            FieldKind::Enum { values } => self
                .match_enum(values, &text_of(raw))
                .map(|v| CleanValue::Text(v.to_string()))
                .ok_or_else(|| FailureReason::NotInEnum {
                    allowed: values.clone(),
                }),
            FieldKind::Date | FieldKind::Timestamp => {
                match self.dates.resolve(&field.name, raw) {
                    Ok(DateResolution::Resolved(ts)) if field.kind == FieldKind::Date => {
                        Ok(CleanValue::Date(ts.date()))
                    }
                    Ok(DateResolution::Resolved(ts)) => Ok(CleanValue::Timestamp(ts)),
                    Ok(DateResolution::Absent) if field.required => Err(FailureReason::Missing),
                    Ok(DateResolution::Absent) => Ok(CleanValue::Null),
                    Err(_) => Err(FailureReason::InvalidDate),
                }
            }
        }
    }

    fn parse_number(&self, raw: &RawValue) -> std::result::Result<f64, FailureReason> {
        let text = match raw {
            RawValue::Number(n) if n.is_finite() => return Ok(*n),
            RawValue::Number(_) | RawValue::Empty => return Err(FailureReason::NotANumber),
            RawValue::Text(s) => s,
        };

        let stripped = self.currency.replace_all(text.trim(), "");
        let stripped = self.unit_suffix.replace(stripped.trim(), "");
        let compact: String = stripped
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
            .collect();

        if !self.plain_number.is_match(&compact) {
            return Err(FailureReason::NotANumber);
        }
        compact
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or(FailureReason::NotANumber)
    }

    fn match_enum<'v>(&self, values: &'v [String], cell: &str) -> Option<&'v str> {
        let key = enum_key(cell);
        if let Some(exact) = values.iter().find(|v| enum_key(v) == key) {
            return Some(exact);
        }
        if self.options.enum_matching == EnumMatching::Strict {
            return None;
        }

        let mut close = values
            .iter()
            .filter(|v| edit_distance(&enum_key(v), &key) <= 1);
        match (close.next(), close.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EtlError::Config(format!("invalid pattern: {e}")))
}

fn is_absent(raw: &RawValue) -> bool {
    match raw {
        RawValue::Empty => true,
        RawValue::Number(n) => n.is_nan(),
        RawValue::Text(s) => is_null_token(s),
    }
}

fn text_of(raw: &RawValue) -> String {
    match raw {
        RawValue::Empty => String::new(),
        // 12.0 -> "12", so numeric-looking names read the way they were typed.
        RawValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        RawValue::Number(n) => n.to_string(),
        RawValue::Text(s) => s.trim().to_string(),
    }
}

fn enum_key(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn sort_key(value: &CleanValue) -> Option<chrono::NaiveDateTime> {
    match value {
        CleanValue::Date(d) => Some(d.and_time(chrono::NaiveTime::MIN)),
        CleanValue::Timestamp(ts) => Some(*ts),
        _ => None,
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
