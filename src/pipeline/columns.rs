//! Header canonicalization.
//!
//! Spreadsheet headers are typed by hand ("Feed Eaten (gram)", " Mortality ",
//! "pH-Level"). Every label is folded into a stable snake_case field name
//! before any schema lookup happens.

use std::collections::HashMap;

use crate::error::{EtlError, Result};

/// Normalize a single header label.
///
/// Trims, lower-cases, collapses every run of whitespace or punctuation into a
/// single underscore and strips leading/trailing underscores. The output only
/// contains alphanumerics and single inner underscores, so normalizing twice is
/// the same as normalizing once.
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;

    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            // Some capitals lower-case into a letter plus a combining mark
            // ('İ' -> "i\u{307}"); only the alphanumeric part is kept.
            out.extend(ch.to_lowercase().filter(|c| c.is_alphanumeric()));
        } else {
            pending_sep = true;
        }
    }

    out
}

/// Normalize a full header row, preserving length and order.
///
/// A label that normalizes to nothing (e.g. "###") is named after its 1-based
/// position. Two labels that land on the same canonical name are a schema
/// error: the row mapping would otherwise be ambiguous.
pub fn normalize_headers(headers: &[String]) -> Result<Vec<String>> {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(headers.len());
    let mut normalized = Vec::with_capacity(headers.len());

    for (i, raw) in headers.iter().enumerate() {
        let mut name = normalize_label(raw);
        if name.is_empty() {
            name = format!("column_{}", i + 1);
        }

        if let Some(first) = seen.get(&name) {
            return Err(EtlError::schema(
                format!(
                    "duplicate column '{}' (from headers '{}' and '{}')",
                    name, headers[*first], raw
                ),
                Some(&name),
            ));
        }

        seen.insert(name.clone(), i);
        normalized.push(name);
    }

    Ok(normalized)
}
