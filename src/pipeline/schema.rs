//! Target-schema descriptors.
//!
//! A [`TableSchema`] tells the cleaner how to coerce each field and tells the
//! sink which columns to write and which of them form the natural key.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{EtlError, Result};
use crate::pipeline::columns::normalize_label;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text {
        #[serde(default)]
        max_len: Option<usize>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Decimal {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        scale: Option<u32>,
    },
    Enum {
        values: Vec<String>,
    },
    Date,
    Timestamp,
    /// Business key of a row in another table (e.g. a pond name). The sink
    /// swaps it for that row's id.
    Reference {
        table: String,
        column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Alternative header names, matched after normalization.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Destination column, when it differs from `name`.
    #[serde(default)]
    pub column: Option<String>,
    /// Raw value used when the cell is absent.
    #[serde(default)]
    pub default: Option<String>,
}

impl FieldSchema {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            aliases: Vec::new(),
            column: None,
            default: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldKind::Text { max_len: None })
    }

    pub fn integer(name: &str, min: Option<i64>, max: Option<i64>) -> Self {
        Self::new(name, FieldKind::Integer { min, max })
    }

    pub fn decimal(name: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self::new(
            name,
            FieldKind::Decimal {
                min,
                max,
                scale: None,
            },
        )
    }

    pub fn enumeration(name: &str, values: &[&str]) -> Self {
        Self::new(
            name,
            FieldKind::Enum {
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        )
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::new(name, FieldKind::Timestamp)
    }

    pub fn reference(name: &str, table: &str, column: &str) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                table: table.to_string(),
                column: column.to_string(),
            },
        )
        .column(&format!("{name}_id"))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn default_value(mut self, raw: &str) -> Self {
        self.default = Some(raw.to_string());
        self
    }

    pub fn max_len(mut self, max: usize) -> Self {
        if let FieldKind::Text { max_len } = &mut self.kind {
            *max_len = Some(max);
        }
        self
    }

    pub fn scale(mut self, digits: u32) -> Self {
        if let FieldKind::Decimal { scale, .. } = &mut self.kind {
            *scale = Some(digits);
        }
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Every normalized header that maps onto this field, own name first.
    pub fn header_candidates(&self) -> Vec<String> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .map(normalize_label)
            .collect()
    }
}

/// Cross-field checks evaluated after every field has been coerced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RowRule {
    /// `field` must not be earlier than `reference` when both are present.
    NotBefore { field: String, reference: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub fields: Vec<FieldSchema>,
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RowRule>,
}

impl TableSchema {
    pub fn new(table: &str, fields: Vec<FieldSchema>, natural_key: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            fields,
            natural_key: natural_key.iter().map(|k| k.to_string()).collect(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: RowRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.natural_key.iter().filter_map(move |k| self.field(k))
    }

    pub fn non_key_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields
            .iter()
            .filter(move |f| !self.natural_key.contains(&f.name))
    }

    /// Reject descriptors the sink could not safely turn into SQL.
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.table)?;
        if self.fields.is_empty() {
            return Err(EtlError::Config(format!("schema '{}' has no fields", self.table)));
        }

        let mut names = HashSet::new();
        let mut columns = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(EtlError::Config(format!(
                    "schema '{}' declares field '{}' twice",
                    self.table, field.name
                )));
            }
            check_identifier(field.column_name())?;
            if !columns.insert(field.column_name()) {
                return Err(EtlError::Config(format!(
                    "schema '{}' maps two fields onto column '{}'",
                    self.table,
                    field.column_name()
                )));
            }
            match &field.kind {
                FieldKind::Reference { table, column } => {
                    check_identifier(table)?;
                    check_identifier(column)?;
                }
                FieldKind::Enum { values } if values.is_empty() => {
                    return Err(EtlError::Config(format!(
                        "enum field '{}.{}' has no values",
                        self.table, field.name
                    )));
                }
                _ => {}
            }
        }

        if self.natural_key.is_empty() {
            return Err(EtlError::Config(format!(
                "schema '{}' has no natural key",
                self.table
            )));
        }
        for key in &self.natural_key {
            if self.field(key).is_none() {
                return Err(EtlError::Config(format!(
                    "natural key '{}' is not a field of '{}'",
                    key, self.table
                )));
            }
        }

        for rule in &self.rules {
            let RowRule::NotBefore { field, reference } = rule;
            for name in [field, reference] {
                if self.field(name).is_none() {
                    return Err(EtlError::Config(format!(
                        "rule on '{}' mentions unknown field '{}'",
                        self.table, name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Map every schema field onto a column position of a normalized header
    /// row. A required field with no column is a schema error: every row
    /// would fail the same way, so it is reported once, before any row work.
    pub fn bind(&self, headers: &[String]) -> Result<ColumnBinding> {
        let mut positions = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let position = field
                .header_candidates()
                .iter()
                .find_map(|candidate| headers.iter().position(|h| h == candidate));

            if position.is_none() && field.required && field.default.is_none() {
                return Err(EtlError::schema(
                    format!(
                        "no column maps to required field '{}' of '{}' (looked for {})",
                        field.name,
                        self.table,
                        field.header_candidates().join(", ")
                    ),
                    Some(&field.name),
                ));
            }
            positions.push(position);
        }
        Ok(ColumnBinding { positions })
    }
}

/// Column position (if any) for each field, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBinding {
    positions: Vec<Option<usize>>,
}

impl ColumnBinding {
    pub fn position(&self, field_index: usize) -> Option<usize> {
        self.positions.get(field_index).copied().flatten()
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(EtlError::Config(format!("'{name}' is not a valid identifier")))
    }
}
