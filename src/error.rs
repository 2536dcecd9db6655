use serde::Serialize;
use thiserror::Error;

/// Stage-level failures. Row-level problems never show up here; they are
/// carried as [`crate::pipeline::cleaner::FieldFailure`] values in the run report.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EtlError {
    #[error("extraction failed for '{locator}': {message}")]
    Extraction { locator: String, message: String },

    #[error("schema error: {message}")]
    Schema {
        message: String,
        column: Option<String>,
    },

    #[error("transform rejected the batch: {failed} of {total} rows failed (threshold {threshold})")]
    Transform {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("load into '{table}' failed: {message}")]
    Load {
        table: String,
        row_index: Option<usize>,
        constraint: Option<String>,
        message: String,
    },

    #[error("run cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn extraction(locator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            locator: locator.into(),
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>, column: Option<&str>) -> Self {
        Self::Schema {
            message: message.into(),
            column: column.map(str::to_string),
        }
    }

    /// Short machine-friendly tag, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction { .. } => "extraction",
            Self::Schema { .. } => "schema",
            Self::Transform { .. } => "transform",
            Self::Load { .. } => "load",
            Self::Cancelled { .. } => "cancelled",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_serializes_with_context() {
        let err = EtlError::Load {
            table: "daily_record".to_string(),
            row_index: Some(10),
            constraint: Some("daily_record.pond -> pond.name".to_string()),
            message: "row 10 references a missing pond".to_string(),
        };

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "load");
        assert_eq!(json["row_index"], 10);
        assert_eq!(json["constraint"], "daily_record.pond -> pond.name");
        assert_eq!(err.kind(), "load");
    }

    #[test]
    fn transform_error_message_names_counts() {
        let err = EtlError::Transform {
            failed: 3,
            total: 3,
            threshold: 0.8,
        };
        assert_eq!(
            err.to_string(),
            "transform rejected the batch: 3 of 3 rows failed (threshold 0.8)"
        );
    }
}
