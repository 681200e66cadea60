//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validation results for protocol configuration attributes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::ValueType;

/// Reason a configuration attribute or one of its meta items was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "parameter", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationFailure {
    /// Required meta item absent; carries the meta name.
    MetaItemMissing(String),
    /// Meta item present but empty; carries the expected value type.
    MetaItemValueIsRequired(ValueType),
    /// Value present but outside what is accepted; optionally names what was expected.
    ValueMismatch(Option<String>),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::MetaItemMissing(name) => write!(f, "META_ITEM_MISSING({})", name),
            ValidationFailure::MetaItemValueIsRequired(value_type) => {
                write!(f, "META_ITEM_VALUE_IS_REQUIRED({})", value_type)
            }
            ValidationFailure::ValueMismatch(Some(expected)) => {
                write!(f, "VALUE_MISMATCH({})", expected)
            }
            ValidationFailure::ValueMismatch(None) => f.write_str("VALUE_MISMATCH"),
        }
    }
}

/// Meta failure, positioned at a meta index when the offending item exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFailure {
    pub index: Option<usize>,
    pub failure: ValidationFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub attribute_failures: Vec<ValidationFailure>,
    pub meta_failures: Vec<MetaFailure>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.attribute_failures.is_empty() && self.meta_failures.is_empty()
    }

    pub fn add_attribute_failure(&mut self, failure: ValidationFailure) {
        self.attribute_failures.push(failure);
    }

    pub fn add_meta_failure(&mut self, index: Option<usize>, failure: ValidationFailure) {
        self.meta_failures.push(MetaFailure { index, failure });
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.attribute_failures.extend(other.attribute_failures);
        self.meta_failures.extend(other.meta_failures);
    }

    /// Compact one-line rendering for logs and error messages.
    pub fn summary(&self) -> String {
        let attribute = self.attribute_failures.iter().map(ToString::to_string);
        let meta = self.meta_failures.iter().map(|m| match m.index {
            Some(index) => format!("meta[{}]: {}", index, m.failure),
            None => format!("meta: {}", m.failure),
        });
        attribute.chain(meta).collect::<Vec<_>>().join("; ")
    }
}
