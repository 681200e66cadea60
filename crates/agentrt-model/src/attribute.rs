//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Attribute references, attributes and ordered meta items."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueType};
use crate::{ModelError, Result};

/// Well-known meta item names.
pub mod meta {
    pub const AGENT_LINK: &str = "agentLink";
    pub const PROTOCOL_CONFIGURATION: &str = "protocolConfiguration";
    pub const READ_ONLY: &str = "readOnly";
    pub const WRITE_VALUE: &str = "writeValue";
    pub const WRITE_VALUE_CONVERTER: &str = "writeValueConverter";
    pub const READ_VALUE_CONVERTER: &str = "readValueConverter";
    pub const VALUE_FILTERS: &str = "valueFilters";
    pub const UNIT_TYPE: &str = "unitType";
    pub const FORMAT: &str = "format";
    pub const RULE_STATE: &str = "ruleState";
    pub const STORE_DATA_POINTS: &str = "storeDataPoints";
}

/// `(assetId, attributeName)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRef {
    pub asset_id: String,
    pub attribute_name: String,
}

impl AttributeRef {
    pub fn new(asset_id: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            attribute_name: attribute_name.into(),
        }
    }

    /// Checked constructor rejecting empty components.
    pub fn try_new(asset_id: impl Into<String>, attribute_name: impl Into<String>) -> Result<Self> {
        let reference = Self::new(asset_id, attribute_name);
        if reference.asset_id.is_empty() || reference.attribute_name.is_empty() {
            return Err(ModelError::InvalidAttributeRef);
        }
        Ok(reference)
    }

    /// Encode as the two-element array stored in agent-link meta.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.asset_id.clone()),
            Value::String(self.attribute_name.clone()),
        ])
    }

    /// Decode from `["assetId", "attributeName"]` or `{"assetId": .., "attributeName": ..}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let (asset_id, attribute_name) = match value {
            Value::Array(items) if items.len() == 2 => (items[0].as_str()?, items[1].as_str()?),
            Value::Object(map) => (
                map.get("assetId")?.as_str()?,
                map.get("attributeName")?.as_str()?,
            ),
            _ => return None,
        };
        Self::try_new(asset_id, attribute_name).ok()
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_id, self.attribute_name)
    }
}

/// Named modifier attached to an attribute. Duplicates are allowed and ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaItem {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl MetaItem {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Named typed slot on an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_timestamp: Option<i64>,
    #[serde(default)]
    pub meta: Vec<MetaItem>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            value: Value::Null,
            value_timestamp: None,
            meta: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.value_timestamp = Some(timestamp);
        self
    }

    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.push(MetaItem::new(name, value));
        self
    }

    /// First meta value with the given name.
    pub fn meta(&self, name: &str) -> Option<&Value> {
        self.meta
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.value)
    }

    pub fn has_meta(&self, name: &str) -> bool {
        self.meta.iter().any(|item| item.name == name)
    }

    /// True when the named meta is present with the boolean value `true`.
    pub fn meta_is_true(&self, name: &str) -> bool {
        matches!(self.meta(name), Some(Value::Bool(true)))
    }

    pub fn is_read_only(&self) -> bool {
        self.meta_is_true(meta::READ_ONLY)
    }

    /// Protocol configuration this attribute is linked to, if any.
    pub fn agent_link(&self) -> Option<AttributeRef> {
        self.meta(meta::AGENT_LINK).and_then(AttributeRef::from_value)
    }

    /// Equality that disregards `value_timestamp`.
    pub fn same_ignoring_timestamp(&self, other: &Attribute) -> bool {
        self.name == other.name
            && self.value_type == other.value_type
            && self.value == other.value
            && self.meta == other.meta
    }
}
