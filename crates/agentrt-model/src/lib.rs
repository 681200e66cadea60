//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Identifier, value and asset model shared by the runtime and drivers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Data model of the agent runtime.
//!
//! Attribute references, value envelopes, attributes with ordered meta, assets and agents,
//! connection statuses, attribute events, validation results, and the pure inbound and
//! outbound value-processing functions that sit between the platform bus and a driver.

pub mod agent;
pub mod asset;
pub mod attribute;
pub mod event;
pub mod processing;
pub mod query;
pub mod validation;
pub mod value;

pub use agent::{
    agent_link_meta, is_protocol_configuration, is_valid_urn, protocol_configuration,
    protocol_name, ConnectionStatus, PROTOCOL_URN_PREFIX,
};
pub use asset::{Asset, AGENT_TYPE};
pub use attribute::{meta, Attribute, AttributeRef, MetaItem};
pub use event::{AttributeEvent, AttributeState, EventSource};
pub use processing::{
    has_dynamic_write_value, process_inbound, process_outbound, CompiledFilter, ProcessingOutcome,
    ValueFilter, DYNAMIC_VALUE_PLACEHOLDER,
};
pub use query::AssetQuery;
pub use validation::{MetaFailure, ValidationFailure, ValidationResult};
pub use value::{Value, ValueType};

/// Errors raised while building model values.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("'{0}' is not a valid URN")]
    InvalidUrn(String),
    #[error("attribute reference requires a non-empty asset id and attribute name")]
    InvalidAttributeRef,
    #[error("invalid value filter definition: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
