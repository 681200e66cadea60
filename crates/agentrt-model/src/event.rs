//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Attribute events exchanged on the runtime channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::attribute::AttributeRef;
use crate::value::Value;

/// Originator of an attribute event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    Client,
    Sensor,
    Internal,
    Gateway,
}

/// Reference plus value, without timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeState {
    pub attribute_ref: AttributeRef,
    pub value: Value,
}

impl AttributeState {
    pub fn new(attribute_ref: AttributeRef, value: impl Into<Value>) -> Self {
        Self {
            attribute_ref,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeEvent {
    pub attribute_ref: AttributeRef,
    pub value: Value,
    pub timestamp: i64,
    pub source: EventSource,
}

impl AttributeEvent {
    pub fn new(
        attribute_ref: AttributeRef,
        value: impl Into<Value>,
        timestamp: i64,
        source: EventSource,
    ) -> Self {
        Self {
            attribute_ref,
            value: value.into(),
            timestamp,
            source,
        }
    }

    pub fn from_state(state: AttributeState, timestamp: i64, source: EventSource) -> Self {
        Self::new(state.attribute_ref, state.value, timestamp, source)
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn state(&self) -> AttributeState {
        AttributeState::new(self.attribute_ref.clone(), self.value.clone())
    }
}
