//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Assets, agents and their attribute lists."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::agent::is_protocol_configuration;
use crate::attribute::{Attribute, AttributeRef};

/// Well-known asset type of agents.
pub const AGENT_TYPE: &str = "Agent";

/// Asset snapshot as stored by the platform.
///
/// `path` lists asset ids from the asset itself up to the realm root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Asset {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        asset_type: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            path: vec![id.clone()],
            id,
            name: name.into(),
            asset_type: asset_type.into(),
            parent_id: None,
            realm: realm.into(),
            attributes: Vec::new(),
        }
    }

    pub fn agent(id: impl Into<String>, name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self::new(id, name, AGENT_TYPE, realm)
    }

    /// Re-parent under `parent`, deriving the path from the parent's.
    pub fn with_parent(mut self, parent: &Asset) -> Self {
        self.parent_id = Some(parent.id.clone());
        self.path = std::iter::once(self.id.clone())
            .chain(parent.path.iter().cloned())
            .collect();
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.set_attribute(attribute);
        self
    }

    pub fn is_agent(&self) -> bool {
        self.asset_type == AGENT_TYPE
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }

    /// Replace the attribute with the same name or append it.
    pub fn set_attribute(&mut self, attribute: Attribute) {
        match self.attribute_mut(&attribute.name) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    pub fn attribute_ref(&self, name: &str) -> AttributeRef {
        AttributeRef::new(self.id.clone(), name)
    }

    /// Ancestors from the direct parent upwards.
    pub fn ancestor_ids(&self) -> impl Iterator<Item = &str> {
        self.path
            .iter()
            .skip_while(move |id| **id == self.id)
            .map(String::as_str)
    }

    pub fn protocol_configurations(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|attribute| is_protocol_configuration(attribute))
    }

    /// Attributes carrying an agent link, paired with the linked configuration.
    pub fn linked_attributes(&self) -> impl Iterator<Item = (AttributeRef, &Attribute)> {
        self.attributes
            .iter()
            .filter_map(|attribute| attribute.agent_link().map(|link| (link, attribute)))
    }
}
