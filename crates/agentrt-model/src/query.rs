//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Asset store query predicates."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::attribute::AttributeRef;

/// Conjunction of optional predicates; an empty query matches every asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Matches strict descendants of this asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_id: Option<String>,
    /// Matches assets with at least one attribute linked to this configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_link: Option<AttributeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

impl AssetQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn descendants_of(mut self, ancestor_id: impl Into<String>) -> Self {
        self.ancestor_id = Some(ancestor_id.into());
        self
    }

    pub fn linked_to(mut self, configuration: AttributeRef) -> Self {
        self.agent_link = Some(configuration);
        self
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn matches(&self, asset: &Asset) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == asset.id) {
            return false;
        }
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == asset.asset_type) {
            return false;
        }
        if let Some(parent_id) = &self.parent_id {
            if asset.parent_id.as_ref() != Some(parent_id) {
                return false;
            }
        }
        if let Some(ancestor_id) = &self.ancestor_id {
            if !asset.ancestor_ids().any(|id| id == ancestor_id) {
                return false;
            }
        }
        if let Some(link) = &self.agent_link {
            if !asset.linked_attributes().any(|(target, _)| target == *link) {
                return false;
            }
        }
        if let Some(realm) = &self.realm {
            if asset.realm != *realm {
                return false;
            }
        }
        true
    }
}
