//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Asset persistence events consumed by the lifecycle controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::Display;

use agentrt_model::{Asset, Attribute};

pub const ASSET_ENTITY: &str = "Asset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceCause {
    Create,
    Update,
    Delete,
}

/// One committed change to an asset.
///
/// `previous_state` is absent for CREATE and `current_state` for DELETE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceEvent {
    pub cause: PersistenceCause,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub property_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<Asset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<Asset>,
}

impl PersistenceEvent {
    pub fn create(asset: Asset) -> Self {
        Self {
            cause: PersistenceCause::Create,
            entity_type: ASSET_ENTITY.to_owned(),
            entity_id: asset.id.clone(),
            property_names: Vec::new(),
            previous_state: None,
            current_state: Some(asset),
        }
    }

    /// UPDATE event; `property_names` lists the top-level properties that differ.
    pub fn update(previous: Asset, current: Asset) -> Self {
        let mut property_names = Vec::new();
        if previous.name != current.name {
            property_names.push("name".to_owned());
        }
        if previous.parent_id != current.parent_id {
            property_names.push("parentId".to_owned());
        }
        if previous.path != current.path {
            property_names.push("path".to_owned());
        }
        if previous.attributes != current.attributes {
            property_names.push("attributes".to_owned());
        }
        Self {
            cause: PersistenceCause::Update,
            entity_type: ASSET_ENTITY.to_owned(),
            entity_id: current.id.clone(),
            property_names,
            previous_state: Some(previous),
            current_state: Some(current),
        }
    }

    pub fn delete(asset: Asset) -> Self {
        Self {
            cause: PersistenceCause::Delete,
            entity_type: ASSET_ENTITY.to_owned(),
            entity_id: asset.id.clone(),
            property_names: Vec::new(),
            previous_state: Some(asset),
            current_state: None,
        }
    }

    /// Latest known state: current, or previous for deletions.
    pub fn asset(&self) -> Option<&Asset> {
        self.current_state.as_ref().or(self.previous_state.as_ref())
    }

    pub fn previous_attributes(&self) -> &[Attribute] {
        self.previous_state
            .as_ref()
            .map(|asset| asset.attributes.as_slice())
            .unwrap_or_default()
    }

    pub fn current_attributes(&self) -> &[Attribute] {
        self.current_state
            .as_ref()
            .map(|asset| asset.attributes.as_slice())
            .unwrap_or_default()
    }

    /// The states carried by the event, current first.
    pub fn states(&self) -> impl Iterator<Item = &Asset> {
        [self.current_state.as_ref(), self.previous_state.as_ref()]
            .into_iter()
            .flatten()
    }

    pub fn is_asset_event(&self) -> bool {
        self.entity_type == ASSET_ENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_names_changed_properties_and_moves() {
        let agent = Asset::agent("A1", "Agent", "master");
        let other = Asset::agent("A2", "Other", "master");
        let before = Asset::new("S1", "Sensor", "Thing", "master").with_parent(&agent);
        let after = before.clone().with_parent(&other);
        let event = PersistenceEvent::update(before, after);
        assert_eq!(event.property_names, vec!["parentId", "path"]);
        let parents: Vec<_> = event.states().map(|asset| asset.parent_id.clone()).collect();
        assert_eq!(parents, vec![Some("A2".to_owned()), Some("A1".to_owned())]);
    }

    #[test]
    fn wire_format_is_camel_case() {
        let event = PersistenceEvent::delete(Asset::agent("A1", "Agent", "master"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["cause"], "DELETE");
        assert_eq!(json["entityType"], "Asset");
        assert!(json.get("currentState").is_none());
        assert_eq!(event.asset().map(|a| a.id.as_str()), Some("A1"));
    }
}
