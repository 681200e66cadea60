//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Seed asset loading and static protocol configuration checks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use agentrt_model::{protocol_name, Asset, AttributeRef};
use agentrt_protocol::{validate_protocol_configuration, ProtocolRegistry};

/// Read a JSON array of assets and order it parents first.
pub fn load_seed(path: &Path) -> Result<Vec<Asset>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read seed file {}", path.display()))?;
    let assets = parse_seed(&contents)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    debug!(seed_path = %path.display(), assets = assets.len(), "seed loaded");
    Ok(assets)
}

pub fn parse_seed(contents: &str) -> Result<Vec<Asset>> {
    let assets: Vec<Asset> = serde_json::from_str(contents)?;
    Ok(parents_first(assets))
}

/// Stable ordering where every asset follows its parent when the parent is seeded too.
fn parents_first(mut pending: Vec<Asset>) -> Vec<Asset> {
    let seeded: HashSet<String> = pending.iter().map(|asset| asset.id.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for asset in pending {
            let ready = match &asset.parent_id {
                Some(parent) => !seeded.contains(parent) || placed.contains(parent),
                None => true,
            };
            if ready {
                placed.insert(asset.id.clone());
                ordered.push(asset);
            } else {
                deferred.push(asset);
            }
        }
        if deferred.len() == before {
            // Parent cycle; keep the remaining input order.
            ordered.extend(deferred);
            break;
        }
        pending = deferred;
    }
    ordered
}

/// Outcome of checking one agent protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationCheck {
    pub configuration: AttributeRef,
    pub protocol: String,
    pub problem: Option<String>,
}

/// Check every agent configuration in `assets` against the registered drivers.
pub fn check_configurations(assets: &[Asset], protocols: &ProtocolRegistry) -> Vec<ConfigurationCheck> {
    assets
        .iter()
        .filter(|asset| asset.is_agent())
        .flat_map(|agent| {
            agent.protocol_configurations().map(move |attribute| {
                let protocol = protocol_name(attribute).unwrap_or_default().to_owned();
                let problem = if protocols.get(&protocol).is_none() {
                    Some("no driver registered for protocol".to_owned())
                } else {
                    let result = validate_protocol_configuration(attribute, &protocol);
                    (!result.is_valid()).then(|| result.summary())
                };
                ConfigurationCheck {
                    configuration: agent.attribute_ref(&attribute.name),
                    protocol,
                    problem,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SEED: &str = r#"[
        {"id": "S1", "name": "Sensor", "type": "Thing", "parentId": "A1", "realm": "master",
         "attributes": [{"name": "temp", "type": "NUMBER",
                         "meta": [{"name": "agentLink", "value": ["A1", "sim"]}]}]},
        {"id": "A1", "name": "Agent", "type": "Agent", "parentId": "site", "realm": "master",
         "attributes": [
            {"name": "sim", "type": "STRING", "value": "urn:openremote:protocol:simulator",
             "meta": [{"name": "protocolConfiguration", "value": true}]},
            {"name": "knx", "type": "STRING", "value": "urn:openremote:protocol:knx",
             "meta": [{"name": "protocolConfiguration", "value": true}]}
         ]},
        {"id": "site", "name": "Site", "type": "Building", "realm": "master"}
    ]"#;

    #[test]
    fn seed_is_ordered_parents_first() {
        let assets = parse_seed(SEED).unwrap();
        let ids: Vec<_> = assets.iter().map(|asset| asset.id.as_str()).collect();
        assert_eq!(ids, vec!["site", "A1", "S1"]);
    }

    #[test]
    fn orphans_keep_their_position() {
        let assets = parse_seed(
            r#"[{"id": "B", "type": "Thing", "parentId": "elsewhere"}, {"id": "A", "type": "Thing"}]"#,
        )
        .unwrap();
        let ids: Vec<_> = assets.iter().map(|asset| asset.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn unknown_drivers_are_reported() {
        let assets = parse_seed(SEED).unwrap();
        let protocols = ProtocolRegistry::with_builtin().unwrap();
        let checks = check_configurations(&assets, &protocols);
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].configuration, AttributeRef::new("A1", "sim"));
        assert!(checks[0].problem.is_none());
        assert_eq!(checks[1].protocol, "urn:openremote:protocol:knx");
        assert!(checks[1].problem.is_some());
    }

    #[test]
    fn missing_seed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = load_seed(&path).unwrap_err();
        assert!(err.to_string().contains("absent.json"));

        let present = dir.path().join("seed.json");
        let mut file = fs::File::create(&present).unwrap();
        write!(file, "{}", SEED).unwrap();
        assert_eq!(load_seed(&present).unwrap().len(), 3);
    }
}
