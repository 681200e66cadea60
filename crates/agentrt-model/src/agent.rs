//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Protocol configuration helpers and connection status."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::attribute::{meta, Attribute, AttributeRef, MetaItem};
use crate::value::{Value, ValueType};
use crate::{ModelError, Result};

/// Namespace shared by the bundled protocol URNs.
pub const PROTOCOL_URN_PREFIX: &str = "urn:openremote:protocol:";

static URN_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)^urn:[a-z0-9][a-z0-9-]{0,31}:([a-z0-9()+,\-.:=@;$_!*']|%[0-9a-f]{2})+$").ok()
});

/// RFC 2141 URN check.
pub fn is_valid_urn(candidate: &str) -> bool {
    URN_PATTERN
        .as_ref()
        .map(|pattern| pattern.is_match(candidate))
        .unwrap_or(false)
}

/// Health of one protocol configuration's driver session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disabled,
    Waiting,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    ErrorConfiguration,
    ErrorAuthentication,
}

impl ConnectionStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Error
                | ConnectionStatus::ErrorConfiguration
                | ConnectionStatus::ErrorAuthentication
        )
    }
}

/// Driver URN of a protocol configuration attribute.
pub fn protocol_name(attribute: &Attribute) -> Option<&str> {
    attribute.value.as_str()
}

/// An attribute flagged `protocolConfiguration=true` whose value is a valid URN.
pub fn is_protocol_configuration(attribute: &Attribute) -> bool {
    attribute.meta_is_true(meta::PROTOCOL_CONFIGURATION)
        && protocol_name(attribute).map(is_valid_urn).unwrap_or(false)
}

/// Build a protocol configuration attribute for the driver named `protocol_urn`.
pub fn protocol_configuration(name: impl Into<String>, protocol_urn: &str) -> Result<Attribute> {
    if !is_valid_urn(protocol_urn) {
        return Err(ModelError::InvalidUrn(protocol_urn.to_owned()));
    }
    Ok(Attribute::new(name, ValueType::String)
        .with_value(protocol_urn)
        .with_meta(meta::PROTOCOL_CONFIGURATION, Value::Bool(true)))
}

/// Meta item linking an attribute to the configuration `configuration`.
pub fn agent_link_meta(configuration: &AttributeRef) -> MetaItem {
    MetaItem::new(meta::AGENT_LINK, configuration.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urn_validation() {
        assert!(is_valid_urn("urn:openremote:protocol:simulator"));
        assert!(is_valid_urn("URN:OpenRemote:protocol:http"));
        assert!(!is_valid_urn("openremote:protocol:simulator"));
        assert!(!is_valid_urn("urn:openremote:"));
        assert!(!is_valid_urn("urn:-bad:thing"));
        assert!(!is_valid_urn("urn:openremote:has space"));
    }

    #[test]
    fn configuration_requires_flag_and_urn() {
        let cfg = protocol_configuration("cfg1", "urn:openremote:protocol:simulator").unwrap();
        assert!(is_protocol_configuration(&cfg));

        let mut unflagged = cfg.clone();
        unflagged.meta.clear();
        assert!(!is_protocol_configuration(&unflagged));

        let mut bad_urn = cfg;
        bad_urn.value = Value::from("openremote:protocol:simulator");
        assert!(!is_protocol_configuration(&bad_urn));

        assert!(protocol_configuration("cfg2", "simulator").is_err());
    }

    #[test]
    fn status_names_round_trip_through_text() {
        assert_eq!(
            ConnectionStatus::ErrorConfiguration.to_string(),
            "ERROR_CONFIGURATION"
        );
        assert_eq!(
            "CONNECTED".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::Connected
        );
        assert!(ConnectionStatus::ErrorAuthentication.is_error());
        assert!(!ConnectionStatus::Waiting.is_error());
    }
}
