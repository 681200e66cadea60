//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validation helpers for protocol configuration attributes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use agentrt_model::{
    is_valid_urn, meta, protocol_name, Attribute, ValidationFailure, ValidationResult, Value,
    ValueType,
};

/// Host name or address of a socket based device.
pub const META_HOST: &str = "host";
/// TCP or UDP port of a socket based device.
pub const META_PORT: &str = "port";
/// Serial device path.
pub const META_SERIAL_PORT: &str = "serialPort";
/// Serial line speed.
pub const META_BAUDRATE: &str = "baudrate";

/// Accepted port range, as reported in failures.
pub const PORT_RANGE: &str = "1-65535";

/// Check that `attribute` is a protocol configuration for `expected_protocol`.
pub fn validate_protocol_configuration(attribute: &Attribute, expected_protocol: &str) -> ValidationResult {
    let mut result = ValidationResult::new();
    match protocol_name(attribute) {
        Some(name) if is_valid_urn(name) && name == expected_protocol => {}
        _ => result.add_attribute_failure(ValidationFailure::ValueMismatch(Some(
            expected_protocol.to_owned(),
        ))),
    }
    if !attribute.meta_is_true(meta::PROTOCOL_CONFIGURATION) {
        let index = meta_index(attribute, meta::PROTOCOL_CONFIGURATION);
        let failure = match index {
            Some(_) => ValidationFailure::MetaItemValueIsRequired(ValueType::Boolean),
            None => ValidationFailure::MetaItemMissing(meta::PROTOCOL_CONFIGURATION.to_owned()),
        };
        result.add_meta_failure(index, failure);
    }
    result
}

/// Check the `host` and `port` meta items. Returns whether both are usable.
pub fn validate_socket_configuration(attribute: &Attribute, result: &mut ValidationResult) -> bool {
    let mut valid = true;
    let mut host_found = false;
    let mut port_found = false;

    for (index, item) in attribute.meta.iter().enumerate() {
        if item.name == META_HOST {
            host_found = true;
            if is_blank(&item.value) {
                valid = false;
                result.add_meta_failure(
                    Some(index),
                    ValidationFailure::MetaItemValueIsRequired(ValueType::String),
                );
            }
        } else if item.name == META_PORT {
            port_found = true;
            let port = item.value.as_i64().unwrap_or(0);
            if !(1..=65535).contains(&port) {
                valid = false;
                result.add_meta_failure(
                    Some(index),
                    ValidationFailure::ValueMismatch(Some(PORT_RANGE.to_owned())),
                );
            }
        }
    }

    if !host_found {
        valid = false;
        result.add_meta_failure(None, ValidationFailure::MetaItemMissing(META_HOST.to_owned()));
    }
    if !port_found {
        valid = false;
        result.add_meta_failure(None, ValidationFailure::MetaItemMissing(META_PORT.to_owned()));
    }
    valid
}

/// Check the `serialPort` and optional `baudrate` meta items.
pub fn validate_serial_configuration(attribute: &Attribute, result: &mut ValidationResult) -> bool {
    let mut valid = true;
    let mut port_found = false;

    for (index, item) in attribute.meta.iter().enumerate() {
        if item.name == META_SERIAL_PORT {
            port_found = true;
            if is_blank(&item.value) {
                valid = false;
                result.add_meta_failure(
                    Some(index),
                    ValidationFailure::MetaItemValueIsRequired(ValueType::String),
                );
            }
        } else if item.name == META_BAUDRATE && item.value.as_i64().unwrap_or(0) <= 0 {
            valid = false;
            result.add_meta_failure(Some(index), ValidationFailure::ValueMismatch(None));
        }
    }

    if !port_found {
        valid = false;
        result.add_meta_failure(
            None,
            ValidationFailure::MetaItemMissing(META_SERIAL_PORT.to_owned()),
        );
    }
    valid
}

fn meta_index(attribute: &Attribute, name: &str) -> Option<usize> {
    attribute.meta.iter().position(|item| item.name == name)
}

fn is_blank(value: &Value) -> bool {
    value.as_str().map(|s| s.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{protocol_configuration, MetaFailure};

    const TCP: &str = "urn:openremote:protocol:tcp";

    #[test]
    fn protocol_configuration_must_name_the_driver() {
        let configuration = protocol_configuration("cfg1", TCP).unwrap();
        assert!(validate_protocol_configuration(&configuration, TCP).is_valid());

        let result = validate_protocol_configuration(&configuration, "urn:openremote:protocol:udp");
        assert_eq!(
            result.attribute_failures,
            vec![ValidationFailure::ValueMismatch(Some("urn:openremote:protocol:udp".into()))]
        );

        let plain = Attribute::new("cfg1", ValueType::String).with_value(TCP);
        let result = validate_protocol_configuration(&plain, TCP);
        assert_eq!(
            result.meta_failures,
            vec![MetaFailure {
                index: None,
                failure: ValidationFailure::MetaItemMissing(meta::PROTOCOL_CONFIGURATION.into()),
            }]
        );
    }

    #[test]
    fn socket_port_out_of_range() {
        let configuration = protocol_configuration("cfg1", TCP)
            .unwrap()
            .with_meta(META_HOST, "localhost")
            .with_meta(META_PORT, 70000i64);
        let mut result = ValidationResult::new();
        assert!(!validate_socket_configuration(&configuration, &mut result));
        assert_eq!(
            result.meta_failures,
            vec![MetaFailure {
                index: Some(2),
                failure: ValidationFailure::ValueMismatch(Some("1-65535".into())),
            }]
        );
    }

    #[test]
    fn socket_meta_missing_and_empty() {
        let configuration = protocol_configuration("cfg1", TCP)
            .unwrap()
            .with_meta(META_HOST, "  ");
        let mut result = ValidationResult::new();
        assert!(!validate_socket_configuration(&configuration, &mut result));
        assert_eq!(
            result.meta_failures,
            vec![
                MetaFailure {
                    index: Some(1),
                    failure: ValidationFailure::MetaItemValueIsRequired(ValueType::String),
                },
                MetaFailure {
                    index: None,
                    failure: ValidationFailure::MetaItemMissing(META_PORT.into()),
                },
            ]
        );
    }

    #[test]
    fn port_given_as_string_is_accepted() {
        let configuration = protocol_configuration("cfg1", TCP)
            .unwrap()
            .with_meta(META_HOST, "10.0.0.2")
            .with_meta(META_PORT, "6000");
        let mut result = ValidationResult::new();
        assert!(validate_socket_configuration(&configuration, &mut result));
        assert!(result.is_valid());
    }

    #[test]
    fn serial_configuration() {
        let configuration = protocol_configuration("cfg1", "urn:openremote:protocol:serial")
            .unwrap()
            .with_meta(META_SERIAL_PORT, "/dev/ttyUSB0")
            .with_meta(META_BAUDRATE, 0i64);
        let mut result = ValidationResult::new();
        assert!(!validate_serial_configuration(&configuration, &mut result));
        assert_eq!(
            result.meta_failures,
            vec![MetaFailure {
                index: Some(2),
                failure: ValidationFailure::ValueMismatch(None),
            }]
        );
    }
}
