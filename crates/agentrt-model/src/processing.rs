//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound and outbound value processing between the bus and drivers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Value-processing pipeline.
//!
//! Outbound: `writeValue` template (with `{$value}` substitution for dynamic
//! attributes), then `writeValueConverter`.
//!
//! Inbound: ordered `valueFilters`, then `readValueConverter`, then coercion to
//! the attribute's declared type.
//!
//! Converters are objects mapping the text form of the incoming value to the
//! outgoing value. A `null` incoming value looks up the key `NULL`. Lookup tries the
//! exact key, then the upper-cased key, then `@DEFAULT`. The outgoing values
//! `"@IGNORE"` and `"@NULL"` mean "drop the value" and "use null".
//!
//! Both functions are pure and never touch the registry or the network.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attribute::{meta, Attribute};
use crate::value::Value;

/// Placeholder replaced by the requested value in dynamic `writeValue` templates.
pub const DYNAMIC_VALUE_PLACEHOLDER: &str = "{$value}";

const CONVERTER_IGNORE: &str = "@IGNORE";
const CONVERTER_NULL: &str = "@NULL";
const CONVERTER_DEFAULT: &str = "@DEFAULT";
const CONVERTER_NULL_KEY: &str = "NULL";

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// Drop the value; this is not an error.
    Ignored,
    Value(Value),
}

impl ProcessingOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, ProcessingOutcome::Ignored)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            ProcessingOutcome::Ignored => None,
            ProcessingOutcome::Value(value) => Some(value),
        }
    }
}

/// One step of the inbound filter chain, read from the `valueFilters` meta array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValueFilter {
    /// Extract capture group `match_group` of the `match_index`-th match.
    #[serde(rename = "regex")]
    Regex {
        pattern: String,
        #[serde(rename = "matchGroup", default)]
        match_group: usize,
        #[serde(rename = "matchIndex", default)]
        match_index: usize,
    },
    /// Navigate `$.a.b[0]` style paths through objects, arrays or JSON text.
    #[serde(rename = "jsonPath")]
    JsonPath { path: String },
    /// Char-indexed substring.
    #[serde(rename = "substring")]
    Substring {
        #[serde(rename = "beginIndex")]
        begin_index: usize,
        #[serde(rename = "endIndex", default)]
        end_index: Option<usize>,
    },
}

impl ValueFilter {
    /// Compile the filter for repeated use; fails only on an invalid regex pattern.
    pub fn compile(&self) -> Result<CompiledFilter, regex::Error> {
        Ok(match self {
            ValueFilter::Regex {
                pattern,
                match_group,
                match_index,
            } => CompiledFilter::Regex {
                regex: Regex::new(pattern)?,
                match_group: *match_group,
                match_index: *match_index,
            },
            ValueFilter::JsonPath { path } => CompiledFilter::JsonPath { path: path.clone() },
            ValueFilter::Substring {
                begin_index,
                end_index,
            } => CompiledFilter::Substring {
                begin_index: *begin_index,
                end_index: *end_index,
            },
        })
    }
}

/// A [`ValueFilter`] ready to run, with its regex already built.
#[derive(Debug, Clone)]
pub enum CompiledFilter {
    Regex {
        regex: Regex,
        match_group: usize,
        match_index: usize,
    },
    JsonPath {
        path: String,
    },
    Substring {
        begin_index: usize,
        end_index: Option<usize>,
    },
}

impl CompiledFilter {
    /// Apply the filter; `None` means the filter produced nothing.
    pub fn apply(&self, value: &Value) -> Option<Value> {
        match self {
            CompiledFilter::Regex {
                regex,
                match_group,
                match_index,
            } => {
                let text = value.to_display_string();
                let captures = regex.captures_iter(&text).nth(*match_index)?;
                captures
                    .get(*match_group)
                    .map(|m| Value::String(m.as_str().to_owned()))
            }
            CompiledFilter::JsonPath { path } => {
                let parsed;
                let root = match value {
                    Value::String(text) => {
                        parsed = Value::parse_json(text)?;
                        &parsed
                    }
                    other => other,
                };
                select_path(root, path).cloned()
            }
            CompiledFilter::Substring {
                begin_index,
                end_index,
            } => {
                let chars: Vec<char> = value.to_display_string().chars().collect();
                let end = end_index.unwrap_or(chars.len());
                if *begin_index > end || end > chars.len() {
                    return None;
                }
                Some(Value::String(chars[*begin_index..end].iter().collect()))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum PathStep {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<PathStep>> {
    let rest = path.trim();
    let mut rest = rest.strip_prefix('$').unwrap_or(rest);
    let mut steps = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(|c: char| c == '.' || c == '[').unwrap_or(after.len());
            if end == 0 {
                return None;
            }
            steps.push(PathStep::Key(after[..end].to_owned()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let inner = after[..close].trim();
            let quoted = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
            match quoted {
                Some(key) => steps.push(PathStep::Key(key.to_owned())),
                None => steps.push(PathStep::Index(inner.parse().ok()?)),
            }
            rest = &after[close + 1..];
        } else if steps.is_empty() {
            // bare leading key, e.g. `a.b`
            let end = rest.find(|c: char| c == '.' || c == '[').unwrap_or(rest.len());
            steps.push(PathStep::Key(rest[..end].to_owned()));
            rest = &rest[end..];
        } else {
            return None;
        }
    }
    Some(steps)
}

fn select_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    parse_path(path)?
        .iter()
        .try_fold(root, |current, step| match (step, current) {
            (PathStep::Key(key), Value::Object(map)) => map.get(key),
            (PathStep::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        })
}

/// True when the attribute's `writeValue` is a template containing the placeholder.
pub fn has_dynamic_write_value(attribute: &Attribute) -> bool {
    attribute
        .meta(meta::WRITE_VALUE)
        .and_then(Value::as_str)
        .map(|template| template.contains(DYNAMIC_VALUE_PLACEHOLDER))
        .unwrap_or(false)
}

/// Platform to driver direction.
pub fn process_outbound(
    asset_id: &str,
    attribute: &Attribute,
    requested: &Value,
    dynamic: bool,
) -> ProcessingOutcome {
    let value = match attribute.meta(meta::WRITE_VALUE) {
        Some(Value::String(template)) if dynamic => Value::String(
            template.replace(DYNAMIC_VALUE_PLACEHOLDER, &requested.to_display_string()),
        ),
        Some(write_value) => write_value.clone(),
        None => requested.clone(),
    };

    let outcome = match attribute.meta(meta::WRITE_VALUE_CONVERTER) {
        Some(converter) => apply_converter(converter, value),
        None => ProcessingOutcome::Value(value),
    };
    if outcome.is_ignored() {
        info!(
            asset = asset_id,
            attribute = %attribute.name,
            "write value converter ignored outbound value"
        );
    }
    outcome
}

/// Driver to platform direction.
pub fn process_inbound(asset_id: &str, attribute: &Attribute, raw: &Value) -> ProcessingOutcome {
    let mut value = raw.clone();

    if let Some(definition) = attribute.meta(meta::VALUE_FILTERS) {
        let Some(filters) = parse_filters(asset_id, attribute, definition) else {
            return ProcessingOutcome::Ignored;
        };
        for filter in &filters {
            match filter.apply(&value) {
                Some(filtered) => value = filtered,
                None => {
                    info!(
                        asset = asset_id,
                        attribute = %attribute.name,
                        filter = ?filter,
                        "value filter produced no result; ignoring inbound value"
                    );
                    return ProcessingOutcome::Ignored;
                }
            }
        }
    }

    if let Some(converter) = attribute.meta(meta::READ_VALUE_CONVERTER) {
        match apply_converter(converter, value) {
            ProcessingOutcome::Ignored => {
                info!(
                    asset = asset_id,
                    attribute = %attribute.name,
                    "read value converter ignored inbound value"
                );
                return ProcessingOutcome::Ignored;
            }
            ProcessingOutcome::Value(converted) => value = converted,
        }
    }

    match attribute.value_type.coerce(value) {
        Some(coerced) => ProcessingOutcome::Value(coerced),
        None => {
            info!(
                asset = asset_id,
                attribute = %attribute.name,
                value_type = %attribute.value_type,
                "inbound value could not be coerced to the attribute type; ignoring"
            );
            ProcessingOutcome::Ignored
        }
    }
}

fn parse_filters(
    asset_id: &str,
    attribute: &Attribute,
    definition: &Value,
) -> Option<Vec<CompiledFilter>> {
    let json: Option<serde_json::Value> = match definition {
        Value::Array(_) => Some(definition.clone().into()),
        Value::Object(_) => Some(Value::Array(vec![definition.clone()]).into()),
        _ => None,
    };
    let filters: Vec<ValueFilter> = match json.map(serde_json::from_value) {
        Some(Ok(filters)) => filters,
        Some(Err(err)) => {
            warn!(
                asset = asset_id,
                attribute = %attribute.name,
                error = %err,
                "value filters meta is malformed; ignoring inbound value"
            );
            return None;
        }
        None => {
            warn!(
                asset = asset_id,
                attribute = %attribute.name,
                "value filters meta is not an array or object; ignoring inbound value"
            );
            return None;
        }
    };

    filters
        .iter()
        .map(|filter| {
            filter.compile().map_err(|err| {
                warn!(
                    asset = asset_id,
                    attribute = %attribute.name,
                    filter = ?filter,
                    error = %err,
                    "value filter pattern is invalid; ignoring inbound value"
                );
            })
        })
        .collect::<Result<Vec<_>, ()>>()
        .ok()
}

fn apply_converter(converter: &Value, incoming: Value) -> ProcessingOutcome {
    let Some(table) = converter.as_object() else {
        warn!("value converter meta is not an object; passing value through");
        return ProcessingOutcome::Value(incoming);
    };

    let key = match &incoming {
        Value::Null => CONVERTER_NULL_KEY.to_owned(),
        other => other.to_display_string(),
    };
    let mapped = table
        .get(&key)
        .or_else(|| table.get(&key.to_uppercase()))
        .or_else(|| table.get(CONVERTER_DEFAULT));

    match mapped {
        Some(Value::String(s)) if s == CONVERTER_IGNORE => ProcessingOutcome::Ignored,
        Some(Value::String(s)) if s == CONVERTER_NULL => ProcessingOutcome::Value(Value::Null),
        Some(outgoing) => ProcessingOutcome::Value(outgoing.clone()),
        None => ProcessingOutcome::Value(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn converter(json: &str) -> Value {
        Value::parse_json(json).unwrap()
    }

    #[test]
    fn outbound_substitutes_placeholder_only_when_dynamic() {
        let attribute = Attribute::new("setpoint", ValueType::Number)
            .with_meta(meta::WRITE_VALUE, "SET {$value} C");
        assert_eq!(
            process_outbound("S1", &attribute, &Value::Number(21.5), true),
            ProcessingOutcome::Value(Value::from("SET 21.5 C"))
        );
        assert_eq!(
            process_outbound("S1", &attribute, &Value::Number(21.5), false),
            ProcessingOutcome::Value(Value::from("SET {$value} C"))
        );
    }

    #[test]
    fn outbound_converter_semantics() {
        let attribute = Attribute::new("switch", ValueType::Boolean).with_meta(
            meta::WRITE_VALUE_CONVERTER,
            converter(r#"{"TRUE": "ON", "false": "@IGNORE", "NULL": "@NULL"}"#),
        );
        assert_eq!(
            process_outbound("S1", &attribute, &Value::Bool(true), false),
            ProcessingOutcome::Value(Value::from("ON"))
        );
        assert!(process_outbound("S1", &attribute, &Value::Bool(false), false).is_ignored());
        assert_eq!(
            process_outbound("S1", &attribute, &Value::Null, false),
            ProcessingOutcome::Value(Value::Null)
        );
        assert_eq!(
            process_outbound("S1", &attribute, &Value::from("dim"), false),
            ProcessingOutcome::Value(Value::from("dim"))
        );
    }

    #[test]
    fn converter_default_key_applies_to_unmatched_values() {
        let attribute = Attribute::new("mode", ValueType::String).with_meta(
            meta::READ_VALUE_CONVERTER,
            converter(r#"{"1": "heat", "@DEFAULT": "off"}"#),
        );
        assert_eq!(
            process_inbound("S1", &attribute, &Value::Number(1.0)),
            ProcessingOutcome::Value(Value::from("heat"))
        );
        assert_eq!(
            process_inbound("S1", &attribute, &Value::Number(7.0)),
            ProcessingOutcome::Value(Value::from("off"))
        );
    }

    #[test]
    fn inbound_filters_run_in_order() {
        let attribute = Attribute::new("temp", ValueType::Number).with_meta(
            meta::VALUE_FILTERS,
            converter(
                r#"[{"type": "jsonPath", "path": "$.readings[1].raw"},
                    {"type": "regex", "pattern": "T=(\\d+\\.\\d+)", "matchGroup": 1}]"#,
            ),
        );
        let raw = Value::from(r#"{"readings": [{"raw": "T=1.0"}, {"raw": "x T=22.25 y"}]}"#);
        assert_eq!(
            process_inbound("S1", &attribute, &raw),
            ProcessingOutcome::Value(Value::Number(22.25))
        );
    }

    #[test]
    fn empty_filter_result_ignores() {
        let attribute = Attribute::new("temp", ValueType::Number).with_meta(
            meta::VALUE_FILTERS,
            converter(r#"[{"type": "regex", "pattern": "T=(\\d+)", "matchGroup": 1, "matchIndex": 1}]"#),
        );
        assert!(process_inbound("S1", &attribute, &Value::from("T=20")).is_ignored());
        assert_eq!(
            process_inbound("S1", &attribute, &Value::from("T=20 T=21")),
            ProcessingOutcome::Value(Value::Number(21.0))
        );
    }

    #[test]
    fn substring_bounds() {
        let filter = ValueFilter::Substring {
            begin_index: 2,
            end_index: Some(4),
        };
        let compiled = filter.compile().unwrap();
        assert_eq!(compiled.apply(&Value::from("ab°Cde")), Some(Value::from("°C")));
        let past_end = ValueFilter::Substring {
            begin_index: 9,
            end_index: None,
        };
        assert_eq!(past_end.compile().unwrap().apply(&Value::from("short")), None);
    }

    #[test]
    fn substring_filter_from_meta() {
        let attribute = Attribute::new("code", ValueType::String).with_meta(
            meta::VALUE_FILTERS,
            converter(r#"[{"type": "substring", "beginIndex": 0, "endIndex": 2}]"#),
        );
        assert_eq!(
            process_inbound("S1", &attribute, &Value::from("abcdef")),
            ProcessingOutcome::Value(Value::from("ab"))
        );
    }

    #[test]
    fn invalid_regex_pattern_ignores() {
        let filter = ValueFilter::Regex {
            pattern: "T=(\\d+".into(),
            match_group: 1,
            match_index: 0,
        };
        assert!(filter.compile().is_err());
        let attribute = Attribute::new("temp", ValueType::Number).with_meta(
            meta::VALUE_FILTERS,
            converter(r#"{"type": "regex", "pattern": "T=(\\d+"}"#),
        );
        assert!(process_inbound("S1", &attribute, &Value::from("T=20")).is_ignored());
    }

    #[test]
    fn coercion_failure_ignores() {
        let attribute = Attribute::new("temp", ValueType::Number);
        assert!(process_inbound("S1", &attribute, &Value::from("warm")).is_ignored());
    }

    #[test]
    fn identity_round_trip() {
        let attribute = Attribute::new("temp", ValueType::Number);
        let requested = Value::Number(21.5);
        let outbound = process_outbound("S1", &attribute, &requested, false)
            .into_value()
            .unwrap();
        assert_eq!(
            process_inbound("S1", &attribute, &outbound),
            ProcessingOutcome::Value(requested)
        );
    }

    #[test]
    fn dynamic_detection() {
        let dynamic = Attribute::new("a", ValueType::String).with_meta(meta::WRITE_VALUE, "v={$value}");
        let fixed = Attribute::new("b", ValueType::String).with_meta(meta::WRITE_VALUE, "ON");
        assert!(has_dynamic_write_value(&dynamic));
        assert!(!has_dynamic_write_value(&fixed));
    }

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("$.a['b c'][2]").unwrap(),
            vec![
                PathStep::Key("a".into()),
                PathStep::Key("b c".into()),
                PathStep::Index(2)
            ]
        );
        assert_eq!(parse_path("a.b").unwrap().len(), 2);
        assert!(parse_path("$..a").is_none());
    }
}
