// SPDX-License-Identifier: MIT

//! Schema types for flow documents
//!
//! A flow is described by a structure document (nodes and their output
//! ports) and a flows document (experiment parameters per configuration
//! key). An optional overrides document is merged over the flows document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::error::ConfigError;

/// Default cap on node transitions per walk
pub const DEFAULT_HOP_LIMIT: usize = 50;

pub const HOP_LIMIT_ENV: &str = "FLOWBENCH_HOP_LIMIT";
pub const WAIT_TIMEOUT_ENV: &str = "FLOWBENCH_WAIT_TIMEOUT_SECS";

/// Structure document: node id to node definition
pub type StructureDocument = BTreeMap<String, NodeSpec>;

/// Flows document: configuration key to opaque experiment parameters
pub type FlowsDocument = BTreeMap<String, Map<String, Value>>;

/// A node as written in the structure document
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Policy name, e.g. `AllFailFlowInstance` or `AllFail`
    pub instance_type: String,
    /// Key into the flows document
    #[serde(default)]
    pub flow: Option<String>,
    /// Output ports; a `null` target marks a deliberately unwired port
    #[serde(default)]
    pub output_node_map: Option<BTreeMap<PortKey, Option<String>>>,
}

/// Port key as written: `1` or `"1"`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortKey {
    Number(i64),
    Text(String),
}

impl PortKey {
    /// Port number in 0..=3
    pub fn port_number(&self) -> Option<u8> {
        let n = match self {
            PortKey::Number(n) => *n,
            PortKey::Text(s) => s.trim().parse().ok()?,
        };
        u8::try_from(n).ok().filter(|n| *n <= 3)
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKey::Number(n) => write!(f, "{}", n),
            PortKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<u8> for PortKey {
    fn from(port: u8) -> Self {
        PortKey::Number(i64::from(port))
    }
}

/// Engine settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum node transitions per walk
    pub hop_limit: usize,
    /// Bounded wait on the session in seconds; unset waits indefinitely
    pub wait_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hop_limit: DEFAULT_HOP_LIMIT,
            wait_timeout_secs: None,
        }
    }
}

impl EngineSettings {
    /// Apply `FLOWBENCH_HOP_LIMIT` and `FLOWBENCH_WAIT_TIMEOUT_SECS`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var(HOP_LIMIT_ENV) {
            self.hop_limit = parse_setting(HOP_LIMIT_ENV, &value)?;
        }
        if let Ok(value) = std::env::var(WAIT_TIMEOUT_ENV) {
            self.wait_timeout_secs = Some(parse_setting(WAIT_TIMEOUT_ENV, &value)?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hop_limit == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "hop_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.wait_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidSetting {
                name: "wait_timeout_secs".to_string(),
                message: "must be positive when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_setting<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidSetting {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// Everything needed to build and run one flow
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FlowDefinition {
    pub structure: StructureDocument,
    pub flows: FlowsDocument,
    #[serde(default)]
    pub overrides: FlowsDocument,
    #[serde(default)]
    pub settings: EngineSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structure_with_numeric_ports() {
        let yaml = r#"
start:
  name: Start
  instanceType: StartNode
  outputNodeMap:
    1: allfail
allfail:
  name: AllFail cfgX
  instanceType: AllFailFlowInstance
  flow: cfgX
  outputNodeMap:
    "0": end2
    1: end
    2: null
"#;
        let doc: StructureDocument = serde_yaml::from_str(yaml).unwrap();
        let allfail = &doc["allfail"];
        assert_eq!(allfail.flow.as_deref(), Some("cfgX"));

        let ports = allfail.output_node_map.as_ref().unwrap();
        assert_eq!(ports.len(), 3);
        let numbers: Vec<_> = ports.keys().filter_map(PortKey::port_number).collect();
        assert!(numbers.contains(&0) && numbers.contains(&1) && numbers.contains(&2));
        assert_eq!(ports[&PortKey::from(2)], None);
    }

    #[test]
    fn test_parse_structure_json() {
        let json = r#"{
            "n1": {"name": "Start", "instanceType": "StartNode", "outputNodeMap": {"1": "n2"}},
            "n2": {"name": "End", "instanceType": "EndNode"}
        }"#;
        let doc: StructureDocument = serde_json::from_str(json).unwrap();
        let key = doc["n1"].output_node_map.as_ref().unwrap().keys().next().unwrap();
        assert_eq!(key.port_number(), Some(1));
        assert!(doc["n2"].output_node_map.is_none());
    }

    #[test]
    fn test_port_key_range() {
        assert_eq!(PortKey::Number(3).port_number(), Some(3));
        assert_eq!(PortKey::Number(4).port_number(), None);
        assert_eq!(PortKey::Number(-1).port_number(), None);
        assert_eq!(PortKey::Text("x".into()).port_number(), None);
    }

    #[test]
    fn test_settings_defaults_and_validation() {
        let settings: EngineSettings = serde_yaml::from_str("wait_timeout_secs: 30").unwrap();
        assert_eq!(settings.hop_limit, DEFAULT_HOP_LIMIT);
        assert_eq!(settings.wait_timeout(), Some(Duration::from_secs(30)));

        let bad = EngineSettings {
            hop_limit: 0,
            wait_timeout_secs: None,
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidSetting { .. })
        ));
    }
}
