// SPDX-License-Identifier: MIT

//! Flow graph builder
//!
//! Validates the structure and flows documents as a whole, then builds the
//! nodes reachable from the root depth-first into an arena. A node referenced
//! from several ports is built once; cycles are allowed and left to the
//! executor's hop limit.

use std::collections::{BTreeMap, HashMap};

use crate::core::error::ConfigError;
use crate::core::session::ExperimentConfig;
use crate::flow::graph::{Graph, Node, NodeIndex, PolicyKind, Port, PortMap};

use super::types::{FlowDefinition, FlowsDocument, NodeSpec, StructureDocument};

/// Builds a [`Graph`] from flow documents
pub struct FlowGraphBuilder {
    structure: StructureDocument,
    flows: FlowsDocument,
    overrides: FlowsDocument,
}

/// A node spec after validation
struct ValidatedNode {
    kind: PolicyKind,
    ports: BTreeMap<Port, String>,
}

impl FlowGraphBuilder {
    pub fn new(structure: StructureDocument, flows: FlowsDocument) -> Self {
        Self {
            structure,
            flows,
            overrides: FlowsDocument::new(),
        }
    }

    pub fn from_definition(definition: &FlowDefinition) -> Self {
        Self::new(definition.structure.clone(), definition.flows.clone())
            .with_overrides(definition.overrides.clone())
    }

    /// Parameters merged over the flows document, per configuration key
    pub fn with_overrides(mut self, overrides: FlowsDocument) -> Self {
        self.overrides = overrides;
        self
    }

    /// Check the whole structure document without building anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_all().map(|_| ())
    }

    /// Build from the unique Start node
    pub fn build(&self) -> Result<Graph, ConfigError> {
        let validated = self.validate_all()?;
        let starts: Vec<&String> = validated
            .iter()
            .filter(|(_, v)| v.kind == PolicyKind::Start)
            .map(|(id, _)| id)
            .collect();
        match starts.as_slice() {
            [] => Err(ConfigError::NoStartNode),
            [root] => self.build_graph(&validated, root),
            _ => Err(ConfigError::MultipleStartNodes(
                starts.into_iter().cloned().collect(),
            )),
        }
    }

    /// Build from an explicit root node
    pub fn build_from(&self, root_id: &str) -> Result<Graph, ConfigError> {
        let validated = self.validate_all()?;
        if !validated.contains_key(root_id) {
            return Err(ConfigError::UnknownNode(root_id.to_string()));
        }
        self.build_graph(&validated, root_id)
    }

    fn validate_all(&self) -> Result<BTreeMap<String, ValidatedNode>, ConfigError> {
        let mut validated = BTreeMap::new();
        let mut starts = Vec::new();

        for (id, spec) in &self.structure {
            let node = self.validate_node(id, spec)?;
            if node.kind == PolicyKind::Start {
                starts.push(id.clone());
            }
            validated.insert(id.clone(), node);
        }

        if starts.len() > 1 {
            return Err(ConfigError::MultipleStartNodes(starts));
        }
        Ok(validated)
    }

    fn validate_node(&self, id: &str, spec: &NodeSpec) -> Result<ValidatedNode, ConfigError> {
        let kind: PolicyKind = spec
            .instance_type
            .parse()
            .map_err(|_| ConfigError::UnknownPolicy {
                node_id: id.to_string(),
                instance_type: spec.instance_type.clone(),
            })?;

        if !kind.is_terminal() {
            let key = spec
                .flow
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingConfigKey(id.to_string()))?;
            if !self.flows.contains_key(key) {
                return Err(ConfigError::UndefinedConfigKey {
                    node_id: id.to_string(),
                    config_key: key.to_string(),
                });
            }
        }

        let map = spec.output_node_map.as_ref();
        if kind == PolicyKind::End && map.is_some_and(|m| !m.is_empty()) {
            return Err(ConfigError::EndHasOutputs(id.to_string()));
        }

        let mut ports = BTreeMap::new();
        for (key, target) in map.into_iter().flatten() {
            let port = key
                .port_number()
                .and_then(|n| Port::try_from(n).ok())
                .filter(|p| !ports.contains_key(p))
                .ok_or_else(|| ConfigError::InvalidPort {
                    node_id: id.to_string(),
                    port: key.to_string(),
                })?;

            let Some(target) = target else {
                continue;
            };
            let target_spec = self
                .structure
                .get(target)
                .ok_or_else(|| ConfigError::UnknownNode(target.clone()))?;
            if matches!(target_spec.instance_type.parse::<PolicyKind>(), Ok(PolicyKind::Start)) {
                return Err(ConfigError::StartHasInbound {
                    start_id: target.clone(),
                    from_id: id.to_string(),
                });
            }
            ports.insert(port, target.clone());
        }

        Ok(ValidatedNode { kind, ports })
    }

    fn build_graph(
        &self,
        validated: &BTreeMap<String, ValidatedNode>,
        root_id: &str,
    ) -> Result<Graph, ConfigError> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut built: HashMap<String, NodeIndex> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();

        let root = self.alloc(root_id, validated, &mut nodes, &mut built)?;
        stack.push(root_id.to_string());

        while let Some(id) = stack.pop() {
            let Some(node) = validated.get(&id) else {
                return Err(ConfigError::UnknownNode(id));
            };
            let mut ports: PortMap = [None; 4];
            for (port, target) in &node.ports {
                let index = match built.get(target) {
                    Some(index) => *index,
                    None => {
                        stack.push(target.clone());
                        self.alloc(target, validated, &mut nodes, &mut built)?
                    }
                };
                ports[port.index()] = Some(index);
            }
            if let Some(index) = built.get(&id) {
                nodes[index.0].ports = ports;
            }
        }

        log::info!(
            "Built flow graph with {} node(s) from root '{}'",
            nodes.len(),
            root_id
        );
        Ok(Graph::new(nodes, root))
    }

    /// Create the arena slot for a node; ports are filled in when it is visited
    fn alloc(
        &self,
        id: &str,
        validated: &BTreeMap<String, ValidatedNode>,
        nodes: &mut Vec<Node>,
        built: &mut HashMap<String, NodeIndex>,
    ) -> Result<NodeIndex, ConfigError> {
        let spec = self
            .structure
            .get(id)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))?;
        let kind = validated
            .get(id)
            .map(|v| v.kind)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))?;

        let index = NodeIndex(nodes.len());
        nodes.push(Node {
            id: id.to_string(),
            name: if spec.name.is_empty() {
                id.to_string()
            } else {
                spec.name.clone()
            },
            kind,
            config: spec.flow.as_deref().and_then(|key| self.experiment_config(key)),
            ports: [None; 4],
        });
        built.insert(id.to_string(), index);
        Ok(index)
    }

    /// Flows parameters for `key` with overrides applied
    fn experiment_config(&self, key: &str) -> Option<ExperimentConfig> {
        let mut parameters = self.flows.get(key)?.clone();
        if let Some(overrides) = self.overrides.get(key) {
            for (name, value) in overrides {
                parameters.insert(name.clone(), value.clone());
            }
        }
        Some(ExperimentConfig::new(key, parameters))
    }
}
