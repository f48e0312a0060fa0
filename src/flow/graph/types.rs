// SPDX-License-Identifier: MIT

//! Graph type definitions
//!
//! Nodes live in a flat arena and reference each other by [`NodeIndex`], so
//! shared targets are stored once and cycles need no special handling.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::node::Node;

/// Position of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

/// Labeled routing outcome of a node run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Port {
    /// Stable, failure did not reproduce
    NoRepro = 0,
    /// Failure reproduced
    Repro = 1,
    /// Mixed pass/fail results
    Intermittent = 2,
    /// Too many execution failures or cancellations
    HardwareFailure = 3,
}

impl Port {
    pub const ALL: [Port; 4] = [
        Port::NoRepro,
        Port::Repro,
        Port::Intermittent,
        Port::HardwareFailure,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Port::NoRepro => "no repro",
            Port::Repro => "repro confirmed",
            Port::Intermittent => "intermittent",
            Port::HardwareFailure => "hardware failure",
        }
    }
}

impl From<Port> for u8 {
    fn from(port: Port) -> u8 {
        port as u8
    }
}

impl TryFrom<u8> for Port {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Port::NoRepro),
            1 => Ok(Port::Repro),
            2 => Ok(Port::Intermittent),
            3 => Ok(Port::HardwareFailure),
            other => Err(format!("invalid port {}", other)),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Sparse port map: each port is bound to zero or one node
pub type PortMap = [Option<NodeIndex>; 4];

/// Decision policy of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    Start,
    End,
    SingleFail,
    AllFail,
    MajorityFail,
    Adaptive,
}

impl PolicyKind {
    /// Start and End nodes never drive a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, PolicyKind::Start | PolicyKind::End)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Start => "Start",
            PolicyKind::End => "End",
            PolicyKind::SingleFail => "SingleFail",
            PolicyKind::AllFail => "AllFail",
            PolicyKind::MajorityFail => "MajorityFail",
            PolicyKind::Adaptive => "Adaptive",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    /// Accepts both the short names and the designer's instance type names
    /// (`StartNode`, `AllFailFlowInstance`, ...)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized
            .strip_suffix("flowinstance")
            .or_else(|| normalized.strip_suffix("node"))
            .unwrap_or(&normalized);

        match name {
            "start" => Ok(PolicyKind::Start),
            "end" => Ok(PolicyKind::End),
            "singlefail" => Ok(PolicyKind::SingleFail),
            "allfail" => Ok(PolicyKind::AllFail),
            "majorityfail" => Ok(PolicyKind::MajorityFail),
            "adaptive" => Ok(PolicyKind::Adaptive),
            _ => Err(format!("unknown instance type '{}'", s)),
        }
    }
}

/// Immutable graph of bound nodes
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    ids: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl Graph {
    /// Assemble a graph from an arena of nodes
    pub fn new(nodes: Vec<Node>, root: NodeIndex) -> Self {
        let ids = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), NodeIndex(i)))
            .collect();
        Self { nodes, ids, root }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0)
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.ids.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index_of(id).and_then(|i| self.node(i))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }
}
