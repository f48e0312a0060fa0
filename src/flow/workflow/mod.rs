// SPDX-License-Identifier: MIT

pub mod builder;
pub mod loader;
pub mod types;

pub use builder::FlowGraphBuilder;
pub use loader::FlowLoader;
pub use types::{
    EngineSettings, FlowDefinition, FlowsDocument, NodeSpec, PortKey, StructureDocument,
};
