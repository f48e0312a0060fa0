// SPDX-License-Identifier: MIT

//! Flow document loader
//!
//! Files ending in `.json` are parsed as JSON, everything else as YAML.

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use crate::core::error::ConfigError;

use super::types::{EngineSettings, FlowDefinition, FlowsDocument, StructureDocument};

/// Loads structure, flows, override and settings documents
pub struct FlowLoader;

impl FlowLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_structure<P: AsRef<Path>>(&self, path: P) -> Result<StructureDocument, ConfigError> {
        load_document(path.as_ref())
    }

    pub fn load_flows<P: AsRef<Path>>(&self, path: P) -> Result<FlowsDocument, ConfigError> {
        load_document(path.as_ref())
    }

    /// Engine settings from a file, then environment overrides
    pub fn load_settings<P: AsRef<Path>>(&self, path: Option<P>) -> Result<EngineSettings, ConfigError> {
        let settings = match path {
            Some(p) => load_document(p.as_ref())?,
            None => EngineSettings::default(),
        };
        settings.with_env_overrides()
    }

    /// Load a complete flow definition from its separate documents
    pub fn load_definition<P: AsRef<Path>>(
        &self,
        structure: P,
        flows: P,
        overrides: Option<P>,
        settings: Option<P>,
    ) -> Result<FlowDefinition, ConfigError> {
        let definition = FlowDefinition {
            structure: self.load_structure(structure)?,
            flows: self.load_flows(flows)?,
            overrides: match overrides {
                Some(p) => self.load_flows(p)?,
                None => FlowsDocument::new(),
            },
            settings: self.load_settings(settings)?,
        };
        log::info!(
            "Loaded flow with {} node(s) and {} configuration(s)",
            definition.structure.len(),
            definition.flows.len()
        );
        Ok(definition)
    }

    pub fn parse_yaml<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn parse_json<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}

impl Default for FlowLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        FlowLoader::parse_json(&content)
    } else {
        FlowLoader::parse_yaml(&content)
    }
}
