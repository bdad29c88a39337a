//! Declarative tree construction.
//!
//! A configuration record (YAML or JSON) lists object descriptors in
//! definition order; each names a type resolved against a [`Registry`] of
//! builders. Rust has no run-time module imports, so the record's
//! `imports` list instead gates which registry namespaces the record may
//! reference.

use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tree::System;
use crate::types::NodeId;

/// A configuration record describing objects to build.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Registry namespaces this record may reference by short name.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Object descriptors, in definition order. Earlier objects are
    /// referenceable by name from later `children` lists; forward
    /// references are unsupported.
    #[serde(default)]
    pub objects: Vec<ObjectDesc>,
}

/// One object descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectDesc {
    pub name: String,
    /// Dotted type reference: `namespace.type`, resolved against the
    /// record's `imports` and the registry.
    #[serde(rename = "type")]
    pub type_ref: String,
    /// Keyword arguments for the builder. A `children` entry is handled
    /// by the loader itself.
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// A `children` entry: a nested descriptor, or the name of an object
/// defined earlier in the record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChildRef {
    Desc(ObjectDesc),
    Name(String),
}

/// Builds one object kind into the system. Receives the descriptor's name
/// and its params minus `children`.
pub type Builder =
    Box<dyn Fn(&mut System, &str, &serde_json::Map<String, Value>) -> anyhow::Result<NodeId> + Send + Sync>;

/// Namespace → type → builder map; the loader's replacement for dynamic
/// imports.
pub struct Registry {
    namespaces: BTreeMap<String, BTreeMap<String, Builder>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            namespaces: BTreeMap::new(),
        }
    }

    /// A registry carrying the built-in `statewire` namespace:
    /// `statewire.object` (params become attributes) and
    /// `statewire.machine` (params `labels`, optional `default`).
    pub fn with_builtins() -> Self {
        #[derive(Deserialize)]
        struct MachineParams {
            labels: Vec<String>,
            #[serde(default)]
            default: Option<String>,
        }

        let mut registry = Registry::new();
        registry.register(
            "statewire",
            "object",
            Box::new(|sys, name, params| {
                let id = sys.new_object(name);
                for (key, value) in params {
                    sys.set_attr(id, key.as_str(), value.clone())?;
                }
                Ok(id)
            }),
        );
        registry.register(
            "statewire",
            "machine",
            Box::new(|sys, name, params| {
                let params: MachineParams =
                    serde_json::from_value(Value::Object(params.clone()))?;
                let labels: Vec<&str> = params.labels.iter().map(String::as_str).collect();
                let id = sys.new_machine(name, &labels, params.default.as_deref())?;
                Ok(id.node())
            }),
        );
        registry
    }

    pub fn register(&mut self, namespace: &str, type_name: &str, builder: Builder) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(type_name.to_string(), builder);
    }

    fn resolve(&self, imports: &[String], type_ref: &str) -> Option<&Builder> {
        let (namespace, rest) = type_ref.split_once('.')?;
        if !imports.iter().any(|i| i == namespace) {
            return None;
        }
        self.namespaces.get(namespace)?.get(rest)
    }

    /// Build every object in the record. Returns the name → node map of
    /// top-level objects, in definition order by name lookup.
    pub fn build(
        &self,
        system: &mut System,
        config: &SystemConfig,
    ) -> Result<BTreeMap<String, NodeId>> {
        let mut built = BTreeMap::new();
        for desc in &config.objects {
            let id = self.build_desc(system, &config.imports, &built, desc)?;
            built.insert(desc.name.clone(), id);
        }
        Ok(built)
    }

    fn build_desc(
        &self,
        system: &mut System,
        imports: &[String],
        built: &BTreeMap<String, NodeId>,
        desc: &ObjectDesc,
    ) -> Result<NodeId> {
        let builder =
            self.resolve(imports, &desc.type_ref)
                .ok_or_else(|| Error::ConstructionFailed {
                    name: desc.name.clone(),
                    cause: anyhow!(
                        "cannot resolve type '{}' against imports",
                        desc.type_ref
                    ),
                })?;
        let mut params = desc.params.clone();
        let children = params.remove("children");

        let id = builder(system, &desc.name, &params).map_err(|cause| {
            Error::ConstructionFailed {
                name: desc.name.clone(),
                cause,
            }
        })?;

        if let Some(children) = children {
            let children: Vec<ChildRef> = serde_json::from_value(children).map_err(|err| {
                Error::ConstructionFailed {
                    name: desc.name.clone(),
                    cause: anyhow!("invalid children list: {err}"),
                }
            })?;
            for child in children {
                let (child_name, child_id) = match child {
                    ChildRef::Name(child_name) => {
                        let child_id =
                            *built
                                .get(&child_name)
                                .ok_or_else(|| Error::ConstructionFailed {
                                    name: desc.name.clone(),
                                    cause: anyhow!(
                                        "child '{child_name}' is not defined yet"
                                    ),
                                })?;
                        (child_name, child_id)
                    }
                    ChildRef::Desc(child_desc) => {
                        let child_id = self.build_desc(system, imports, built, &child_desc)?;
                        (child_desc.name, child_id)
                    }
                };
                system
                    .add_child(id, &child_name, child_id)
                    .map_err(|err| Error::ConstructionFailed {
                        name: desc.name.clone(),
                        cause: err.into(),
                    })?;
            }
        }
        Ok(id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a YAML configuration record.
pub fn parse_config_yaml(yaml: &str) -> Result<SystemConfig> {
    serde_yaml::from_str(yaml).map_err(|err| Error::ConstructionFailed {
        name: "<config>".to_string(),
        cause: err.into(),
    })
}

/// Parse a JSON configuration record.
pub fn parse_config_json(json: &str) -> Result<SystemConfig> {
    serde_json::from_str(json).map_err(|err| Error::ConstructionFailed {
        name: "<config>".to_string(),
        cause: err.into(),
    })
}
