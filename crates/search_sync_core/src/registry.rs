//! Dependency registry — which root types are indexed and which non-root
//! entity types invalidate them.
//!
//! Populated once at startup (builder calls or a YAML declaration), validated
//! as a whole, then shared read-only as `Arc<SearchRegistry>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::SyncError;
use crate::schema::{is_identifier, DependencyPath, Relation, RootEntity};

/// Longest accepted dependency path, in hops.
pub const MAX_PATH_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate registration for '{0}'")]
    Duplicate(String),

    #[error("'{0}' is a root type and cannot carry a dependency path")]
    RootAsDependent(String),

    #[error("dependency path for '{0}' has no hops")]
    EmptyPath(String),

    #[error("dependency path for '{entity_type}' ends at '{target}', which is not a registered root")]
    DanglingPath { entity_type: String, target: String },

    #[error("dependency path for '{entity_type}' revisits table '{table}'")]
    Cycle { entity_type: String, table: String },

    #[error("dependency path for '{entity_type}' has {depth} hops (max {MAX_PATH_DEPTH})")]
    TooDeep { entity_type: String, depth: usize },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("document schema for '{entity_type}' does not compile: {message}")]
    Schema { entity_type: String, message: String },

    #[error("registry yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// YAML shape of a registry declaration.
#[derive(Debug, Default, Deserialize)]
pub struct RegistrySpec {
    #[serde(default)]
    pub roots: Vec<RootEntity>,
    #[serde(default)]
    pub dependencies: Vec<DependencyPath>,
}

#[derive(Debug, Default)]
pub struct SearchRegistryBuilder {
    roots: Vec<RootEntity>,
    paths: Vec<DependencyPath>,
}

impl SearchRegistryBuilder {
    pub fn root(mut self, root: RootEntity) -> Self {
        self.roots.push(root);
        self
    }

    pub fn depends(mut self, path: DependencyPath) -> Self {
        self.paths.push(path);
        self
    }

    pub fn build(self) -> Result<SearchRegistry, RegistryError> {
        let mut roots = HashMap::with_capacity(self.roots.len());
        let mut root_order = Vec::with_capacity(self.roots.len());
        let mut validators = HashMap::new();

        for root in self.roots {
            check_identifier(root.table_name())?;
            check_relations(&root.relations)?;
            if let Some(schema) = &root.document_schema {
                let validator =
                    jsonschema::validator_for(schema).map_err(|e| RegistryError::Schema {
                        entity_type: root.entity_type.clone(),
                        message: e.to_string(),
                    })?;
                validators.insert(root.entity_type.clone(), Arc::new(validator));
            }
            if roots.contains_key(&root.entity_type) {
                return Err(RegistryError::Duplicate(root.entity_type));
            }
            root_order.push(root.entity_type.clone());
            roots.insert(root.entity_type.clone(), root);
        }

        let mut paths = HashMap::with_capacity(self.paths.len());
        for path in self.paths {
            validate_path(&path, &roots)?;
            if paths.contains_key(&path.entity_type) {
                return Err(RegistryError::Duplicate(path.entity_type));
            }
            paths.insert(path.entity_type.clone(), path);
        }

        Ok(SearchRegistry {
            roots,
            root_order,
            paths,
            validators,
        })
    }
}

fn check_identifier(s: &str) -> Result<(), RegistryError> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(s.to_string()))
    }
}

fn check_relations(relations: &[Relation]) -> Result<(), RegistryError> {
    for relation in relations {
        check_identifier(&relation.table)?;
        for ident in relation.link.identifiers() {
            check_identifier(ident)?;
        }
        check_relations(&relation.relations)?;
    }
    Ok(())
}

fn validate_path(
    path: &DependencyPath,
    roots: &HashMap<String, RootEntity>,
) -> Result<(), RegistryError> {
    let entity_type = &path.entity_type;
    if roots.contains_key(entity_type) {
        return Err(RegistryError::RootAsDependent(entity_type.clone()));
    }
    if path.hops.is_empty() {
        return Err(RegistryError::EmptyPath(entity_type.clone()));
    }
    if path.hops.len() > MAX_PATH_DEPTH {
        return Err(RegistryError::TooDeep {
            entity_type: entity_type.clone(),
            depth: path.hops.len(),
        });
    }

    check_identifier(path.table_name())?;
    let mut visited = HashSet::from([path.table_name()]);
    for hop in &path.hops {
        check_identifier(hop.table_name())?;
        for ident in hop.link.identifiers() {
            check_identifier(ident)?;
        }
        if !visited.insert(hop.table_name()) {
            return Err(RegistryError::Cycle {
                entity_type: entity_type.clone(),
                table: hop.table_name().to_string(),
            });
        }
    }

    let last = &path.hops[path.hops.len() - 1];
    match roots.get(&last.target) {
        Some(root) if root.table_name() == last.table_name() => Ok(()),
        _ => Err(RegistryError::DanglingPath {
            entity_type: entity_type.clone(),
            target: last.target.clone(),
        }),
    }
}

/// Immutable, validated registry of root types and dependency paths.
pub struct SearchRegistry {
    roots: HashMap<String, RootEntity>,
    root_order: Vec<String>,
    paths: HashMap<String, DependencyPath>,
    validators: HashMap<String, Arc<jsonschema::Validator>>,
}

impl std::fmt::Debug for SearchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchRegistry")
            .field("roots", &self.root_order)
            .field("paths", &self.paths.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SearchRegistry {
    pub fn builder() -> SearchRegistryBuilder {
        SearchRegistryBuilder::default()
    }

    pub fn from_spec(spec: RegistrySpec) -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        for root in spec.roots {
            builder = builder.root(root);
        }
        for path in spec.dependencies {
            builder = builder.depends(path);
        }
        builder.build()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let spec: RegistrySpec = serde_yaml::from_str(yaml)?;
        Self::from_spec(spec)
    }

    /// Dependency path registered for `entity_type`, if any.
    pub fn resolve(&self, entity_type: &str) -> Option<&DependencyPath> {
        self.paths.get(entity_type)
    }

    pub fn root(&self, entity_type: &str) -> Option<&RootEntity> {
        self.roots.get(entity_type)
    }

    pub fn is_root(&self, entity_type: &str) -> bool {
        self.roots.contains_key(entity_type)
    }

    /// Root types in registration order.
    pub fn roots(&self) -> impl Iterator<Item = &RootEntity> {
        self.root_order.iter().filter_map(|name| self.roots.get(name))
    }

    pub fn require_root(&self, entity_type: &str) -> Result<&RootEntity, SyncError> {
        self.root(entity_type)
            .ok_or_else(|| SyncError::NotFound(format!("root type '{entity_type}'")))
    }

    /// Check a document snapshot before it is written to the outbox.
    ///
    /// The document must be an object whose `id` equals `entity_id` and, when
    /// the root type declares a schema, must satisfy it.
    pub fn validate_document(
        &self,
        entity_type: &str,
        entity_id: i64,
        document: &Value,
    ) -> Result<(), SyncError> {
        self.require_root(entity_type)?;
        let invalid = |violations: Vec<String>| SyncError::InvalidDocument {
            entity_type: entity_type.to_string(),
            entity_id,
            violations,
        };

        let Some(object) = document.as_object() else {
            return Err(invalid(vec!["document is not a JSON object".into()]));
        };
        match object.get("id").and_then(Value::as_i64) {
            Some(id) if id == entity_id => {}
            Some(id) => return Err(invalid(vec![format!("/id: {id} != entity id {entity_id}")])),
            None => return Err(invalid(vec!["/id: missing or not an integer".into()])),
        }

        if let Some(validator) = self.validators.get(entity_type) {
            let violations: Vec<String> = validator
                .iter_errors(document)
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect();
            if !violations.is_empty() {
                return Err(invalid(violations));
            }
        }
        Ok(())
    }
}
