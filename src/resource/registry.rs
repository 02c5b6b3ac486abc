//! Resource Catalogue - Load resource definitions from YAML
//!
//! Each document maps a resource id to its definition:
//!
//! ```yaml
//! kms:
//!   category: security
//!   boto_resource_name: kms
//!   region_type: local
//!   inventory_nodes:
//!     list_keys:
//!       item_key: Keys
//!       detail_operation: describe_key
//!       item_search_id: KeyId
//!       detail_param: KeyId
//!       result_key: KeyMetadata
//!       permissions: [kms:ListKeys, kms:DescribeKey]
//! ```
//!
//! Empty strings are read as "not set". Only structural checks are made.

use crate::error::{CatalogueError, RunError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Embedded resource YAML files (compiled into the binary)
const RESOURCE_FILES: &[(&str, &str)] = &[
    ("compute.yaml", include_str!("../resources/compute.yaml")),
    ("security.yaml", include_str!("../resources/security.yaml")),
    ("storage.yaml", include_str!("../resources/storage.yaml")),
];

/// Key under which a detail response is stored when no result key is set
pub const DEFAULT_RESULT_KEY: &str = "Details";

/// How many times a resource is listed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionScope {
    /// Once per enabled region
    Local,
    /// Once, account-wide
    Global,
    /// Same as `Local`
    All,
}

impl RegionScope {
    pub fn is_global(self) -> bool {
        self == RegionScope::Global
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::All => "all",
        }
    }
}

/// One listing call plus an optional per-item detail call
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryNode {
    /// Operation returning the collection (also the node's name)
    pub list_operation: String,
    /// Response field holding the collection, `None` = the response itself
    pub item_key: Option<String>,
    pub paginated: bool,
    /// Static parameters for the listing call
    pub params: Value,
    pub detail_operation: Option<String>,
    /// Field read from each listed item as join value
    pub item_search_id: Option<String>,
    /// Parameter name of the detail call
    pub detail_param: Option<String>,
    /// Field of the detail response to keep
    pub result_key: Option<String>,
    pub detail_paginated: bool,
    /// IAM actions needed (informational)
    pub permissions: Vec<String>,
}

impl InventoryNode {
    pub fn has_detail(&self) -> bool {
        self.detail_operation.is_some()
    }

    /// Parameter name used for the detail call
    pub fn join_param(&self) -> Option<&str> {
        self.detail_param
            .as_deref()
            .or(self.item_search_id.as_deref())
    }

    /// Key the detail payload is stored under on the enriched record
    pub fn detail_key(&self) -> &str {
        self.result_key.as_deref().unwrap_or(DEFAULT_RESULT_KEY)
    }
}

/// Declarative description of how to enumerate one kind of resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub id: String,
    pub category: String,
    /// Remote service identifier
    pub service: String,
    pub region_scope: RegionScope,
    /// Nodes in declaration order
    pub nodes: Vec<InventoryNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Permissions {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawNode {
    #[serde(default)]
    item_key: Option<String>,
    #[serde(default)]
    item_search_id: Option<String>,
    #[serde(default)]
    detail_param: Option<String>,
    #[serde(default)]
    result_key: Option<String>,
    #[serde(default)]
    detail_operation: Option<String>,
    #[serde(default)]
    paginate: bool,
    #[serde(default)]
    detail_paginate: bool,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawResource {
    category: Option<String>,
    boto_resource_name: Option<String>,
    region_type: Option<RegionScope>,
    inventory_nodes: Option<serde_yaml::Mapping>,
}

/// Treat `''` and whitespace as "not set"
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn invalid(resource: &str, reason: impl Into<String>) -> CatalogueError {
    CatalogueError::Invalid {
        resource: resource.to_string(),
        reason: reason.into(),
    }
}

fn parse_node(resource: &str, name: &str, raw: RawNode) -> Result<InventoryNode, CatalogueError> {
    let params = match raw.params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(params @ Value::Object(_)) => params,
        Some(_) => {
            return Err(invalid(resource, format!("node '{}': params must be a mapping", name)))
        }
    };

    let permissions = match raw.permissions {
        None => vec![],
        Some(Permissions::One(p)) => vec![p],
        Some(Permissions::Many(ps)) => ps,
    };

    let mut node = InventoryNode {
        list_operation: name.to_string(),
        item_key: non_empty(raw.item_key),
        paginated: raw.paginate,
        params,
        detail_operation: non_empty(raw.detail_operation),
        item_search_id: non_empty(raw.item_search_id),
        detail_param: non_empty(raw.detail_param),
        result_key: non_empty(raw.result_key),
        detail_paginated: raw.detail_paginate,
        permissions,
    };

    if node.has_detail() {
        if node.join_param().is_none() {
            return Err(invalid(
                resource,
                format!("node '{}': detail_operation needs detail_param or item_search_id", name),
            ));
        }
    } else if node.item_search_id.is_some()
        || node.detail_param.is_some()
        || node.result_key.is_some()
        || node.detail_paginated
    {
        tracing::warn!(
            "resource '{}' node '{}': detail fields set without detail_operation, ignoring them",
            resource,
            name
        );
        node.item_search_id = None;
        node.detail_param = None;
        node.result_key = None;
        node.detail_paginated = false;
    }

    Ok(node)
}

fn parse_resource(id: &str, raw: RawResource) -> Result<ResourceDefinition, CatalogueError> {
    let category = non_empty(raw.category).ok_or_else(|| invalid(id, "missing category"))?;
    let service =
        non_empty(raw.boto_resource_name).ok_or_else(|| invalid(id, "missing boto_resource_name"))?;
    let region_scope = raw
        .region_type
        .ok_or_else(|| invalid(id, "missing region_type"))?;
    let raw_nodes = raw
        .inventory_nodes
        .filter(|nodes| !nodes.is_empty())
        .ok_or_else(|| invalid(id, "missing inventory_nodes"))?;

    let mut nodes = Vec::with_capacity(raw_nodes.len());
    for (key, value) in raw_nodes {
        let name = key
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid(id, "inventory node names must be strings"))?;
        let raw_node: RawNode = if value.is_null() {
            RawNode::default()
        } else {
            serde_yaml::from_value(value).map_err(|source| CatalogueError::Parse {
                origin: format!("{}.{}", id, name),
                source,
            })?
        };
        nodes.push(parse_node(id, &name, raw_node)?);
    }

    Ok(ResourceDefinition {
        id: id.to_string(),
        category,
        service,
        region_scope,
        nodes,
    })
}

/// The loaded set of resource definitions, in load order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalogue {
    resources: Vec<ResourceDefinition>,
}

impl Catalogue {
    /// Catalogue compiled into the binary
    pub fn builtin() -> Result<Self, CatalogueError> {
        let mut catalogue = Self::default();
        for (origin, content) in RESOURCE_FILES {
            catalogue.load_str(content, origin)?;
        }
        Ok(catalogue)
    }

    /// Parse one YAML stream (may hold several documents)
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, CatalogueError> {
        let mut catalogue = Self::default();
        catalogue.load_str(content, origin)?;
        Ok(catalogue)
    }

    /// Load every `*.yaml` / `*.yml` file of a directory, in file name order
    pub fn from_dir(dir: &Path) -> Result<Self, CatalogueError> {
        let read_err = |source| CatalogueError::Read {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut catalogue = Self::default();
        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| CatalogueError::Read {
                path: path.clone(),
                source,
            })?;
            catalogue.load_str(&content, &path.display().to_string())?;
        }

        tracing::info!(
            "Loaded {} resource definitions from {}",
            catalogue.len(),
            dir.display()
        );
        Ok(catalogue)
    }

    fn load_str(&mut self, content: &str, origin: &str) -> Result<(), CatalogueError> {
        let parse_err = |source| CatalogueError::Parse {
            origin: origin.to_string(),
            source,
        };

        for document in serde_yaml::Deserializer::from_str(content) {
            let Some(mapping) = Option::<serde_yaml::Mapping>::deserialize(document).map_err(parse_err)?
            else {
                continue;
            };

            for (key, value) in mapping {
                let id = key
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(origin, "resource ids must be strings"))?;
                let raw: RawResource = serde_yaml::from_value(value).map_err(parse_err)?;
                self.insert(parse_resource(&id, raw)?)?;
            }
        }

        Ok(())
    }

    fn insert(&mut self, resource: ResourceDefinition) -> Result<(), CatalogueError> {
        if self.get(&resource.id).is_some() {
            return Err(CatalogueError::Duplicate(resource.id));
        }
        self.resources.push(resource);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn resources(&self) -> &[ResourceDefinition] {
        &self.resources
    }

    pub fn ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Restrict to the given resource ids. An empty selection keeps everything.
    pub fn select(&self, ids: &[String]) -> Result<Catalogue, RunError> {
        if ids.is_empty() {
            return Ok(self.clone());
        }

        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        for id in ids {
            let resource = self
                .get(id)
                .ok_or_else(|| RunError::UnknownResource(id.clone()))?;
            if seen.insert(id.as_str()) {
                resources.push(resource.clone());
            }
        }

        Ok(Catalogue { resources })
    }

    /// Every `(service, operation, paginated)` triple the catalogue can call
    pub fn operations(&self) -> Vec<(String, String, bool)> {
        let mut seen = HashSet::new();
        let mut operations = Vec::new();
        for resource in &self.resources {
            for node in &resource.nodes {
                let detail = node
                    .detail_operation
                    .as_ref()
                    .map(|op| (op, node.detail_paginated));
                for (op, paginated) in std::iter::once((&node.list_operation, node.paginated)).chain(detail) {
                    if seen.insert((resource.service.clone(), op.clone(), paginated)) {
                        operations.push((resource.service.clone(), op.clone(), paginated));
                    }
                }
            }
        }
        operations
    }
}
