//! Task Planner
//!
//! Expands the catalogue into [`WorkUnit`]s: one per enabled region for
//! region-scoped resources, a single one for global resources. Every unit
//! targets its own `(category, resource, node, region)` slot, so no two units
//! ever write the same leaf of the result tree.

use super::registry::{Catalogue, InventoryNode};
use crate::error::RunError;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Region label used in the result tree for account-wide units
pub const GLOBAL_REGION: &str = "global";

/// One independently failable traversal task
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub category: String,
    pub resource_id: String,
    pub service: String,
    pub node: Arc<InventoryNode>,
    /// `None` for global resources
    pub region: Option<String>,
}

impl WorkUnit {
    /// Region as written into the tree and injected into items
    pub fn region_label(&self) -> &str {
        self.region.as_deref().unwrap_or(GLOBAL_REGION)
    }

    pub fn node_name(&self) -> &str {
        &self.node.list_operation
    }

    /// Item type known before any call is made. Without `item_key` this is a
    /// placeholder until a response names the collection.
    pub fn planned_item_type(&self) -> &str {
        self.node
            .item_key
            .as_deref()
            .unwrap_or(&self.node.list_operation)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.category,
            self.resource_id,
            self.node.list_operation,
            self.region_label()
        )
    }
}

/// The full set of units for a run
#[derive(Debug, Clone, Default)]
pub struct Plan {
    units: Vec<WorkUnit>,
}

impl Plan {
    /// Wrap an explicit unit list, e.g. failed units being re-submitted
    pub fn from_units(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }

    pub fn total(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }
}

/// Drop duplicate and blank region names, keeping first-seen order
fn dedup_regions(regions: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    regions
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && seen.insert(*r))
        .collect()
}

/// Build the plan for `catalogue` over `regions`
pub fn plan(catalogue: &Catalogue, regions: &[String]) -> Result<Plan, RunError> {
    let regions = dedup_regions(regions);
    let mut units = Vec::new();

    for resource in catalogue.resources() {
        let mut item_types = HashSet::new();
        for node in &resource.nodes {
            if let Some(ref item_key) = node.item_key {
                if !item_types.insert(item_key.as_str()) {
                    return Err(RunError::DuplicateLeaf {
                        resource: resource.id.clone(),
                        item_type: item_key.clone(),
                    });
                }
            }
        }

        if !resource.region_scope.is_global() && regions.is_empty() {
            return Err(RunError::NoRegions(resource.id.clone()));
        }

        for node in &resource.nodes {
            let node = Arc::new(node.clone());
            let unit = |region: Option<&str>| WorkUnit {
                category: resource.category.clone(),
                resource_id: resource.id.clone(),
                service: resource.service.clone(),
                node: node.clone(),
                region: region.map(str::to_string),
            };

            if resource.region_scope.is_global() {
                units.push(unit(None));
            } else {
                units.extend(regions.iter().map(|region| unit(Some(region))));
            }
        }
    }

    tracing::info!(
        "Planned {} work units for {} resources over {} regions",
        units.len(),
        catalogue.len(),
        regions.len()
    );

    Ok(Plan { units })
}
