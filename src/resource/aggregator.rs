//! Result Aggregator
//!
//! The result tree has a single owner: the aggregation task started by
//! [`spawn_aggregator`]. Units never touch it; their output arrives as
//! [`LeafWrite`] messages on a channel and is merged in arrival order.

use crate::error::RunError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// region → items
pub type RegionMap = BTreeMap<String, Vec<Value>>;
/// item type → region → items
pub type ItemTypeMap = BTreeMap<String, RegionMap>;
/// resource → item type → region → items
pub type ResourceMap = BTreeMap<String, ItemTypeMap>;

/// Address of one leaf
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafPath {
    pub category: String,
    pub resource: String,
    pub item_type: String,
    pub region: String,
}

impl LeafPath {
    pub fn new(category: &str, resource: &str, item_type: &str, region: &str) -> Self {
        Self {
            category: category.to_string(),
            resource: resource.to_string(),
            item_type: item_type.to_string(),
            region: region.to_string(),
        }
    }
}

/// One unit's contribution
#[derive(Debug, Clone, PartialEq)]
pub struct LeafWrite {
    pub path: LeafPath,
    pub items: Vec<Value>,
}

/// What [`ResultTree::merge`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    /// The leaf existed already and the items were appended
    Appended,
}

/// `category → resource → item type → region → items`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultTree {
    categories: BTreeMap<String, ResourceMap>,
}

impl ResultTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one leaf, creating missing levels on the way
    pub fn merge(&mut self, write: LeafWrite) -> MergeOutcome {
        let LeafWrite { path, items } = write;
        let regions = self
            .categories
            .entry(path.category)
            .or_default()
            .entry(path.resource)
            .or_default()
            .entry(path.item_type)
            .or_default();

        match regions.get_mut(&path.region) {
            Some(existing) => {
                existing.extend(items);
                MergeOutcome::Appended
            }
            None => {
                regions.insert(path.region, items);
                MergeOutcome::Created
            }
        }
    }

    pub fn leaf(&self, path: &LeafPath) -> Option<&[Value]> {
        self.categories
            .get(&path.category)?
            .get(&path.resource)?
            .get(&path.item_type)?
            .get(&path.region)
            .map(Vec::as_slice)
    }

    pub fn category(&self, name: &str) -> Option<&ResourceMap> {
        self.categories.get(name)
    }

    pub fn categories(&self) -> &BTreeMap<String, ResourceMap> {
        &self.categories
    }

    /// Every leaf path with its items, in tree order
    pub fn leaves(&self) -> impl Iterator<Item = (LeafPath, &[Value])> + '_ {
        self.categories.iter().flat_map(|(category, resources)| {
            resources.iter().flat_map(move |(resource, item_types)| {
                item_types.iter().flat_map(move |(item_type, regions)| {
                    regions.iter().map(move |(region, items)| {
                        (
                            LeafPath::new(category, resource, item_type, region),
                            items.as_slice(),
                        )
                    })
                })
            })
        })
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().count()
    }

    pub fn item_count(&self) -> usize {
        self.leaves().map(|(_, items)| items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Sending side of the aggregation channel
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<LeafWrite>,
}

impl AggregatorHandle {
    pub async fn submit(&self, write: LeafWrite) -> Result<(), RunError> {
        self.tx
            .send(write)
            .await
            .map_err(|_| RunError::AggregatorLost)
    }
}

/// Start the aggregation task.
///
/// The task finishes and hands back the tree once every handle is dropped.
pub fn spawn_aggregator(buffer: usize) -> (AggregatorHandle, JoinHandle<ResultTree>) {
    let (tx, mut rx) = mpsc::channel::<LeafWrite>(buffer.max(1));

    let task = tokio::spawn(async move {
        let mut tree = ResultTree::new();
        while let Some(write) = rx.recv().await {
            let path = write.path.clone();
            let count = write.items.len();
            if tree.merge(write) == MergeOutcome::Appended {
                tracing::warn!(
                    "leaf {}/{}/{}/{} written twice, appended {} items",
                    path.category,
                    path.resource,
                    path.item_type,
                    path.region,
                    count
                );
            }
        }
        tree
    });

    (AggregatorHandle { tx }, task)
}
