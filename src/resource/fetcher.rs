//! Inventory Executor
//!
//! Runs one [`WorkUnit`]: lists the collection (following pages when asked),
//! enriches every item with its detail call and returns the items. Nothing here
//! touches the shared result tree.

use super::planner::WorkUnit;
use super::registry::InventoryNode;
use crate::error::CallResult;
use crate::remote::RemoteClient;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};

/// Transport envelope fields removed from every payload
pub const TRANSPORT_METADATA_KEYS: &[&str] = &["ResponseMetadata"];

/// Page bookkeeping fields that never name the collection
pub const PAGINATION_KEYS: &[&str] = &[
    "IsTruncated",
    "NextToken",
    "nextToken",
    "Marker",
    "NextMarker",
    "NextPageToken",
];

/// Field injected into items that do not carry their own region
pub const REGION_FIELD: &str = "region";

/// Knobs for a single unit
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Add derived `_count` / `_short` fields
    pub with_extra: bool,
    /// Detail calls in flight per unit
    pub detail_concurrency: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            with_extra: false,
            detail_concurrency: 4,
        }
    }
}

/// Items produced by one unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutput {
    pub item_type: String,
    pub items: Vec<Value>,
}

/// Fetch and enrich everything one unit is responsible for
pub async fn fetch_unit(
    client: &dyn RemoteClient,
    unit: &WorkUnit,
    options: &FetchOptions,
) -> CallResult<UnitOutput> {
    let node = unit.node.as_ref();
    let pages = list_pages(client, node).await?;

    let item_type = resolve_item_type(node, pages.first());
    let items: Vec<Value> = pages
        .iter()
        .flat_map(|page| extract_items(page, node.item_key.as_deref()))
        .collect();

    tracing::debug!("{}: listed {} items", unit, items.len());

    let items = if node.has_detail() {
        stream::iter(items)
            .map(|item| enrich_item(client, node, item))
            .buffered(options.detail_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?
    } else {
        items
    };

    let items = items
        .into_iter()
        .map(|mut item| {
            inject_region(&mut item, unit.region_label());
            if options.with_extra {
                add_derived_fields(&mut item);
            }
            item
        })
        .collect();

    Ok(UnitOutput { item_type, items })
}

async fn list_pages(client: &dyn RemoteClient, node: &InventoryNode) -> CallResult<Vec<Value>> {
    if node.paginated {
        client.paginate(&node.list_operation, &node.params).await
    } else {
        Ok(vec![client.call(&node.list_operation, &node.params).await?])
    }
}

/// `item_key` if declared, else the first payload key of the first page in
/// response order, else the list operation name
pub fn resolve_item_type(node: &InventoryNode, first_page: Option<&Value>) -> String {
    if let Some(ref item_key) = node.item_key {
        return item_key.clone();
    }

    first_page
        .and_then(|page| page.as_object())
        .and_then(|map| {
            map.keys()
                .find(|k| {
                    !TRANSPORT_METADATA_KEYS.contains(&k.as_str())
                        && !PAGINATION_KEYS.contains(&k.as_str())
                })
                .cloned()
        })
        .unwrap_or_else(|| node.list_operation.clone())
}

/// Pull the collection out of one page
pub fn extract_items(page: &Value, item_key: Option<&str>) -> Vec<Value> {
    let collection = match item_key {
        Some(key) => match page.get(key) {
            Some(v) => v.clone(),
            None => return vec![],
        },
        None => strip_transport_metadata(page.clone()),
    };

    match collection {
        Value::Array(items) => items,
        Value::Null => vec![],
        Value::Object(ref map) if map.is_empty() => vec![],
        other => vec![other],
    }
}

/// Remove transport envelope fields from an object payload
pub fn strip_transport_metadata(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in TRANSPORT_METADATA_KEYS {
                map.shift_remove(*key);
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Look up a dot-separated path, e.g. `Key.Id`
pub fn lookup_path<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(item, |current, part| match part.parse::<usize>() {
        Ok(idx) if current.is_array() => current.get(idx),
        _ => current.get(part),
    })
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Split a listed item into the record to enrich and the join value.
///
/// Scalar items are the join value themselves. Their stub record is keyed by
/// the join field, not by the result key, so storing the detail payload
/// cannot overwrite the listed value.
fn join_value(node: &InventoryNode, item: Value) -> (Value, Option<Value>) {
    if is_scalar(&item) {
        let mut record = Map::new();
        let field = node
            .item_search_id
            .as_deref()
            .or(node.join_param())
            .unwrap_or(&node.list_operation);
        record.insert(field.to_string(), item.clone());
        return (Value::Object(record), Some(item));
    }

    let join = node
        .item_search_id
        .as_deref()
        .and_then(|key| lookup_path(&item, key))
        .cloned();
    (item, join)
}

async fn enrich_item(client: &dyn RemoteClient, node: &InventoryNode, item: Value) -> CallResult<Value> {
    let (Some(detail_operation), Some(join_param)) = (node.detail_operation.as_deref(), node.join_param())
    else {
        return Ok(item);
    };

    let (mut record, join) = join_value(node, item);
    let Some(join) = join else {
        tracing::warn!(
            "{}: item has no '{}', skipping {}",
            node.list_operation,
            node.item_search_id.as_deref().unwrap_or_default(),
            detail_operation
        );
        return Ok(record);
    };

    let mut params = Map::new();
    params.insert(join_param.to_string(), join);
    let params = Value::Object(params);

    let payload = if node.detail_paginated {
        let pages = client.paginate(detail_operation, &params).await?;
        collect_detail_pages(node, pages)
    } else {
        let response = strip_transport_metadata(client.call(detail_operation, &params).await?);
        match node.result_key.as_deref() {
            Some(key) => response.get(key).cloned().unwrap_or(Value::Null),
            None => response,
        }
    };

    if let Value::Object(ref mut map) = record {
        map.insert(node.detail_key().to_string(), payload);
    }
    Ok(record)
}

/// Concatenate the result key of every detail page, starting from an empty list
fn collect_detail_pages(node: &InventoryNode, pages: Vec<Value>) -> Value {
    let mut collected = Vec::new();
    for page in pages {
        let page = strip_transport_metadata(page);
        match node.result_key.as_deref() {
            Some(key) => match page.get(key) {
                Some(Value::Array(items)) => collected.extend(items.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(other) => collected.push(other.clone()),
            },
            None => collected.push(page),
        }
    }
    Value::Array(collected)
}

/// Add `region` unless the item already has one
fn inject_region(item: &mut Value, region: &str) {
    if let Value::Object(map) = item {
        map.entry(REGION_FIELD)
            .or_insert_with(|| Value::String(region.to_string()));
    }
}

/// Short name from an ARN or URL, e.g. `arn:aws:iam::1:role/admin` -> `admin`
fn short_name(value: &str) -> Option<String> {
    if value.starts_with("arn:") {
        let tail = value.rsplit(|c| c == '/' || c == ':').next()?;
        return Some(tail.to_string());
    }
    if value.starts_with("https://") || value.starts_with("http://") {
        let tail = value.trim_end_matches('/').rsplit('/').next()?;
        return Some(tail.to_string());
    }
    None
}

/// Derived fields for display and reporting
pub fn add_derived_fields(item: &mut Value) {
    let Value::Object(map) = item else {
        return;
    };

    let mut derived = Vec::new();
    for (key, value) in map.iter() {
        match value {
            Value::Array(arr) => derived.push((format!("{}_count", key), Value::from(arr.len()))),
            Value::String(s) => {
                if let Some(short) = short_name(s) {
                    derived.push((format!("{}_short", key), Value::String(short)));
                }
            }
            _ => {}
        }
    }

    for (key, value) in derived {
        map.entry(key).or_insert(value);
    }
}
