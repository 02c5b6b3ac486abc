//! Runner
//!
//! Drives a [`Plan`] to completion: one tokio task per unit, at most
//! `concurrency` of them running, every outcome counted by the tracker and
//! every successful output forwarded to the aggregator. The tree is only handed
//! out after all units have returned.

use super::aggregator::{spawn_aggregator, LeafPath, LeafWrite, ResultTree};
use super::fetcher::{fetch_unit, FetchOptions, UnitOutput};
use super::planner::{plan, Plan, WorkUnit};
use super::progress::{FailureKind, ProgressSnapshot, ProgressTracker, UnitFailure};
use super::registry::Catalogue;
use crate::config::RunConfig;
use crate::error::RunError;
use crate::remote::{ClientPool, Connector};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use uuid::Uuid;

/// Everything a run needs, built once and shared with every unit
pub struct RunContext {
    pub config: RunConfig,
    pub clients: ClientPool,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
}

impl RunContext {
    pub fn new(config: RunConfig, connector: Arc<dyn Connector>) -> Self {
        let (progress, _) = watch::channel(ProgressSnapshot::default());
        Self {
            config,
            clients: ClientPool::new(connector),
            progress: Arc::new(progress),
        }
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            with_extra: self.config.with_extra,
            detail_concurrency: self.config.detail_concurrency,
        }
    }
}

/// Final state of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub tree: ResultTree,
    pub progress: ProgressSnapshot,
    pub failures: Vec<UnitFailure>,
    /// Units that never ran or were abandoned at the deadline
    pub cancelled: usize,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Units to hand back to [`Runner::run_units`] for another attempt
    pub fn failed_units(&self) -> Vec<WorkUnit> {
        self.failures.iter().map(|f| f.unit.clone()).collect()
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

enum UnitResult {
    Finished(Result<UnitOutput, FailureKind>),
    /// The pool closed before the unit got a slot
    Cancelled,
}

struct UnitReport {
    unit: WorkUnit,
    result: UnitResult,
}

/// `(resource, node)`
type NodeId = (String, String);

/// Leaves of nodes without `item_key`.
///
/// Their item type is only known once a unit has seen a response, so they are
/// held back until the run ends and then written under one item type per node.
#[derive(Default)]
struct DeferredLeaves {
    /// region → item type seen in that region's response
    resolved: HashMap<NodeId, BTreeMap<String, String>>,
    writes: Vec<(NodeId, LeafWrite)>,
}

impl DeferredLeaves {
    fn node_id(unit: &WorkUnit) -> NodeId {
        (unit.resource_id.clone(), unit.node_name().to_string())
    }

    fn resolve(&mut self, unit: &WorkUnit, item_type: &str) {
        // the operation name is only a placeholder, not a resolution
        if item_type == unit.node_name() {
            return;
        }
        self.resolved
            .entry(Self::node_id(unit))
            .or_default()
            .insert(unit.region_label().to_string(), item_type.to_string());
    }

    fn hold(&mut self, unit: &WorkUnit, write: LeafWrite) {
        self.writes.push((Self::node_id(unit), write));
    }

    /// Item type of the lowest region that resolved one, else the placeholder
    fn item_type_for(&self, id: &NodeId, placeholder: &str) -> String {
        let types = self.resolved.get(id);
        if let Some(types) = types {
            let distinct: BTreeSet<&String> = types.values().collect();
            if distinct.len() > 1 {
                tracing::warn!(
                    "{}/{}: responses disagree on the item type ({:?}), using the first region's",
                    id.0,
                    id.1,
                    distinct
                );
            }
        }
        types
            .and_then(|types| types.values().next())
            .cloned()
            .unwrap_or_else(|| placeholder.to_string())
    }

    fn into_writes(self) -> Vec<LeafWrite> {
        let mut writes = Vec::with_capacity(self.writes.len());
        for (id, mut write) in self.writes.iter().cloned() {
            write.path.item_type = self.item_type_for(&id, &write.path.item_type);
            writes.push(write);
        }
        writes
    }
}

/// Runs plans against one [`RunContext`]
pub struct Runner {
    ctx: Arc<RunContext>,
}

impl Runner {
    pub fn new(config: RunConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            ctx: Arc::new(RunContext::new(config, connector)),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Watch progress of the current and later runs
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.ctx.progress.subscribe()
    }

    /// Select, plan and run
    pub async fn run(&self, catalogue: &Catalogue) -> Result<RunOutcome, RunError> {
        let selected = catalogue.select(&self.ctx.config.resources)?;
        let plan = plan(&selected, &self.ctx.config.regions)?;
        self.run_plan(plan).await
    }

    /// Run specific units again, e.g. [`RunOutcome::failed_units`]
    pub async fn run_units(&self, units: Vec<WorkUnit>) -> Result<RunOutcome, RunError> {
        self.run_plan(Plan::from_units(units)).await
    }

    pub async fn run_plan(&self, plan: Plan) -> Result<RunOutcome, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = plan.total();
        let concurrency = self.ctx.config.concurrency();

        tracing::info!(
            "Run {} starting: {} units, concurrency {}",
            run_id,
            total,
            concurrency
        );

        let tracker = ProgressTracker::new(total, self.ctx.progress.clone());
        let (aggregator, aggregation) = spawn_aggregator(concurrency * 2);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut abort_handles: Vec<AbortHandle> = Vec::with_capacity(total);
        let mut in_flight = FuturesUnordered::new();
        for unit in plan.into_units() {
            let handle = tokio::spawn(run_unit(self.ctx.clone(), semaphore.clone(), unit.clone()));
            abort_handles.push(handle.abort_handle());
            in_flight.push(handle.map(move |joined| joined_report(unit, joined)));
        }
        let mut deferred = DeferredLeaves::default();

        let deadline = async {
            match self.ctx.config.deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut timed_out = false;
        loop {
            tokio::select! {
                next = in_flight.next() => {
                    let Some(report) = next else {
                        break;
                    };
                    let Some(write) = self.settle(&tracker, &mut deferred, report) else {
                        continue;
                    };
                    aggregator.submit(write).await?;
                }
                _ = &mut deadline => {
                    timed_out = true;
                    tracing::warn!(
                        "Run {} hit its deadline with {} units unfinished, abandoning them",
                        run_id,
                        in_flight.len()
                    );
                    // queued units see a closed pool, running ones are aborted
                    semaphore.close();
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    break;
                }
            }
        }
        drop(in_flight);

        for write in deferred.into_writes() {
            aggregator.submit(write).await?;
        }
        drop(aggregator);

        let tree = aggregation.await.map_err(|_| RunError::AggregatorLost)?;
        let progress = tracker.snapshot();
        let finished_at = Utc::now();

        tracing::info!(
            "Run {} finished: {}/{} units, {} failed, {} leaves, {} items",
            run_id,
            progress.completed,
            progress.total,
            progress.failed,
            tree.leaf_count(),
            tree.item_count()
        );

        Ok(RunOutcome {
            run_id,
            tree,
            progress,
            failures: tracker.failures(),
            cancelled: total - progress.completed,
            timed_out,
            started_at,
            finished_at,
        })
    }

    /// Count a finished unit and decide what, if anything, goes into the tree
    /// now. Leaves of nodes without `item_key` are held in `deferred`.
    fn settle(
        &self,
        tracker: &ProgressTracker,
        deferred: &mut DeferredLeaves,
        report: UnitReport,
    ) -> Option<LeafWrite> {
        let UnitReport { unit, result } = report;
        let with_empty = self.ctx.config.with_empty;
        let item_type_known = unit.node.item_key.is_some();

        let write = match result {
            UnitResult::Cancelled => return None,
            UnitResult::Finished(Ok(output)) => {
                let snapshot = tracker.record_success();
                tracing::debug!("{} done, {} items ({:.0}%)", unit, output.items.len(), snapshot.percent());
                if !item_type_known {
                    deferred.resolve(&unit, &output.item_type);
                }
                if output.items.is_empty() && !with_empty {
                    return None;
                }
                LeafWrite {
                    path: LeafPath::new(&unit.category, &unit.resource_id, &output.item_type, unit.region_label()),
                    items: output.items,
                }
            }
            UnitResult::Finished(Err(cause)) => {
                let path = LeafPath::new(
                    &unit.category,
                    &unit.resource_id,
                    unit.planned_item_type(),
                    unit.region_label(),
                );
                tracker.record_failure(UnitFailure::new(unit.clone(), cause));
                if !with_empty {
                    return None;
                }
                LeafWrite { path, items: vec![] }
            }
        };

        if !item_type_known {
            deferred.hold(&unit, write);
            return None;
        }
        Some(write)
    }
}

/// A task that died outside the unit's own panic guard still counts as a failure
fn joined_report(unit: WorkUnit, joined: Result<UnitReport, JoinError>) -> UnitReport {
    joined.unwrap_or_else(|e| {
        tracing::error!("{}: task ended abnormally: {}", unit, e);
        UnitReport {
            unit,
            result: UnitResult::Finished(Err(FailureKind::UnexpectedError {
                message: e.to_string(),
            })),
        }
    })
}

async fn run_unit(ctx: Arc<RunContext>, semaphore: Arc<Semaphore>, unit: WorkUnit) -> UnitReport {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return UnitReport {
            unit,
            result: UnitResult::Cancelled,
        };
    };

    let result = match AssertUnwindSafe(execute(&ctx, &unit)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unit panicked".to_string());
            Err(FailureKind::UnexpectedError { message })
        }
    };

    UnitReport {
        unit,
        result: UnitResult::Finished(result),
    }
}

async fn execute(ctx: &RunContext, unit: &WorkUnit) -> Result<UnitOutput, FailureKind> {
    let client = ctx
        .clients
        .client(&unit.service, unit.region.as_deref())
        .await
        .map_err(|e| FailureKind::from(&e))?;

    fetch_unit(client.as_ref(), unit, &ctx.fetch_options())
        .await
        .map_err(|e| FailureKind::from(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::dispatch::{OperationRegistry, RegistryConnector};

    fn runner() -> Runner {
        Runner::new(
            RunConfig::default(),
            Arc::new(RegistryConnector::new(OperationRegistry::new())),
        )
    }

    fn unit(item_key: &str) -> WorkUnit {
        let yaml = format!(
            "iam:\n  category: security\n  boto_resource_name: iam\n  region_type: global\n  inventory_nodes:\n    list_users: {{item_key: '{}'}}\n",
            item_key
        );
        let catalogue = Catalogue::from_yaml_str(&yaml, "test").unwrap();
        plan(&catalogue, &[]).unwrap().into_units().remove(0)
    }

    #[tokio::test]
    async fn test_abnormal_task_end_is_counted_as_failure() {
        let runner = runner();
        let (signal, _) = watch::channel(ProgressSnapshot::default());
        let tracker = ProgressTracker::new(1, Arc::new(signal));

        let joined = tokio::spawn(async {
            if true {
                panic!("outside the guard");
            }
            UnitReport {
                unit: unit("Users"),
                result: UnitResult::Cancelled,
            }
        })
        .await;
        assert!(joined.is_err());

        let report = joined_report(unit("Users"), joined);
        let write = runner.settle(&tracker, &mut DeferredLeaves::default(), report);

        assert!(write.is_none());
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert!(matches!(
            tracker.failures()[0].cause,
            FailureKind::UnexpectedError { .. }
        ));
    }

    #[test]
    fn test_deferred_leaves_share_one_item_type() {
        let resolved = unit("");
        let mut deferred = DeferredLeaves::default();
        deferred.resolve(&resolved, "Users");
        deferred.hold(
            &resolved,
            LeafWrite {
                path: LeafPath::new("security", "iam", "list_users", "eu-west-1"),
                items: vec![],
            },
        );
        deferred.hold(
            &resolved,
            LeafWrite {
                path: LeafPath::new("security", "iam", "Users", "global"),
                items: vec![],
            },
        );

        let types: Vec<String> = deferred
            .into_writes()
            .into_iter()
            .map(|w| w.path.item_type)
            .collect();
        assert_eq!(types, vec!["Users", "Users"]);
    }
}
