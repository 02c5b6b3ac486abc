//! Progress and failure tracking
//!
//! Every finished unit is counted exactly once, whether it succeeded or not.
//! Failures are kept as [`UnitFailure`] records so a caller can report them or
//! re-submit the units.

use super::planner::WorkUnit;
use crate::error::CallError;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Why a unit failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The service has no reachable endpoint in this region
    UnsupportedInRegion { reason: String },
    /// The service answered with a structured error
    RemoteClientError {
        status: Option<u16>,
        code: String,
        message: String,
    },
    /// Anything else, including a panic inside the unit
    UnexpectedError { message: String },
}

impl FailureKind {
    /// Warnings are expected in normal operation; the rest are errors
    pub fn is_warning(&self) -> bool {
        !matches!(self, FailureKind::UnexpectedError { .. })
    }

    pub fn short_label(&self) -> &'static str {
        match self {
            FailureKind::UnsupportedInRegion { .. } => "unsupported",
            FailureKind::RemoteClientError { .. } => "client-error",
            FailureKind::UnexpectedError { .. } => "error",
        }
    }
}

impl From<&CallError> for FailureKind {
    fn from(err: &CallError) -> Self {
        match err {
            CallError::Unsupported { reason, .. } => FailureKind::UnsupportedInRegion {
                reason: reason.clone(),
            },
            CallError::Client {
                status,
                code,
                message,
            } => FailureKind::RemoteClientError {
                status: *status,
                code: code.clone(),
                message: message.clone(),
            },
            other => FailureKind::UnexpectedError {
                message: other.to_string(),
            },
        }
    }
}

/// A failed unit and its cause
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub category: String,
    pub resource: String,
    pub node: String,
    pub region: String,
    pub cause: FailureKind,
    /// Kept so the unit can be re-submitted
    #[serde(skip)]
    pub unit: WorkUnit,
}

impl UnitFailure {
    pub fn new(unit: WorkUnit, cause: FailureKind) -> Self {
        Self {
            category: unit.category.clone(),
            resource: unit.resource_id.clone(),
            node: unit.node_name().to_string(),
            region: unit.region_label().to_string(),
            cause,
            unit,
        }
    }

    /// Emit the failure on the log sink at the level its kind calls for
    pub fn log(&self) {
        match &self.cause {
            FailureKind::UnsupportedInRegion { reason } => tracing::warn!(
                category = %self.category,
                resource = %self.resource,
                node = %self.node,
                region = %self.region,
                "service not available in region: {}",
                reason
            ),
            FailureKind::RemoteClientError { code, message, .. } => tracing::warn!(
                category = %self.category,
                resource = %self.resource,
                node = %self.node,
                region = %self.region,
                "remote call failed: {}: {}",
                code,
                message
            ),
            FailureKind::UnexpectedError { message } => tracing::error!(
                category = %self.category,
                resource = %self.resource,
                node = %self.node,
                region = %self.region,
                "unexpected failure: {}",
                message
            ),
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ProgressSnapshot {
    /// `completed / total * 100`, 100 for an empty run
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    pub fn is_finished(&self) -> bool {
        self.completed == self.total
    }
}

/// Counts finished units for one plan
pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    failures: Mutex<Vec<UnitFailure>>,
    signal: Arc<watch::Sender<ProgressSnapshot>>,
}

impl ProgressTracker {
    /// Start tracking `total` units and reset the signal to zero
    pub fn new(total: usize, signal: Arc<watch::Sender<ProgressSnapshot>>) -> Self {
        signal.send_replace(ProgressSnapshot {
            completed: 0,
            failed: 0,
            total,
        });
        Self {
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            signal,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn record_success(&self) -> ProgressSnapshot {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.publish()
    }

    pub fn record_failure(&self, failure: UnitFailure) -> ProgressSnapshot {
        failure.log();
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure);
        // completed before failed, so failed <= completed holds at every instant
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.publish()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let failed = self.failed.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        ProgressSnapshot {
            completed,
            failed,
            total: self.total,
        }
    }

    pub fn failures(&self) -> Vec<UnitFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish only forward moves so watchers never see progress go back
    fn publish(&self) -> ProgressSnapshot {
        let snapshot = self.snapshot();
        self.signal.send_if_modified(|current| {
            if snapshot.completed > current.completed
                || (snapshot.completed == current.completed && snapshot.failed > current.failed)
            {
                *current = snapshot;
                true
            } else {
                false
            }
        });
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{plan, Catalogue};

    fn units() -> Vec<WorkUnit> {
        let yaml = "kms:\n  category: security\n  boto_resource_name: kms\n  region_type: local\n  inventory_nodes: {list_keys: {item_key: Keys}}\n";
        let catalogue = Catalogue::from_yaml_str(yaml, "test").unwrap();
        plan(&catalogue, &["eu-west-1".to_string(), "us-east-1".to_string()])
            .unwrap()
            .into_units()
    }

    fn tracker(total: usize) -> (ProgressTracker, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        (ProgressTracker::new(total, Arc::new(tx)), rx)
    }

    #[test]
    fn test_counts_successes_and_failures() {
        let units = units();
        let (tracker, rx) = tracker(units.len());
        assert_eq!(rx.borrow().total, 2);

        tracker.record_success();
        let snapshot = tracker.record_failure(UnitFailure::new(
            units[1].clone(),
            FailureKind::UnsupportedInRegion {
                reason: "no endpoint".to_string(),
            },
        ));

        assert_eq!(snapshot, ProgressSnapshot { completed: 2, failed: 1, total: 2 });
        assert!(snapshot.is_finished());
        assert_eq!(snapshot.percent(), 100.0);
        assert_eq!(*rx.borrow(), snapshot);

        let failures = tracker.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].region, "us-east-1");
        assert_eq!(failures[0].unit, units[1]);
    }

    #[test]
    fn test_percent() {
        let snapshot = ProgressSnapshot { completed: 1, failed: 0, total: 4 };
        assert_eq!(snapshot.percent(), 25.0);
        assert_eq!(ProgressSnapshot::default().percent(), 100.0);
    }

    #[test]
    fn test_call_error_mapping() {
        let unsupported = CallError::Unsupported {
            service: "kms".to_string(),
            region: "x".to_string(),
            reason: "refused".to_string(),
        };
        assert!(matches!(FailureKind::from(&unsupported), FailureKind::UnsupportedInRegion { .. }));

        let client = CallError::Client {
            status: Some(403),
            code: "AccessDenied".to_string(),
            message: "no".to_string(),
        };
        let kind = FailureKind::from(&client);
        assert!(kind.is_warning());
        assert_eq!(kind.short_label(), "client-error");

        let kind = FailureKind::from(&CallError::Decode("bad json".to_string()));
        assert!(!kind.is_warning());
    }

    #[test]
    fn test_failure_serializes_without_unit() {
        let failure = UnitFailure::new(
            units()[0].clone(),
            FailureKind::RemoteClientError {
                status: Some(400),
                code: "Throttling".to_string(),
                message: "slow down".to_string(),
            },
        );
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["resource"], "kms");
        assert_eq!(json["region"], "eu-west-1");
        assert_eq!(json["cause"]["kind"], "remote_client_error");
        assert!(json.get("unit").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_recording_is_exact() {
        let (tracker, rx) = tracker(200);
        let tracker = Arc::new(tracker);
        let units = units();

        let mut handles = Vec::new();
        for i in 0..200 {
            let tracker = tracker.clone();
            let unit = units[i % 2].clone();
            handles.push(tokio::spawn(async move {
                if i % 5 == 0 {
                    tracker.record_failure(UnitFailure::new(
                        unit,
                        FailureKind::UnexpectedError { message: "boom".to_string() },
                    ));
                } else {
                    tracker.record_success();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 200);
        assert_eq!(snapshot.failed, 40);
        assert_eq!(*rx.borrow(), snapshot);
    }
}
