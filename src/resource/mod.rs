//! Resource traversal engine
//!
//! This module turns declarative resource definitions into an inventory.
//! Definitions are loaded from YAML, allowing new resource types to be added
//! without code changes.
//!
//! # Architecture
//!
//! - [`registry`] - Loads and validates resource definitions
//! - [`planner`] - Expands definitions into per-region work units
//! - [`fetcher`] - Runs one unit: listing, pagination, detail enrichment
//! - [`aggregator`] - Single owner of the result tree, fed by a channel
//! - [`progress`] - Completion counters and failure records
//! - [`runner`] - Bounded concurrent execution of a plan
//!
//! # Example
//!
//! ```ignore
//! use cloudinv::resource::{Catalogue, Runner};
//!
//! async fn inventory(config: RunConfig, connector: Arc<dyn Connector>) -> anyhow::Result<()> {
//!     let catalogue = Catalogue::builtin()?;
//!     let outcome = Runner::new(config, connector).run(&catalogue).await?;
//!     println!("{} leaves", outcome.tree.leaf_count());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod fetcher;
pub mod planner;
pub mod progress;
mod registry;
pub mod runner;

pub use aggregator::{LeafPath, LeafWrite, ResultTree};
pub use fetcher::{fetch_unit, FetchOptions, UnitOutput};
pub use planner::{plan, Plan, WorkUnit, GLOBAL_REGION};
pub use progress::{FailureKind, ProgressSnapshot, ProgressTracker, UnitFailure};
pub use registry::*;
pub use runner::{RunContext, RunOutcome, Runner};
