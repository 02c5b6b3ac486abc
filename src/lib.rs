//! cloudinv - schema-driven cloud account inventory
//!
//! Reads declarative resource definitions, fans list/describe calls out over
//! regions, enriches listed items with detail calls and aggregates everything
//! into `category → resource → item type → region → items`.

pub mod config;
pub mod error;
pub mod output;
pub mod remote;
pub mod resource;

/// Version injected at compile time via CLOUDINV_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CLOUDINV_VERSION") {
    Some(v) => v,
    None => "dev",
};

pub use config::{RunConfig, Settings};
pub use error::{CallError, CallResult, CatalogueError, RunError};
pub use resource::{Catalogue, ResultTree, RunOutcome, Runner};
