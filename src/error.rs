//! Error types for cloudinv
//!
//! Three layers:
//! - [`CallError`] - what a single remote call can return
//! - [`CatalogueError`] - loading and structurally checking resource definitions
//! - [`RunError`] - the only failures that abort a whole run
//!
//! Per-unit failures are not errors at the run level; they are recorded as
//! [`crate::resource::UnitFailure`] and the run carries on.

use std::path::PathBuf;
use thiserror::Error;

/// Result of a remote call
pub type CallResult<T> = std::result::Result<T, CallError>;

/// Typed outcome of a failed remote call.
///
/// Callers match on the variant; nothing inspects error message text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// The endpoint for this service does not exist in the region, or refused the connection
    #[error("{service} is not available in {region}: {reason}")]
    Unsupported {
        service: String,
        region: String,
        reason: String,
    },

    /// The service answered with a structured error (auth, throttling, bad request)
    #[error("{code}: {message}")]
    Client {
        status: Option<u16>,
        code: String,
        message: String,
    },

    /// Network or protocol failure that is neither of the above
    #[error("transport error: {0}")]
    Transport(String),

    /// No handler is registered for this operation
    #[error("unknown operation {service}.{operation}")]
    UnknownOperation { service: String, operation: String },

    /// The response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Errors while loading the resource catalogue
#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A required field is missing or has the wrong shape
    #[error("resource '{resource}': {reason}")]
    Invalid { resource: String, reason: String },

    #[error("resource '{0}' is defined more than once")]
    Duplicate(String),
}

/// Run-level failures
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),

    #[error("no regions enabled but region-scoped resources were selected: {0}")]
    NoRegions(String),

    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    /// Two nodes of one resource would write the same leaf
    #[error("resource '{resource}' declares item type '{item_type}' on more than one node")]
    DuplicateLeaf { resource: String, item_type: String },

    /// The aggregation task went away before the run finished
    #[error("result aggregator stopped unexpectedly")]
    AggregatorLost,
}
