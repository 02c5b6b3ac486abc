//! Remote API capability layer
//!
//! The traversal engine only ever sees a [`RemoteClient`] bound to one
//! `(service, region)` pair. How that client reaches the cloud provider is the
//! business of a [`Connector`].
//!
//! # Module Structure
//!
//! - [`dispatch`] - Registry of `(service, operation)` handlers and the client built on it
//! - [`http`] - JSON-over-HTTP gateway adapter that fills the registry
//!
//! # Example
//!
//! ```ignore
//! use cloudinv::remote::{ClientPool, dispatch::{OperationRegistry, RegistryConnector}};
//!
//! async fn example(registry: OperationRegistry) -> anyhow::Result<()> {
//!     let pool = ClientPool::new(Arc::new(RegistryConnector::new(registry)));
//!     let kms = pool.client("kms", Some("eu-west-1")).await?;
//!     let keys = kms.call("list_keys", &serde_json::json!({})).await?;
//!     Ok(())
//! }
//! ```

pub mod dispatch;
pub mod http;

use crate::error::CallResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// A capability bound to one service in one region (or globally)
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Service identifier this client is bound to
    fn service(&self) -> &str;

    /// Region this client is bound to, `None` for account-wide services
    fn region(&self) -> Option<&str>;

    /// Call a named operation once
    async fn call(&self, operation: &str, params: &Value) -> CallResult<Value>;

    /// Call a named operation until the service reports no further pages.
    ///
    /// Pages are returned in the order they were fetched.
    async fn paginate(&self, operation: &str, params: &Value) -> CallResult<Vec<Value>>;
}

/// Produces clients for `(service, region)` pairs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        service: &str,
        region: Option<&str>,
    ) -> CallResult<Arc<dyn RemoteClient>>;
}

type ClientKey = (String, Option<String>);
type ClientSlot = Arc<OnceCell<Arc<dyn RemoteClient>>>;

/// Cache of connected clients, one per `(service, region)`.
///
/// Concurrent lookups for the same key wait on the same slot, so the connector
/// runs at most once per key. A failed connection leaves the slot empty and the
/// next lookup tries again.
pub struct ClientPool {
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<ClientKey, ClientSlot>>,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get the client for `(service, region)`, connecting on first use
    pub async fn client(
        &self,
        service: &str,
        region: Option<&str>,
    ) -> CallResult<Arc<dyn RemoteClient>> {
        let slot = {
            let mut clients = self.clients.lock().await;
            clients
                .entry((service.to_string(), region.map(str::to_string)))
                .or_default()
                .clone()
        };

        let client = slot
            .get_or_try_init(|| async {
                tracing::debug!("connecting client: service={}, region={:?}", service, region);
                self.connector.connect(service, region).await
            })
            .await?;

        Ok(client.clone())
    }

    /// Number of clients that connected successfully
    pub async fn connected(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}
