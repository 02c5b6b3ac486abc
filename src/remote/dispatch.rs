//! Operation Dispatch
//!
//! Maps `(service, operation)` names read from the catalogue to concrete
//! handlers. Adapter code fills an [`OperationRegistry`] once at startup; the
//! engine then calls operations through a [`RegistryClient`] and never needs
//! to know how a given call is carried out.

use super::{Connector, RemoteClient};
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Upper bound on pages fetched for one paginated call
pub const MAX_PAGES: usize = 1000;

/// Where a call is aimed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub service: String,
    pub region: Option<String>,
}

/// Async handler for one operation
pub type Handler = Arc<dyn Fn(Binding, Value) -> BoxFuture<'static, CallResult<Value>> + Send + Sync>;

/// How an operation hands out continuation tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginator {
    /// Request parameter carrying the token
    pub input_token: String,
    /// Response field holding the next token
    pub output_token: String,
}

impl Paginator {
    pub fn new(input_token: &str, output_token: &str) -> Self {
        Self {
            input_token: input_token.to_string(),
            output_token: output_token.to_string(),
        }
    }
}

impl Default for Paginator {
    fn default() -> Self {
        Self::new("NextToken", "NextToken")
    }
}

#[derive(Clone)]
struct Operation {
    handler: Handler,
    paginator: Option<Paginator>,
}

/// `(service, operation)` → handler table
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<(String, String), Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-shot operation
    pub fn register<F, Fut>(&mut self, service: &str, operation: &str, handler: F) -> &mut Self
    where
        F: Fn(Binding, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult<Value>> + Send + 'static,
    {
        self.insert(service, operation, None, handler)
    }

    /// Register an operation that supports token pagination
    pub fn register_paginated<F, Fut>(
        &mut self,
        service: &str,
        operation: &str,
        paginator: Paginator,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Binding, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult<Value>> + Send + 'static,
    {
        self.insert(service, operation, Some(paginator), handler)
    }

    fn insert<F, Fut>(
        &mut self,
        service: &str,
        operation: &str,
        paginator: Option<Paginator>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Binding, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult<Value>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |binding: Binding, params: Value| handler(binding, params).boxed());
        self.operations.insert(
            (service.to_string(), operation.to_string()),
            Operation { handler, paginator },
        );
        self
    }

    pub fn contains(&self, service: &str, operation: &str) -> bool {
        self.operations
            .contains_key(&(service.to_string(), operation.to_string()))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn get(&self, service: &str, operation: &str) -> Option<&Operation> {
        self.operations
            .get(&(service.to_string(), operation.to_string()))
    }
}

/// [`RemoteClient`] backed by an [`OperationRegistry`]
pub struct RegistryClient {
    registry: Arc<OperationRegistry>,
    binding: Binding,
}

impl RegistryClient {
    pub fn new(registry: Arc<OperationRegistry>, binding: Binding) -> Self {
        Self { registry, binding }
    }

    fn operation(&self, operation: &str) -> CallResult<&Operation> {
        self.registry
            .get(&self.binding.service, operation)
            .ok_or_else(|| CallError::UnknownOperation {
                service: self.binding.service.clone(),
                operation: operation.to_string(),
            })
    }
}

#[async_trait]
impl RemoteClient for RegistryClient {
    fn service(&self) -> &str {
        &self.binding.service
    }

    fn region(&self) -> Option<&str> {
        self.binding.region.as_deref()
    }

    async fn call(&self, operation: &str, params: &Value) -> CallResult<Value> {
        tracing::debug!(
            "call: service={}, region={:?}, operation={}",
            self.binding.service,
            self.binding.region,
            operation
        );

        let op = self.operation(operation)?;
        (op.handler)(self.binding.clone(), params.clone()).await
    }

    async fn paginate(&self, operation: &str, params: &Value) -> CallResult<Vec<Value>> {
        let op = self.operation(operation)?;
        let Some(paginator) = op.paginator.clone() else {
            tracing::debug!(
                "{}.{} has no paginator, fetching a single page",
                self.binding.service,
                operation
            );
            return Ok(vec![self.call(operation, params).await?]);
        };

        let mut pages = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut page_params = match params {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            if let Some(ref token) = token {
                page_params.insert(paginator.input_token.clone(), Value::String(token.clone()));
            }

            let page = self.call(operation, &Value::Object(page_params)).await?;
            let next = next_token(&page, &paginator.output_token);
            pages.push(page);

            match next {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    tracing::warn!(
                        "{}.{} returned the same page token twice, stopping",
                        self.binding.service,
                        operation
                    );
                    break;
                }
                Some(_) if pages.len() >= MAX_PAGES => {
                    tracing::warn!(
                        "{}.{} exceeded {} pages, stopping",
                        self.binding.service,
                        operation,
                        MAX_PAGES
                    );
                    break;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(pages)
    }
}

fn next_token(page: &Value, output_token: &str) -> Option<String> {
    page.get(output_token)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// [`Connector`] handing out [`RegistryClient`]s
pub struct RegistryConnector {
    registry: Arc<OperationRegistry>,
}

impl RegistryConnector {
    pub fn new(registry: OperationRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

#[async_trait]
impl Connector for RegistryConnector {
    async fn connect(
        &self,
        service: &str,
        region: Option<&str>,
    ) -> CallResult<Arc<dyn RemoteClient>> {
        Ok(Arc::new(RegistryClient::new(
            self.registry.clone(),
            Binding {
                service: service.to_string(),
                region: region.map(str::to_string),
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paged_registry() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.register_paginated(
            "lambda",
            "list_functions",
            Paginator::new("Marker", "NextMarker"),
            |_binding, params| async move {
                let page = match params.get("Marker").and_then(|v| v.as_str()) {
                    None => json!({"Functions": ["a", "b"], "NextMarker": "p2"}),
                    Some("p2") => json!({"Functions": ["c"], "NextMarker": ""}),
                    Some(other) => {
                        return Err(CallError::Client {
                            status: Some(400),
                            code: "InvalidMarker".to_string(),
                            message: other.to_string(),
                        })
                    }
                };
                Ok(page)
            },
        );
        registry.register("lambda", "get_function", |binding, params| async move {
            Ok(json!({"region": binding.region, "name": params["FunctionName"]}))
        });
        registry
    }

    fn client(region: Option<&str>) -> RegistryClient {
        RegistryClient::new(
            Arc::new(paged_registry()),
            Binding {
                service: "lambda".to_string(),
                region: region.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn test_call_passes_binding_and_params() {
        let client = client(Some("eu-west-1"));
        let response = client
            .call("get_function", &json!({"FunctionName": "f1"}))
            .await
            .unwrap();
        assert_eq!(response, json!({"region": "eu-west-1", "name": "f1"}));
    }

    #[tokio::test]
    async fn test_paginate_follows_tokens_in_order() {
        let pages = client(None)
            .paginate("list_functions", &json!({}))
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0]["Functions"], json!(["a", "b"]));
        assert_eq!(pages[1]["Functions"], json!(["c"]));
    }

    #[tokio::test]
    async fn test_paginate_without_paginator_returns_single_page() {
        let pages = client(Some("us-east-1"))
            .paginate("get_function", &json!({"FunctionName": "f1"}))
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_typed() {
        let err = client(None).call("delete_function", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            CallError::UnknownOperation {
                service: "lambda".to_string(),
                operation: "delete_function".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_token_stops_pagination() {
        let mut registry = OperationRegistry::new();
        registry.register_paginated("s3", "list_buckets", Paginator::default(), |_, _| async {
            Ok(json!({"Buckets": [], "NextToken": "same"}))
        });
        let client = RegistryClient::new(
            Arc::new(registry),
            Binding {
                service: "s3".to_string(),
                region: None,
            },
        );
        let pages = client.paginate("list_buckets", &json!({})).await.unwrap();
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = paged_registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("lambda", "list_functions"));
        assert!(!registry.contains("kms", "list_functions"));
    }
}
