//! HTTP gateway adapter
//!
//! Carries catalogue operations as JSON POST requests to an endpoint built
//! from a template, e.g. `https://{service}.{region}.gateway.internal/`. The
//! operation name is appended as the last path segment and the parameters are
//! the request body. Account-wide services use [`GLOBAL_ENDPOINT_REGION`] for
//! `{region}`.

use super::dispatch::{Binding, OperationRegistry, Paginator};
use crate::error::{CallError, CallResult};
use crate::resource::Catalogue;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// `{region}` substitution for account-wide services
pub const GLOBAL_ENDPOINT_REGION: &str = "global";

/// Truncate and strip control characters before a body goes to the log
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// HTTP client wrapper for gateway calls
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    endpoint_template: String,
    token: Option<String>,
}

impl HttpGateway {
    /// Create a gateway client.
    ///
    /// `endpoint_template` may contain `{service}` and `{region}`.
    pub fn new(endpoint_template: &str, token: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        // fail early on a template that can never produce a URL
        Url::parse(&fill_template(endpoint_template, "service", "region"))
            .with_context(|| format!("Invalid endpoint template: {}", endpoint_template))?;

        let mut builder = Client::builder().user_agent(format!("cloudinv/{}", crate::VERSION));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint_template: endpoint_template.to_string(),
            token,
        })
    }

    /// URL for one operation on one binding
    pub fn operation_url(&self, binding: &Binding, operation: &str) -> CallResult<Url> {
        let region = binding.region.as_deref().unwrap_or(GLOBAL_ENDPOINT_REGION);
        let base = fill_template(&self.endpoint_template, &binding.service, region);
        let mut url = Url::parse(&base).map_err(|e| CallError::Unsupported {
            service: binding.service.clone(),
            region: region.to_string(),
            reason: format!("invalid endpoint {}: {}", base, e),
        })?;

        url.path_segments_mut()
            .map_err(|_| CallError::Transport(format!("endpoint {} cannot take a path", base)))?
            .pop_if_empty()
            .push(operation);

        Ok(url)
    }

    /// POST `params` to the operation and decode the JSON answer
    pub async fn invoke(&self, binding: &Binding, operation: &str, params: &Value) -> CallResult<Value> {
        let url = self.operation_url(binding, operation)?;
        tracing::debug!("POST {}", url);

        let mut request = self.client.post(url).json(params);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                CallError::Unsupported {
                    service: binding.service.clone(),
                    region: binding
                        .region
                        .clone()
                        .unwrap_or_else(|| GLOBAL_ENDPOINT_REGION.to_string()),
                    reason: e.to_string(),
                }
            } else {
                CallError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CallError::Transport(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            tracing::debug!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(client_error(status.as_u16(), &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| CallError::Decode(e.to_string()))
    }
}

fn fill_template(template: &str, service: &str, region: &str) -> String {
    template
        .replace("{service}", &urlencoding::encode(service))
        .replace("{region}", &urlencoding::encode(region))
}

/// Turn an error response into [`CallError::Client`].
///
/// Understands `{"__type": ..., "message": ...}`, `{"code": ..., "message": ...}`
/// and `{"Error": {"Code": ..., "Message": ...}}` bodies.
fn client_error(status: u16, body: &str) -> CallError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = parsed.get("Error").unwrap_or(&parsed);

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| error.get(*name).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
    };

    let code = field(&["Code", "code", "__type"])
        .map(|code| code.rsplit('#').next().unwrap_or(&code).to_string())
        .unwrap_or_else(|| format!("Http{}", status));
    let message = field(&["Message", "message"]).unwrap_or_else(|| sanitize_for_log(body));

    CallError::Client {
        status: Some(status),
        code,
        message,
    }
}

/// Register every catalogue operation against the gateway.
///
/// Paginated operations share `paginator`.
pub fn register_gateway_operations(
    registry: &mut OperationRegistry,
    gateway: Arc<HttpGateway>,
    catalogue: &Catalogue,
    paginator: &Paginator,
) {
    for (service, operation, paginated) in catalogue.operations() {
        let gateway = gateway.clone();
        let op_name = operation.clone();
        let handler = move |binding: Binding, params: Value| {
            let gateway = gateway.clone();
            let op_name = op_name.clone();
            async move { gateway.invoke(&binding, &op_name, &params).await }
        };

        if paginated {
            registry.register_paginated(&service, &operation, paginator.clone(), handler);
        } else if !registry.contains(&service, &operation) {
            registry.register(&service, &operation, handler);
        }
    }

    tracing::info!("Registered {} gateway operations", registry.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(region: Option<&str>) -> Binding {
        Binding {
            service: "kms".to_string(),
            region: region.map(str::to_string),
        }
    }

    #[test]
    fn test_operation_url_fills_template() {
        let gateway = HttpGateway::new("https://{service}.{region}.example.com/api/", None, None).unwrap();
        let url = gateway.operation_url(&binding(Some("eu-west-1")), "list_keys").unwrap();
        assert_eq!(url.as_str(), "https://kms.eu-west-1.example.com/api/list_keys");

        let url = gateway.operation_url(&binding(None), "list_keys").unwrap();
        assert_eq!(url.as_str(), "https://kms.global.example.com/api/list_keys");
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        assert!(HttpGateway::new("not a url {service}", None, None).is_err());
    }

    #[test]
    fn test_client_error_shapes() {
        let err = client_error(400, r#"{"__type": "com.amazon#ThrottlingException", "message": "slow down"}"#);
        assert_eq!(
            err,
            CallError::Client {
                status: Some(400),
                code: "ThrottlingException".to_string(),
                message: "slow down".to_string(),
            }
        );

        let err = client_error(403, r#"{"Error": {"Code": "AccessDenied", "Message": "no"}}"#);
        assert!(matches!(err, CallError::Client { ref code, .. } if code == "AccessDenied"));

        let err = client_error(500, "upstream exploded");
        assert!(matches!(err, CallError::Client { ref code, ref message, .. }
            if code == "Http500" && message == "upstream exploded"));
    }

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(500);
        let sanitized = sanitize_for_log(&body);
        assert!(sanitized.starts_with(&"x".repeat(MAX_LOG_BODY_LENGTH)));
        assert!(sanitized.contains("500 bytes total"));
    }

    #[test]
    fn test_register_gateway_operations_covers_catalogue() {
        let catalogue = Catalogue::builtin().unwrap();
        let gateway = Arc::new(HttpGateway::new("http://127.0.0.1:9/{service}/{region}/", None, None).unwrap());
        let mut registry = OperationRegistry::new();
        register_gateway_operations(&mut registry, gateway, &catalogue, &Paginator::default());

        assert!(registry.contains("kms", "list_keys"));
        assert!(registry.contains("kms", "describe_key"));
        assert!(registry.contains("iam", "list_attached_user_policies"));
    }
}
