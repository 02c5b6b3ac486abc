//! Integration tests for the HTTP gateway using wiremock
//!
//! These tests verify the gateway adapter against mocked endpoints, ensuring
//! proper mapping of response codes and error bodies onto typed call errors.

use cloudinv::config::RunConfig;
use cloudinv::error::CallError;
use cloudinv::remote::dispatch::{Binding, OperationRegistry, Paginator, RegistryConnector};
use cloudinv::remote::http::{register_gateway_operations, HttpGateway};
use cloudinv::remote::{Connector, RemoteClient};
use cloudinv::resource::{Catalogue, LeafPath, Runner};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{bearer_token, body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn template(server: &MockServer) -> String {
    format!("{}/{{service}}/{{region}}/", server.uri())
}

fn binding(service: &str, region: Option<&str>) -> Binding {
    Binding {
        service: service.to_string(),
        region: region.map(str::to_string),
    }
}

/// Test module for gateway call behavior
mod gateway_tests {
    use super::*;

    /// Test successful call returns parsed JSON
    #[tokio::test]
    async fn test_invoke_success_returns_json() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/kms/eu-west-1/list_keys"))
            .and(bearer_token("test-token"))
            .and(body_json(json!({"Limit": 10})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Keys": [{"KeyId": "k1"}, {"KeyId": "k2"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), Some("test-token".to_string()), None).unwrap();
        let response = gateway
            .invoke(&binding("kms", Some("eu-west-1")), "list_keys", &json!({"Limit": 10}))
            .await
            .expect("call should succeed");

        assert_eq!(response["Keys"].as_array().unwrap().len(), 2);
        assert_eq!(response["Keys"][0]["KeyId"], "k1");
    }

    /// Test account-wide services use the global endpoint
    #[tokio::test]
    async fn test_global_binding_uses_global_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/iam/global/list_users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Users": []})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), None, None).unwrap();
        let response = gateway
            .invoke(&binding("iam", None), "list_users", &json!({}))
            .await
            .unwrap();

        assert_eq!(response, json!({"Users": []}));
    }

    /// Test 4xx with a typed error body maps to a client error
    #[tokio::test]
    async fn test_400_maps_to_client_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/kms/eu-west-1/list_keys"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "com.amazonaws.kms#AccessDeniedException",
                "message": "User is not authorized to perform kms:ListKeys"
            })))
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), None, None).unwrap();
        let err = gateway
            .invoke(&binding("kms", Some("eu-west-1")), "list_keys", &json!({}))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CallError::Client {
                status: Some(400),
                code: "AccessDeniedException".to_string(),
                message: "User is not authorized to perform kms:ListKeys".to_string(),
            }
        );
    }

    /// Test 5xx without a parseable body still yields a status-derived code
    #[tokio::test]
    async fn test_500_without_body_has_http_code() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), None, None).unwrap();
        let err = gateway
            .invoke(&binding("s3", None), "list_buckets", &json!({}))
            .await
            .unwrap_err();

        match err {
            CallError::Client { status, code, .. } => {
                assert_eq!(status, Some(503));
                assert_eq!(code, "Http503");
            }
            other => panic!("expected client error, got {:?}", other),
        }
    }

    /// Test a non-JSON success body is a decode error
    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), None, None).unwrap();
        let err = gateway
            .invoke(&binding("kms", Some("eu-west-1")), "list_keys", &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Decode(_)));
    }

    /// Test an empty success body is read as null
    #[tokio::test]
    async fn test_empty_body_is_null() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(&template(&server), None, None).unwrap();
        let response = gateway
            .invoke(&binding("kms", Some("eu-west-1")), "list_keys", &json!({}))
            .await
            .unwrap();

        assert!(response.is_null());
    }

    /// Test a refused connection means the service is unsupported there
    #[tokio::test]
    async fn test_connection_refused_is_unsupported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let gateway = HttpGateway::new(
            &format!("http://127.0.0.1:{}/{{service}}/{{region}}/", port),
            None,
            None,
        )
        .unwrap();
        let err = gateway
            .invoke(&binding("kms", Some("ap-east-1")), "list_keys", &json!({}))
            .await
            .unwrap_err();

        match err {
            CallError::Unsupported { service, region, .. } => {
                assert_eq!(service, "kms");
                assert_eq!(region, "ap-east-1");
            }
            other => panic!("expected unsupported, got {:?}", other),
        }
    }
}

/// Test module for gateway-backed registries
mod registry_tests {
    use super::*;

    const KMS: &str = r#"
kms:
  category: security
  boto_resource_name: kms
  region_type: local
  inventory_nodes:
    list_keys:
      item_key: Keys
      paginate: true
      detail_operation: describe_key
      item_search_id: KeyId
      detail_param: KeyId
      result_key: KeyMetadata
"#;

    async fn mount_kms(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/kms/eu-west-1/list_keys"))
            .and(body_partial_json(json!({"NextToken": "p2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Keys": [{"KeyId": "k3"}]
            })))
            .with_priority(1)
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/kms/eu-west-1/list_keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Keys": [{"KeyId": "k1"}, {"KeyId": "k2"}],
                "NextToken": "p2"
            })))
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/kms/eu-west-1/describe_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "KeyMetadata": {"KeyState": "Enabled"},
                "ResponseMetadata": {"RequestId": "abc"}
            })))
            .expect(3)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_registered_operations_paginate_over_http() {
        let server = MockServer::start().await;
        mount_kms(&server).await;

        let catalogue = Catalogue::from_yaml_str(KMS, "test").unwrap();
        let gateway = Arc::new(HttpGateway::new(&template(&server), None, None).unwrap());
        let mut registry = OperationRegistry::new();
        register_gateway_operations(&mut registry, gateway, &catalogue, &Paginator::default());

        assert!(registry.contains("kms", "list_keys"));
        assert!(registry.contains("kms", "describe_key"));

        let client = RegistryConnector::new(registry)
            .connect("kms", Some("eu-west-1"))
            .await
            .unwrap();
        let pages = client.paginate("list_keys", &json!({})).await.unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0]["Keys"][0]["KeyId"], "k1");
        assert_eq!(pages[1]["Keys"][0]["KeyId"], "k3");

        // describe_key is expected three times, once per key
        for key in ["k1", "k2", "k3"] {
            client.call("describe_key", &json!({"KeyId": key})).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_run_over_http() {
        let server = MockServer::start().await;
        mount_kms(&server).await;

        let catalogue = Catalogue::from_yaml_str(KMS, "test").unwrap();
        let gateway = Arc::new(HttpGateway::new(&template(&server), None, None).unwrap());
        let mut registry = OperationRegistry::new();
        register_gateway_operations(&mut registry, gateway, &catalogue, &Paginator::default());

        let config = RunConfig::default().with_regions(&["eu-west-1"]);
        let outcome = Runner::new(config, Arc::new(RegistryConnector::new(registry)))
            .run(&catalogue)
            .await
            .unwrap();

        assert_eq!(outcome.progress.failed, 0);
        let leaf = outcome
            .tree
            .leaf(&LeafPath::new("security", "kms", "Keys", "eu-west-1"))
            .unwrap();
        assert_eq!(leaf.len(), 3);
        assert_eq!(leaf[2]["KeyId"], "k3");
        assert_eq!(leaf[2]["KeyMetadata"]["KeyState"], "Enabled");
    }
}
