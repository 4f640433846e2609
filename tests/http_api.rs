//! HTTP surface tests through `warp::test::request()`.

use pretty_assertions::assert_eq;
use rustpki::api::{ApiResponse, ErrorResponse, PkiApi};
use rustpki::creation::SystemView;
use rustpki::metrics::PrometheusSink;
use rustpki::storage::{LocalStorage, Storage};
use rustpki::Backend;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use warp::test;

fn api_with(storage: Arc<dyn Storage>) -> (PkiApi, Arc<Backend>) {
    let metrics = PrometheusSink::new();
    let backend = Backend::new(storage, SystemView::default(), metrics.clone(), "http-mount");
    (PkiApi::new(backend.clone(), metrics, "pki"), backend)
}

#[tokio::test]
async fn test_issue_over_http_with_file_storage() {
    let dir = TempDir::new().unwrap();
    let (api, _) = api_with(Arc::new(LocalStorage::new(dir.path()).unwrap()));
    let filter = api.routes();

    let response = test::request()
        .method("POST")
        .path("/v1/pki/root/generate/internal")
        .json(&json!({"common_name": "HTTP Root", "ttl": "48h", "key_type": "ec"}))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);
    let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
    let root_pem = body.data.unwrap()["certificate"].as_str().unwrap().to_string();

    let response = test::request()
        .method("GET")
        .path("/v1/pki/ca")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/pkix-cert");
    assert_eq!(
        response.body().to_vec(),
        pem::parse(&root_pem).unwrap().contents().to_vec()
    );

    let response = test::request()
        .method("GET")
        .path("/v1/pki/ca/pem")
        .reply(&filter)
        .await;
    assert_eq!(String::from_utf8(response.body().to_vec()).unwrap(), root_pem);

    let response = test::request()
        .method("GET")
        .path("/v1/pki/crl/pem")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);
    assert!(String::from_utf8(response.body().to_vec())
        .unwrap()
        .starts_with("-----BEGIN X509 CRL-----"));

    let response = test::request()
        .method("PUT")
        .path("/v1/pki/roles/svc")
        .json(&json!({"allow_any_name": true, "key_type": "ec", "generate_lease": true}))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);

    let response = test::request()
        .method("POST")
        .path("/v1/pki/issue/svc")
        .json(&json!({"common_name": "svc.example.com", "ttl": "1h", "format": "der"}))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);
    let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
    assert!(body.lease_duration > 3500 && body.lease_duration <= 3600);
    let data = body.data.unwrap();
    assert!(!data["certificate"].as_str().unwrap().starts_with("-----"));

    let response = test::request()
        .method("GET")
        .path("/v1/pki/certs?list=true")
        .reply(&filter)
        .await;
    let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
    let keys = body.data.unwrap()["keys"].as_array().unwrap().len();
    assert_eq!(keys, 2);
}

#[tokio::test]
async fn test_tidy_endpoints_over_http() {
    let (api, _) = api_with(Arc::new(rustpki::storage::InMemoryStorage::new()));
    let filter = api.routes();

    let response = test::request()
        .method("POST")
        .path("/v1/pki/tidy-cancel")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);
    let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(
        body.warnings.unwrap(),
        vec!["Tidy operation cannot be cancelled as none is currently running.".to_string()]
    );

    let response = test::request()
        .method("POST")
        .path("/v1/pki/tidy")
        .json(&json!({}))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = serde_json::from_slice(response.body()).unwrap();
    assert!(body.errors[0].contains("at least one"));

    let response = test::request()
        .method("GET")
        .path("/v1/pki/tidy-status")
        .reply(&filter)
        .await;
    let body: ApiResponse = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body.data.unwrap()["state"], "Inactive");
}

#[tokio::test]
async fn test_counter_metrics_exposed() {
    let (api, backend) = api_with(Arc::new(rustpki::storage::InMemoryStorage::new()));
    let filter = api.routes();

    let response = test::request()
        .method("POST")
        .path("/v1/pki/config/auto-tidy")
        .json(&json!({
            "maintain_stored_certificate_counts": true,
            "publish_stored_certificate_count_metrics": true
        }))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 200);

    for _ in 0..100 {
        if backend.counter().is_initialized() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(backend.counter().is_initialized());
    backend.counter().emit();

    let response = test::request()
        .method("GET")
        .path("/metrics")
        .reply(&filter)
        .await;
    let text = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(text.contains("total_certificates_stored"), "{text}");
}
