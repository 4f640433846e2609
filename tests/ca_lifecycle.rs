//! CA lifecycle tests: intermediate CSRs signed by a separate root, CSR
//! signing under roles and verbatim, CA import and revocation by key.

use pretty_assertions::assert_eq;
use rustpki::creation::SystemView;
use rustpki::metrics::NoopSink;
use rustpki::storage::InMemoryStorage;
use rustpki::{handle_request, Backend, PkiError, Request, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use x509_parser::prelude::*;

fn test_backend(name: &str) -> Arc<Backend> {
    Backend::new(
        Arc::new(InMemoryStorage::new()),
        SystemView::default(),
        Arc::new(NoopSink),
        name,
    )
}

async fn write(backend: &Arc<Backend>, path: &str, data: Value) -> Response {
    handle_request(backend, Request::update(path, data))
        .await
        .unwrap_or_else(|e| panic!("write {path} failed: {e}"))
}

async fn try_write(backend: &Arc<Backend>, path: &str, data: Value) -> Result<Response, PkiError> {
    handle_request(backend, Request::update(path, data)).await
}

async fn read(backend: &Arc<Backend>, path: &str) -> Response {
    handle_request(backend, Request::read(path))
        .await
        .unwrap_or_else(|e| panic!("read {path} failed: {e}"))
}

fn text(resp: &Response, key: &str) -> String {
    resp.get(key).as_str().unwrap_or_default().to_string()
}

fn pem_der(pem_str: &str) -> Vec<u8> {
    ::pem::parse(pem_str).unwrap().contents().to_vec()
}

fn csr_for(names: &[&str]) -> (String, rcgen::KeyPair) {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params =
        rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, names[0]);
    let csr = params.serialize_request(&key).unwrap();
    (csr.pem().unwrap(), key)
}

async fn root(backend: &Arc<Backend>) -> Response {
    write(
        backend,
        "root/generate/internal",
        json!({"common_name": "Root CA", "ttl": "720h", "key_type": "ec"}),
    )
    .await
}

#[tokio::test]
async fn test_intermediate_chain() {
    let root_b = test_backend("root");
    let int_b = test_backend("int");
    let root_resp = root(&root_b).await;
    let root_pem = text(&root_resp, "certificate");

    let csr_resp = write(
        &int_b,
        "intermediate/generate/internal",
        json!({"common_name": "Intermediate CA", "key_type": "ec"}),
    )
    .await;
    assert!(csr_resp.get("private_key").is_null());
    let csr = text(&csr_resp, "csr");
    assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

    // No CA yet on the intermediate mount.
    let err = try_write(&int_b, "issue/any", json!({"common_name": "x"}))
        .await
        .unwrap_err();
    assert!(err.is_user_error());

    let signed = write(
        &root_b,
        "root/sign-intermediate",
        json!({"csr": csr, "ttl": "240h", "max_path_length": 0}),
    )
    .await;
    let int_pem = text(&signed, "certificate");
    assert_eq!(text(&signed, "issuing_ca"), root_pem);
    let int_der = pem_der(&int_pem);
    let (_, int_cert) = parse_x509_certificate(&int_der).unwrap();
    assert!(int_cert.is_ca());
    assert_eq!(
        int_cert.subject().iter_common_name().next().unwrap().as_str().unwrap(),
        "Intermediate CA"
    );

    let set = write(
        &int_b,
        "intermediate/set-signed",
        json!({"certificate": format!("{int_pem}\n{root_pem}")}),
    )
    .await;
    assert!(set.warnings.is_empty());

    let chain = read(&int_b, "config/chain").await;
    assert_eq!(chain.get("ca_chain"), &json!([int_pem.clone(), root_pem.clone()]));

    write(
        &int_b,
        "roles/leaf",
        json!({"allowed_domains": "example.com", "allow_subdomains": true, "key_type": "ec"}),
    )
    .await;
    let leaf = write(&int_b, "issue/leaf", json!({"common_name": "www.example.com", "ttl": "1h"})).await;
    assert_eq!(text(&leaf, "issuing_ca"), int_pem);
    assert_eq!(leaf.get("ca_chain"), &json!([int_pem, root_pem]));

    // A path length of zero stops further CAs below the intermediate.
    let (grandchild_csr, _) = csr_for(&["Sub CA"]);
    let err = try_write(&int_b, "root/sign-intermediate", json!({"csr": grandchild_csr}))
        .await
        .unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_set_signed_requires_pending_key() {
    let root_b = test_backend("root");
    let other = test_backend("other");
    let root_resp = root(&root_b).await;

    let err = try_write(
        &other,
        "intermediate/set-signed",
        json!({"certificate": text(&root_resp, "certificate")}),
    )
    .await
    .unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_sign_csr_under_role() {
    let b = test_backend("sign");
    root(&b).await;
    write(
        &b,
        "roles/web",
        json!({"allowed_domains": "example.com", "allow_subdomains": true, "key_type": "any"}),
    )
    .await;

    let (csr, _) = csr_for(&["api.example.com"]);
    let signed = write(&b, "sign/web", json!({"csr": csr, "ttl": "2h"})).await;
    assert!(signed.get("private_key").is_null());
    let cert_der = pem_der(&text(&signed, "certificate"));
    let (_, cert) = parse_x509_certificate(&cert_der).unwrap();
    assert!(!cert.is_ca());

    let (bad_csr, _) = csr_for(&["api.evil.com"]);
    let err = try_write(&b, "sign/web", json!({"csr": bad_csr}))
        .await
        .unwrap_err();
    assert!(err.is_user_error());

    // issue refuses key_type any.
    let err = try_write(&b, "issue/web", json!({"common_name": "api.example.com"}))
        .await
        .unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_sign_verbatim_keeps_csr_names() {
    let b = test_backend("verbatim");
    root(&b).await;

    let (csr, _) = csr_for(&["anything.internal", "second.internal"]);
    let signed = write(&b, "sign-verbatim", json!({"csr": csr, "ttl": "1h"})).await;
    let cert_der = pem_der(&text(&signed, "certificate"));
    let (_, cert) = parse_x509_certificate(&cert_der).unwrap();
    let sans: Vec<String> = cert
        .subject_alternative_name()
        .unwrap()
        .unwrap()
        .value
        .general_names
        .iter()
        .filter_map(|n| match n {
            GeneralName::DNSName(d) => Some(d.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(sans, vec!["anything.internal", "second.internal"]);
}

#[tokio::test]
async fn test_import_ca_and_revoke_with_key() {
    let origin = test_backend("origin");
    let exported = write(
        &origin,
        "root/generate/exported",
        json!({"common_name": "Imported CA", "ttl": "720h", "key_type": "ec", "format": "pem_bundle"}),
    )
    .await;
    let bundle = text(&exported, "certificate");
    assert!(bundle.contains("PRIVATE KEY"));

    let b = test_backend("import");
    write(&b, "config/ca", json!({"pem_bundle": bundle})).await;
    let ca = read(&b, "cert/ca").await;
    assert!(text(&ca, "certificate").starts_with("-----BEGIN CERTIFICATE-----"));

    write(&b, "roles/t", json!({"allow_any_name": true, "key_type": "ec"})).await;
    let issued = write(&b, "issue/t", json!({"common_name": "svc.example.com", "ttl": "1h"})).await;
    let other = write(&b, "issue/t", json!({"common_name": "other.example.com", "ttl": "1h"})).await;

    let err = try_write(
        &b,
        "revoke-with-key",
        json!({"serial_number": text(&issued, "serial_number"), "private_key": text(&other, "private_key")}),
    )
    .await
    .unwrap_err();
    assert!(err.is_user_error());

    write(
        &b,
        "revoke-with-key",
        json!({"certificate": text(&issued, "certificate"), "private_key": text(&issued, "private_key")}),
    )
    .await;
    let listed = handle_request(&b, Request::list("certs/revoked")).await.unwrap();
    assert_eq!(listed.get("keys"), &json!([text(&issued, "serial_number")]));

    // The CA itself cannot be put on its CRL.
    let ca_serial = text(&exported, "serial_number");
    let err = try_write(&b, "revoke", json!({"serial_number": ca_serial}))
        .await
        .unwrap_err();
    assert!(err.is_user_error());

    handle_request(&b, Request::delete("root")).await.unwrap();
    let ca = read(&b, "ca").await;
    assert!(ca.raw.unwrap().body.is_empty());
}
