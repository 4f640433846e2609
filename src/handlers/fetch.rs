//! Read-only fetch endpoints for the CA, its chain, the CRL and stored
//! certificates.

use super::format::pem_trimmed;
use super::Response;
use crate::backend::Backend;
use crate::certutil::{parse_serial, CertBundle, ParsedCertBundle};
use crate::error::{PkiError, Result};
use crate::storage::pki::{CA_KEY, CRL_KEY};
use serde_json::json;
use std::sync::Arc;

pub const PKIX_CERT: &str = "application/pkix-cert";
pub const PKIX_CRL: &str = "application/pkix-crl";
pub const PEM_CHAIN: &str = "application/pem-certificate-chain";
pub const PEM_FILE: &str = "application/x-pem-file";

pub async fn list_certs(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::list(backend.storage().list_certs().await?))
}

pub async fn list_revoked(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::list(backend.storage().list_revoked().await?))
}

async fn raw_entry(backend: &Backend, key: &str) -> Result<Vec<u8>> {
    Ok(backend
        .storage()
        .get_raw(key)
        .await?
        .map(|b| b.to_vec())
        .unwrap_or_default())
}

fn pem_or_empty(label: &str, der: &[u8]) -> String {
    if der.is_empty() {
        String::new()
    } else {
        pem_trimmed(label, der)
    }
}

/// CA certificate followed by its issuers, PEM, one per entry.
async fn chain_pems(backend: &Backend) -> Result<Vec<String>> {
    let Some(bundle) = backend.storage().fetch_ca_bundle().await? else {
        return Ok(Vec::new());
    };
    let parsed: ParsedCertBundle = CertBundle::to_parsed(&bundle)?;
    let mut chain = vec![pem_trimmed("CERTIFICATE", &parsed.certificate_der)];
    for der in &parsed.ca_chain_der {
        if *der != parsed.certificate_der {
            chain.push(pem_trimmed("CERTIFICATE", der));
        }
    }
    Ok(chain)
}

pub async fn ca_der(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::raw(PKIX_CERT, raw_entry(backend, CA_KEY).await?))
}

pub async fn ca_pem(backend: &Arc<Backend>) -> Result<Response> {
    let der = raw_entry(backend, CA_KEY).await?;
    Ok(Response::raw(PEM_CHAIN, pem_or_empty("CERTIFICATE", &der).into_bytes()))
}

pub async fn ca_chain_raw(backend: &Arc<Backend>) -> Result<Response> {
    let chain = chain_pems(backend).await?.join("\n");
    Ok(Response::raw(PEM_CHAIN, chain.into_bytes()))
}

pub async fn crl_der(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::raw(PKIX_CRL, raw_entry(backend, CRL_KEY).await?))
}

pub async fn crl_pem(backend: &Arc<Backend>) -> Result<Response> {
    let der = raw_entry(backend, CRL_KEY).await?;
    Ok(Response::raw(PEM_FILE, pem_or_empty("X509 CRL", &der).into_bytes()))
}

pub async fn cert_ca(backend: &Arc<Backend>) -> Result<Response> {
    let der = raw_entry(backend, CA_KEY).await?;
    Ok(Response::data(json!({ "certificate": pem_or_empty("CERTIFICATE", &der) })))
}

pub async fn cert_crl(backend: &Arc<Backend>) -> Result<Response> {
    let der = raw_entry(backend, CRL_KEY).await?;
    Ok(Response::data(json!({ "certificate": pem_or_empty("X509 CRL", &der) })))
}

pub async fn cert_ca_chain(backend: &Arc<Backend>) -> Result<Response> {
    let chain = chain_pems(backend).await?.join("\n");
    Ok(Response::data(json!({ "certificate": chain })))
}

/// A stored or revoked certificate. Revoked ones carry their revocation time.
pub async fn cert_by_serial(backend: &Arc<Backend>, serial: &str) -> Result<Response> {
    let serial = parse_serial(serial)?;
    let storage = backend.storage();

    let (der, revocation_time, revocation_time_rfc3339) =
        match storage.fetch_cert_der(&serial).await? {
            Some(der) => (der.to_vec(), 0, String::new()),
            None => {
                let revoked = storage.fetch_revocation(&serial).await?.ok_or_else(|| {
                    PkiError::NotFound(format!("certificate with serial {serial} not found"))
                })?;
                (
                    revoked.certificate_bytes,
                    revoked.revocation_time,
                    revoked.revocation_time_utc,
                )
            }
        };

    Ok(Response::data(json!({
        "certificate": pem_trimmed("CERTIFICATE", &der),
        "revocation_time": revocation_time,
        "revocation_time_rfc3339": revocation_time_rfc3339,
    })))
}

/// Only certificates present under `revoked/`.
pub async fn revoked_by_serial(backend: &Arc<Backend>, serial: &str) -> Result<Response> {
    let serial = parse_serial(serial)?;
    let revoked = backend
        .storage()
        .fetch_revocation(&serial)
        .await?
        .ok_or_else(|| PkiError::NotFound(format!("no revoked certificate with serial {serial}")))?;
    Ok(Response::data(json!({
        "certificate": pem_trimmed("CERTIFICATE", &revoked.certificate_bytes),
        "revocation_time": revoked.revocation_time,
        "revocation_time_rfc3339": revoked.revocation_time_utc,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::SystemView;
    use crate::handlers::{handle_request, Request};
    use crate::metrics::NoopSink;
    use crate::storage::InMemoryStorage;

    fn backend() -> Arc<Backend> {
        Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            Arc::new(NoopSink),
            "fetch-test",
        )
    }

    #[tokio::test]
    async fn test_missing_ca_serves_empty_body() {
        let b = backend();
        let resp = handle_request(&b, Request::read("ca")).await.unwrap();
        let raw = resp.raw.unwrap();
        assert_eq!(raw.content_type, PKIX_CERT);
        assert!(raw.body.is_empty());

        let resp = handle_request(&b, Request::read("cert/ca")).await.unwrap();
        assert_eq!(resp.get("certificate"), "");
    }

    #[tokio::test]
    async fn test_unknown_serial_is_not_found() {
        let err = handle_request(&backend(), Request::read("cert/01:02:03"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = handle_request(&backend(), Request::read("cert/not-hex"))
            .await
            .unwrap_err();
        assert!(err.is_user_error());
    }
}
