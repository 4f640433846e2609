//! Flat configuration endpoints: `config/crl`, `config/urls`,
//! `config/pathlength`, `config/chain` and `config/auto-tidy`.

use super::format::pem_trimmed;
use super::{Request, Response};
use crate::backend::Backend;
use crate::certutil::UrlEntries;
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldType};
use crate::revocation::build_crl;
use crate::tidy::AUTO_TIDY_FIELDS;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const CRL_FIELDS: &[Field] = &[
    Field::new("expiry", FieldType::String),
    Field::new("disable", FieldType::Bool),
];

const URL_FIELDS: &[Field] = &[
    Field::new("issuing_certificates", FieldType::CommaStringSlice),
    Field::new("crl_distribution_points", FieldType::CommaStringSlice),
    Field::new("ocsp_servers", FieldType::CommaStringSlice),
];

const PATH_LENGTH_FIELDS: &[Field] = &[Field::new("max_path_length", FieldType::Int)];

pub async fn read_crl_config(backend: &Arc<Backend>) -> Result<Response> {
    let config = backend.storage().fetch_crl_config().await?;
    Ok(Response::data(json!({
        "expiry": config.expiry,
        "disable": config.disable,
    })))
}

/// Flipping `disable` rebuilds the CRL so the change is visible at once.
pub async fn write_crl_config(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(CRL_FIELDS)?;
    let storage = backend.storage();
    let mut config = storage.fetch_crl_config().await?;
    let old_disable = config.disable;

    if let Some(expiry) = data.string("expiry")? {
        config.expiry = expiry;
        config.expiry_duration()?;
    }
    if let Some(disable) = data.bool("disable")? {
        config.disable = disable;
    }
    storage.store_crl_config(&config).await?;

    if old_disable != config.disable {
        build_crl(backend)
            .await
            .map_err(|e| e.context("error building CRL while updating config"))?;
    }
    Ok(Response::empty())
}

pub async fn read_urls(backend: &Arc<Backend>) -> Result<Response> {
    let urls = backend.storage().fetch_urls().await?;
    Ok(Response::data(serde_json::to_value(urls)?))
}

pub async fn write_urls(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(URL_FIELDS)?;
    let storage = backend.storage();
    let mut urls: UrlEntries = storage.fetch_urls().await?;
    if let Some(v) = data.string_list("issuing_certificates")? {
        urls.issuing_certificates = v;
    }
    if let Some(v) = data.string_list("crl_distribution_points")? {
        urls.crl_distribution_points = v;
    }
    if let Some(v) = data.string_list("ocsp_servers")? {
        urls.ocsp_servers = v;
    }
    urls.validate()?;
    storage.store_urls(&urls).await?;
    Ok(Response::empty())
}

pub async fn read_path_length(backend: &Arc<Backend>) -> Result<Response> {
    let len = backend.storage().fetch_path_length().await?;
    Ok(Response::data(json!({ "max_path_length": len })))
}

pub async fn write_path_length(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(PATH_LENGTH_FIELDS)?;
    let len = data
        .int("max_path_length")?
        .ok_or_else(|| PkiError::user("\"max_path_length\" must be provided"))?;
    let len = i32::try_from(len)
        .ok()
        .filter(|v| *v >= -1)
        .ok_or_else(|| PkiError::user(format!("invalid max_path_length: {len}")))?;
    backend.storage().store_path_length(len).await?;
    Ok(Response::empty())
}

/// The stored CA chain, CA certificate first.
pub async fn read_chain(backend: &Arc<Backend>) -> Result<Response> {
    let chain: Vec<String> = match backend.storage().fetch_ca_bundle().await? {
        Some(bundle) => {
            let parsed = bundle.to_parsed()?;
            std::iter::once(&parsed.certificate_der)
                .chain(parsed.ca_chain_der.iter().filter(|d| **d != parsed.certificate_der))
                .map(|der| pem_trimmed("CERTIFICATE", der))
                .collect()
        }
        None => Vec::new(),
    };
    Ok(Response::data(json!({ "ca_chain": chain })))
}

pub async fn read_auto_tidy(backend: &Arc<Backend>) -> Result<Response> {
    let config = backend.storage().fetch_auto_tidy_config().await?;
    Ok(Response::data(config.to_response()))
}

/// Merges onto the stored config and reapplies the counter settings.
pub async fn write_auto_tidy(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(AUTO_TIDY_FIELDS)?;
    let storage = backend.storage();
    let config = storage.fetch_auto_tidy_config().await?.merge(&data)?;
    if config.enabled && !config.any_operation_enabled() {
        return Err(PkiError::user(
            "auto-tidy enabled but no tidy operations were requested",
        ));
    }
    storage.store_auto_tidy_config(&config).await?;
    backend.apply_counter_config(&config);
    info!(
        "Auto-tidy configuration updated (enabled={}, interval={}s)",
        config.enabled,
        config.interval_duration.as_secs()
    );
    Ok(Response::data(config.to_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::SystemView;
    use crate::handlers::handle_request;
    use crate::metrics::NoopSink;
    use crate::storage::InMemoryStorage;

    fn backend() -> Arc<Backend> {
        Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            Arc::new(NoopSink),
            "settings-test",
        )
    }

    #[tokio::test]
    async fn test_urls_round_trip_and_validation() {
        let b = backend();
        handle_request(
            &b,
            Request::update(
                "config/urls",
                json!({"issuing_certificates": "http://pki.example.com/ca"}),
            ),
        )
        .await
        .unwrap();
        let read = handle_request(&b, Request::read("config/urls")).await.unwrap();
        assert_eq!(read.get("issuing_certificates"), &json!(["http://pki.example.com/ca"]));
        assert_eq!(read.get("ocsp_servers"), &json!([]));

        let err = handle_request(
            &b,
            Request::update("config/urls", json!({"ocsp_servers": "not a url"})),
        )
        .await
        .unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_crl_config_rejects_bad_expiry() {
        let b = backend();
        let err = handle_request(&b, Request::update("config/crl", json!({"expiry": "whenever"})))
            .await
            .unwrap_err();
        assert!(err.is_user_error());

        handle_request(&b, Request::update("config/crl", json!({"expiry": "24h"})))
            .await
            .unwrap();
        let read = handle_request(&b, Request::read("config/crl")).await.unwrap();
        assert_eq!(read.get("expiry"), "24h");
        assert_eq!(read.get("disable"), false);
    }

    #[tokio::test]
    async fn test_path_length() {
        let b = backend();
        let read = handle_request(&b, Request::read("config/pathlength")).await.unwrap();
        assert!(read.get("max_path_length").is_null());

        handle_request(&b, Request::update("config/pathlength", json!({"max_path_length": 2})))
            .await
            .unwrap();
        let read = handle_request(&b, Request::read("config/pathlength")).await.unwrap();
        assert_eq!(read.get("max_path_length"), 2);

        let err = handle_request(&b, Request::update("config/pathlength", json!({"max_path_length": -4})))
            .await
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_auto_tidy_merges_onto_stored() {
        let b = backend();
        handle_request(
            &b,
            Request::update(
                "config/auto-tidy",
                json!({"enabled": true, "tidy_cert_store": true, "interval_duration": "1h"}),
            ),
        )
        .await
        .unwrap();
        handle_request(&b, Request::update("config/auto-tidy", json!({"safety_buffer": 60})))
            .await
            .unwrap();

        let read = handle_request(&b, Request::read("config/auto-tidy")).await.unwrap();
        assert_eq!(read.get("enabled"), true);
        assert_eq!(read.get("tidy_cert_store"), true);
        assert_eq!(read.get("interval_duration"), 3600);
        assert_eq!(read.get("safety_buffer"), 60);

        let err = handle_request(
            &b,
            Request::update(
                "config/auto-tidy",
                json!({"publish_stored_certificate_count_metrics": true}),
            ),
        )
        .await
        .unwrap_err();
        assert!(err.is_user_error());
    }
}
