//! Path router for the engine's endpoints.
//!
//! A [`Request`] names an operation and a mount-relative path; the router
//! picks the handler, which coerces the request data against that path's
//! declared fields before touching the engine.

pub mod acme;
pub mod ca;
pub mod fetch;
pub mod format;
pub mod issue;
pub mod revoke;
pub mod roles;
pub mod settings;
pub mod tidy;

use crate::backend::Backend;
use crate::creation::SystemView;
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldData};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Update,
    Delete,
    List,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub path: String,
    pub data: Map<String, Value>,
    /// Display name of the caller's token.
    pub display_name: String,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            display_name: String::new(),
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(Operation::Read, path)
    }

    pub fn update(path: impl Into<String>, data: Value) -> Self {
        Self::new(Operation::Update, path).with_data(data)
    }

    pub fn list(path: impl Into<String>) -> Self {
        Self::new(Operation::List, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Operation::Delete, path)
    }

    /// Non-object values are ignored.
    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn fields(&self, schema: &[Field]) -> Result<FieldData> {
        FieldData::new(self.data.clone(), schema)
    }

    pub(crate) fn system_view(&self, backend: &Backend) -> SystemView {
        let mut system = backend.system().clone();
        if !self.display_name.is_empty() {
            system.display_name = self.display_name.clone();
        }
        system
    }
}

/// A body served verbatim instead of as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub data: Option<Value>,
    pub raw: Option<RawBody>,
    pub warnings: Vec<String>,
    /// Seconds until the issued certificate expires, when leases are on.
    pub lease_duration: Option<u64>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            data: None,
            raw: None,
            warnings: Vec::new(),
            lease_duration: None,
        }
    }
}

impl Response {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn list(keys: Vec<String>) -> Self {
        Self::data(serde_json::json!({ "keys": keys }))
    }

    pub fn raw(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            raw: Some(RawBody { content_type, body }),
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Field of a JSON response, `Value::Null` when absent.
    pub fn get(&self, key: &str) -> &Value {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .unwrap_or(&Value::Null)
    }
}

/// Dispatches a request to the handler owning its path.
pub async fn handle_request(backend: &Arc<Backend>, req: Request) -> Result<Response> {
    let path = req.path.trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').collect();
    debug!("Handling {:?} {}", req.operation, path);

    use Operation::*;
    match (req.operation, segments.as_slice()) {
        // CA lifecycle
        (Update, ["config", "ca"]) => ca::config_ca(backend, &req).await,
        (Update, ["root", "generate", kind]) => ca::generate_root(backend, &req, kind).await,
        (Delete, ["root"]) => ca::delete_root(backend).await,
        (Update, ["intermediate", "generate", kind]) => {
            ca::generate_intermediate(backend, &req, kind).await
        }
        (Update, ["intermediate", "set-signed"]) => ca::set_signed_intermediate(backend, &req).await,
        (Update, ["root", "sign-intermediate"]) => {
            ca::sign_intermediate(backend, &req, "default").await
        }
        (Update, ["issuers", issuer_ref, "sign-intermediate"]) => {
            ca::sign_intermediate(backend, &req, issuer_ref).await
        }

        // Issuance
        (Update, ["issue", role]) => issue::issue(backend, &req, role).await,
        (Update, ["sign", role]) => issue::sign(backend, &req, role).await,
        (Update, ["sign-verbatim"]) => issue::sign_verbatim(backend, &req, None).await,
        (Update, ["sign-verbatim", role]) => issue::sign_verbatim(backend, &req, Some(*role)).await,

        // Roles
        (List, ["roles"]) => roles::list_roles(backend).await,
        (Read, ["roles", name]) => roles::read_role(backend, name).await,
        (Update, ["roles", name]) => roles::write_role(backend, &req, name).await,
        (Delete, ["roles", name]) => roles::delete_role(backend, name).await,

        // Fetch
        (List, ["certs"]) => fetch::list_certs(backend).await,
        (List, ["certs", "revoked"]) => fetch::list_revoked(backend).await,
        (Read, ["ca"]) => fetch::ca_der(backend).await,
        (Read, ["ca", "pem"]) => fetch::ca_pem(backend).await,
        (Read, ["ca_chain"]) => fetch::ca_chain_raw(backend).await,
        (Read, ["crl"]) => fetch::crl_der(backend).await,
        (Read, ["crl", "pem"]) => fetch::crl_pem(backend).await,
        (Read, ["cert", "ca"]) => fetch::cert_ca(backend).await,
        (Read, ["cert", "crl"]) => fetch::cert_crl(backend).await,
        (Read, ["cert", "ca_chain"]) => fetch::cert_ca_chain(backend).await,
        (Read, ["cert", serial]) => fetch::cert_by_serial(backend, serial).await,
        (Read, ["revoked", serial]) => fetch::revoked_by_serial(backend, serial).await,

        // Revocation
        (Update, ["revoke"]) => revoke::revoke(backend, &req).await,
        (Update, ["revoke-with-key"]) => revoke::revoke_with_key(backend, &req).await,
        (Read, ["crl", "rotate"]) => revoke::rotate_crl(backend).await,

        // Flat configuration
        (Read, ["config", "crl"]) => settings::read_crl_config(backend).await,
        (Update, ["config", "crl"]) => settings::write_crl_config(backend, &req).await,
        (Read, ["config", "urls"]) => settings::read_urls(backend).await,
        (Update, ["config", "urls"]) => settings::write_urls(backend, &req).await,
        (Read, ["config", "pathlength"]) => settings::read_path_length(backend).await,
        (Update, ["config", "pathlength"]) => settings::write_path_length(backend, &req).await,
        (Read, ["config", "chain"]) => settings::read_chain(backend).await,
        (Read, ["config", "auto-tidy"]) => settings::read_auto_tidy(backend).await,
        (Update, ["config", "auto-tidy"]) => settings::write_auto_tidy(backend, &req).await,

        // Tidy
        (Update, ["tidy"]) => tidy::tidy(backend, &req).await,
        (Read, ["tidy-status"]) => tidy::tidy_status(backend).await,
        (Update, ["tidy-cancel"]) => tidy::tidy_cancel(backend).await,

        // ACME account management
        (List, ["acme", "mgmt", "account", "keyid"]) => acme::list_accounts(backend).await,
        (Read, ["acme", "mgmt", "account", "keyid", key_id]) => {
            acme::read_account(backend, key_id).await
        }
        (Update, ["acme", "mgmt", "account", "keyid", key_id]) => {
            acme::update_account(backend, &req, key_id).await
        }

        _ => Err(PkiError::NotFound(format!(
            "no handler for {:?} on path {path:?}",
            req.operation
        ))),
    }
}

/// Whether errors on this path are reported as ACME problem documents.
pub fn is_acme_path(path: &str) -> bool {
    path.trim_start_matches('/').starts_with("acme/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopSink;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn backend() -> Arc<Backend> {
        Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            Arc::new(NoopSink),
            "test-mount",
        )
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let err = handle_request(&backend(), Request::read("nope/nothing"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_wrong_operation_is_not_found() {
        let err = handle_request(&backend(), Request::delete("tidy-status"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let err = handle_request(
            &backend(),
            Request::update("roles/web", json!({"allow_everything": true})),
        )
        .await
        .unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("allow_everything"));
    }

    #[test]
    fn test_acme_paths() {
        assert!(is_acme_path("acme/mgmt/account/keyid/abc"));
        assert!(is_acme_path("/acme/mgmt/account/keyid/"));
        assert!(!is_acme_path("roles/acme"));
    }
}
