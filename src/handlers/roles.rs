use super::{Request, Response};
use crate::backend::Backend;
use crate::error::{PkiError, Result};
use crate::role::{validate_role_name, RoleEntry, ROLE_FIELDS};
use std::sync::Arc;
use tracing::info;

pub async fn list_roles(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::list(backend.storage().list_roles().await?))
}

pub async fn read_role(backend: &Arc<Backend>, name: &str) -> Result<Response> {
    validate_role_name(name)?;
    let role = backend
        .storage()
        .fetch_role(name)
        .await?
        .ok_or_else(|| PkiError::NotFound(format!("role {name} not found")))?;
    Ok(Response::data(role.to_response()))
}

/// Creates or replaces a role; omitted fields take their defaults.
pub async fn write_role(backend: &Arc<Backend>, req: &Request, name: &str) -> Result<Response> {
    validate_role_name(name)?;
    let data = req.fields(ROLE_FIELDS)?;
    let role = RoleEntry::from_field_data(&data)?;
    backend.storage().store_role(name, &role).await?;
    info!("Stored role {}", name);
    Ok(Response::data(role.to_response()))
}

pub async fn delete_role(backend: &Arc<Backend>, name: &str) -> Result<Response> {
    validate_role_name(name)?;
    backend.storage().delete_role(name).await?;
    info!("Deleted role {}", name);
    Ok(Response::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::SystemView;
    use crate::handlers::handle_request;
    use crate::metrics::NoopSink;
    use crate::storage::{InMemoryStorage, LocalStorage};
    use serde_json::json;

    fn backend() -> Arc<Backend> {
        Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            Arc::new(NoopSink),
            "roles-test",
        )
    }

    #[tokio::test]
    async fn test_role_crud() {
        let b = backend();
        let written = handle_request(
            &b,
            Request::update(
                "roles/web",
                json!({"allowed_domains": "example.com", "allow_subdomains": true, "ttl": "1h"}),
            ),
        )
        .await
        .unwrap();
        assert_eq!(written.get("allowed_domains"), &json!(["example.com"]));
        assert_eq!(written.get("key_bits"), &json!(2048));

        let listed = handle_request(&b, Request::list("roles")).await.unwrap();
        assert_eq!(listed.get("keys"), &json!(["web"]));

        let read = handle_request(&b, Request::read("roles/web")).await.unwrap();
        assert_eq!(read.get("allow_subdomains"), &json!(true));
        assert_eq!(read.get("ttl"), &json!(3600));

        handle_request(&b, Request::delete("roles/web")).await.unwrap();
        let err = handle_request(&b, Request::read("roles/web")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_role_name_validated_before_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = Backend::new(
            Arc::new(LocalStorage::new(dir.path()).unwrap()),
            SystemView::default(),
            Arc::new(NoopSink),
            "roles-local",
        );

        for bad in ["roles/bad name", "roles/..", "roles/web*"] {
            let err = handle_request(&b, Request::update(bad, json!({})))
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad}");
        }
        let err = handle_request(&b, Request::read("roles/bad name"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        handle_request(&b, Request::update("roles/svc.example-v2", json!({})))
            .await
            .unwrap();
        let listed = handle_request(&b, Request::list("roles")).await.unwrap();
        assert_eq!(listed.get("keys"), &json!(["svc.example-v2"]));
    }

    #[tokio::test]
    async fn test_role_rejects_ttl_above_max() {
        let err = handle_request(
            &backend(),
            Request::update("roles/web", json!({"ttl": "2h", "max_ttl": "1h"})),
        )
        .await
        .unwrap_err();
        assert!(err.is_user_error());
    }
}
