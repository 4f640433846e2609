use super::{Request, Response};
use crate::backend::Backend;
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldData, FieldType};
use crate::revocation::{build_crl, resolve_revocation_target, revoke_cert};
use serde_json::json;
use std::sync::Arc;

pub const REVOKE_FIELDS: &[Field] = &[
    Field::new("serial_number", FieldType::String),
    Field::new("certificate", FieldType::String),
];

pub const REVOKE_WITH_KEY_FIELDS: &[Field] = &[
    Field::new("serial_number", FieldType::String),
    Field::new("certificate", FieldType::String),
    Field::new("private_key", FieldType::String),
];

fn non_empty(data: &FieldData, name: &str) -> Result<Option<String>> {
    Ok(data.string(name)?.filter(|s| !s.trim().is_empty()))
}

async fn revoke_target(backend: &Arc<Backend>, serial: String) -> Result<Response> {
    let revoked = revoke_cert(backend, &serial).await?;
    let data = match revoked {
        Some(info) => json!({
            "revocation_time": info.revocation_time,
            "revocation_time_rfc3339": info.revocation_time_utc,
        }),
        None => json!({ "revocation_time": 0 }),
    };
    Ok(Response::data(data))
}

pub async fn revoke(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(REVOKE_FIELDS)?;
    let serial = non_empty(&data, "serial_number")?;
    let certificate = non_empty(&data, "certificate")?;
    let serial =
        resolve_revocation_target(backend, serial.as_deref(), certificate.as_deref(), None).await?;
    revoke_target(backend, serial).await
}

/// Revocation proven by possession of the certificate's private key.
pub async fn revoke_with_key(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(REVOKE_WITH_KEY_FIELDS)?;
    let private_key = non_empty(&data, "private_key")?
        .ok_or_else(|| PkiError::user("\"private_key\" must be provided"))?;
    let serial = non_empty(&data, "serial_number")?;
    let certificate = non_empty(&data, "certificate")?;
    let serial = resolve_revocation_target(
        backend,
        serial.as_deref(),
        certificate.as_deref(),
        Some(&private_key),
    )
    .await?;
    revoke_target(backend, serial).await
}

pub async fn rotate_crl(backend: &Arc<Backend>) -> Result<Response> {
    build_crl(backend).await.map_err(|e| e.context("error building CRL"))?;
    Ok(Response::data(json!({ "success": true })))
}
