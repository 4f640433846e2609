use super::{Request, Response};
use crate::acme;
use crate::backend::Backend;
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldType};
use std::sync::Arc;

const ACCOUNT_FIELDS: &[Field] = &[Field::new("status", FieldType::String)];

pub async fn list_accounts(backend: &Arc<Backend>) -> Result<Response> {
    let keys = acme::list_account_key_ids(backend.storage()).await?;
    Ok(Response::list(keys))
}

pub async fn read_account(backend: &Arc<Backend>, key_id: &str) -> Result<Response> {
    Ok(Response::data(acme::read_account(backend.storage(), key_id).await?))
}

pub async fn update_account(backend: &Arc<Backend>, req: &Request, key_id: &str) -> Result<Response> {
    let data = req.fields(ACCOUNT_FIELDS)?;
    let status = data
        .string("status")?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PkiError::user("\"status\" must be provided"))?;
    let view = acme::update_account_status(backend.storage(), key_id, &status).await?;
    Ok(Response::data(view))
}
