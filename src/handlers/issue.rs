//! `issue/<role>`, `sign/<role>` and `sign-verbatim[/<role>]`.

use super::format::{cert_bundle_data, key_format_from_data, OutputFormat};
use super::{Request, Response};
use crate::authoring::{create_leaf, sign_cert};
use crate::backend::Backend;
use crate::certutil::{parse_csr, KeyType, ParsedCertBundle, PrivateKeyFormat};
use crate::counter::CountKind;
use crate::creation::{build_creation_bundle, CreationInput};
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldData, FieldType};
use crate::role::{validate_role_name, RoleEntry};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const ISSUE_FIELDS: &[Field] = &[
    Field::new("common_name", FieldType::String),
    Field::new("alt_names", FieldType::CommaStringSlice),
    Field::new("ip_sans", FieldType::CommaStringSlice),
    Field::new("uri_sans", FieldType::CommaStringSlice),
    Field::new("other_sans", FieldType::CommaStringSlice),
    Field::new("serial_number", FieldType::String),
    Field::new("ttl", FieldType::Duration),
    Field::new("not_after", FieldType::String),
    Field::new("format", FieldType::String),
    Field::new("private_key_format", FieldType::String),
    Field::new("exclude_cn_from_sans", FieldType::Bool),
];

pub const SIGN_FIELDS: &[Field] = &[
    Field::new("csr", FieldType::String),
    Field::new("common_name", FieldType::String),
    Field::new("alt_names", FieldType::CommaStringSlice),
    Field::new("ip_sans", FieldType::CommaStringSlice),
    Field::new("uri_sans", FieldType::CommaStringSlice),
    Field::new("other_sans", FieldType::CommaStringSlice),
    Field::new("serial_number", FieldType::String),
    Field::new("ttl", FieldType::Duration),
    Field::new("not_after", FieldType::String),
    Field::new("format", FieldType::String),
    Field::new("exclude_cn_from_sans", FieldType::Bool),
];

pub const SIGN_VERBATIM_FIELDS: &[Field] = &[
    Field::new("csr", FieldType::String),
    Field::new("ttl", FieldType::Duration),
    Field::new("not_after", FieldType::String),
    Field::new("format", FieldType::String),
    Field::new("key_usage", FieldType::CommaStringSlice),
    Field::new("ext_key_usage", FieldType::CommaStringSlice),
    Field::new("ext_key_usage_oids", FieldType::CommaStringSlice),
    Field::new("signature_bits", FieldType::Int),
];

async fn load_role(backend: &Backend, name: &str) -> Result<RoleEntry> {
    validate_role_name(name)?;
    backend
        .storage()
        .fetch_role(name)
        .await?
        .ok_or_else(|| PkiError::user(format!("unknown role: {name}")))
}

pub(crate) fn required_csr(data: &FieldData) -> Result<String> {
    data.string("csr")?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PkiError::user("\"csr\" is empty or missing"))
}

/// Generates a key and a leaf certificate under `role`.
pub async fn issue(backend: &Arc<Backend>, req: &Request, role_name: &str) -> Result<Response> {
    let data = req.fields(ISSUE_FIELDS)?;
    let role = load_role(backend, role_name).await?;
    if role.key_type == KeyType::Any {
        return Err(PkiError::user(
            "role key type \"any\" not allowed for issuing certificates, only signing",
        ));
    }

    let storage = backend.storage();
    let signing = storage.fetch_signing_bundle().await?;
    let urls = storage.fetch_urls().await?;
    let system = req.system_view(backend);

    let cb = build_creation_bundle(CreationInput {
        role: &role,
        signing: Some(&signing),
        csr: None,
        data: &data,
        urls: &urls,
        system: &system,
        is_ca: false,
        use_csr_values: false,
    })?;
    let bundle = create_leaf(&cb)?;
    finish(backend, &role, role_name, &bundle, &data, true).await
}

/// Signs a caller-supplied CSR under `role`.
pub async fn sign(backend: &Arc<Backend>, req: &Request, role_name: &str) -> Result<Response> {
    let data = req.fields(SIGN_FIELDS)?;
    let role = load_role(backend, role_name).await?;
    sign_with_role(backend, req, &role, role_name, &data, false).await
}

/// Signs a CSR keeping its subject, SANs and extensions.
///
/// A named role only contributes its TTL limits and its storage and lease
/// settings.
pub async fn sign_verbatim(
    backend: &Arc<Backend>,
    req: &Request,
    role_name: Option<&str>,
) -> Result<Response> {
    let data = req.fields(SIGN_VERBATIM_FIELDS)?;

    let mut role = RoleEntry::permissive_ca_role();
    role.allow_wildcard_certificates = true;
    role.require_cn = false;
    role.server_flag = false;
    role.client_flag = false;
    if let Some(usages) = data.string_list("key_usage")? {
        role.key_usage = usages;
    }
    role.ext_key_usage = data.string_list_or_empty("ext_key_usage")?;
    role.ext_key_usage_oids = data.string_list_or_empty("ext_key_usage_oids")?;
    if let Some(bits) = data.int("signature_bits")? {
        role.signature_bits = u32::try_from(bits)
            .map_err(|_| PkiError::user(format!("invalid signature_bits: {bits}")))?;
    }
    role.validate()?;

    if let Some(name) = role_name {
        let named = load_role(backend, name).await?;
        role.ttl = named.ttl;
        role.max_ttl = named.max_ttl;
        role.generate_lease = named.generate_lease;
        role.no_store = named.no_store;
    }
    sign_with_role(backend, req, &role, role_name.unwrap_or("sign-verbatim"), &data, true).await
}

async fn sign_with_role(
    backend: &Arc<Backend>,
    req: &Request,
    role: &RoleEntry,
    role_name: &str,
    data: &FieldData,
    use_csr_values: bool,
) -> Result<Response> {
    let csr = parse_csr(&required_csr(data)?)?;
    let storage = backend.storage();
    let signing = storage.fetch_signing_bundle().await?;
    let urls = storage.fetch_urls().await?;
    let system = req.system_view(backend);

    let cb = build_creation_bundle(CreationInput {
        role,
        signing: Some(&signing),
        csr: Some(&csr),
        data,
        urls: &urls,
        system: &system,
        is_ca: false,
        use_csr_values,
    })?;
    let bundle = sign_cert(&cb, &csr)?;
    finish(backend, role, role_name, &bundle, data, false).await
}

/// Stores the issued certificate and shapes the response.
async fn finish(
    backend: &Backend,
    role: &RoleEntry,
    role_name: &str,
    bundle: &ParsedCertBundle,
    data: &FieldData,
    generated_key: bool,
) -> Result<Response> {
    let format = OutputFormat::from_data(data)?;
    let key_format = if generated_key {
        key_format_from_data(data)?
    } else {
        PrivateKeyFormat::Legacy
    };

    let serial = &bundle.info.serial_number;
    if !role.no_store {
        backend
            .storage()
            .store_cert(serial, &bundle.certificate_der)
            .await
            .map_err(|e| e.context("unable to store certificate locally"))?;
        backend.counter().increment(CountKind::Certificates, serial);
    }
    info!("Issued certificate {} under role {}", serial, role_name);

    let mut response = Response::data(Value::Object(cert_bundle_data(bundle, format, key_format)?));
    if role.generate_lease {
        let remaining = bundle.info.not_after - Utc::now().timestamp();
        response.lease_duration = Some(u64::try_from(remaining).unwrap_or(0));
    }
    Ok(response)
}
