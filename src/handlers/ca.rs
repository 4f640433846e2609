//! CA lifecycle: import, root generation, intermediate CSRs, installing a
//! signed intermediate and signing intermediates.

use super::format::{cert_bundle_data, csr_data, key_format_from_data, OutputFormat};
use super::issue::required_csr;
use super::{Request, Response};
use crate::authoring::{create_csr, create_self_signed, sign_cert};
use crate::backend::Backend;
use crate::certutil::{
    normalize_serial, parse_csr, parse_pem_bundle, validate_key_type_length, KeyType,
    ParsedCertBundle, PrivateKeyFormat, UrlEntries,
};
use crate::counter::CountKind;
use crate::creation::{build_creation_bundle, CreationInput};
use crate::error::{PkiError, Result};
use crate::fields::{Field, FieldData, FieldType};
use crate::revocation::build_crl;
use crate::role::RoleEntry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const SUBJECT_FIELDS: [Field; 8] = [
    Field::new("ou", FieldType::CommaStringSlice),
    Field::new("organization", FieldType::CommaStringSlice),
    Field::new("country", FieldType::CommaStringSlice),
    Field::new("locality", FieldType::CommaStringSlice),
    Field::new("province", FieldType::CommaStringSlice),
    Field::new("street_address", FieldType::CommaStringSlice),
    Field::new("postal_code", FieldType::CommaStringSlice),
    Field::new("serial_number", FieldType::String),
];

pub const GENERATE_ROOT_FIELDS: &[Field] = &[
    Field::new("common_name", FieldType::String),
    Field::new("alt_names", FieldType::CommaStringSlice),
    Field::new("ip_sans", FieldType::CommaStringSlice),
    Field::new("uri_sans", FieldType::CommaStringSlice),
    Field::new("other_sans", FieldType::CommaStringSlice),
    Field::new("ttl", FieldType::Duration),
    Field::new("not_after", FieldType::String),
    Field::new("format", FieldType::String),
    Field::new("private_key_format", FieldType::String),
    Field::new("exclude_cn_from_sans", FieldType::Bool),
    Field::new("key_type", FieldType::String),
    Field::new("key_bits", FieldType::Int),
    Field::new("signature_bits", FieldType::Int),
    Field::new("max_path_length", FieldType::Int),
    SUBJECT_FIELDS[0],
    SUBJECT_FIELDS[1],
    SUBJECT_FIELDS[2],
    SUBJECT_FIELDS[3],
    SUBJECT_FIELDS[4],
    SUBJECT_FIELDS[5],
    SUBJECT_FIELDS[6],
    SUBJECT_FIELDS[7],
];

pub const GENERATE_INTERMEDIATE_FIELDS: &[Field] = &[
    Field::new("common_name", FieldType::String),
    Field::new("alt_names", FieldType::CommaStringSlice),
    Field::new("ip_sans", FieldType::CommaStringSlice),
    Field::new("uri_sans", FieldType::CommaStringSlice),
    Field::new("other_sans", FieldType::CommaStringSlice),
    Field::new("format", FieldType::String),
    Field::new("private_key_format", FieldType::String),
    Field::new("exclude_cn_from_sans", FieldType::Bool),
    Field::new("key_type", FieldType::String),
    Field::new("key_bits", FieldType::Int),
    Field::new("signature_bits", FieldType::Int),
    SUBJECT_FIELDS[0],
    SUBJECT_FIELDS[1],
    SUBJECT_FIELDS[2],
    SUBJECT_FIELDS[3],
    SUBJECT_FIELDS[4],
    SUBJECT_FIELDS[5],
    SUBJECT_FIELDS[6],
    SUBJECT_FIELDS[7],
];

pub const SIGN_INTERMEDIATE_FIELDS: &[Field] = &[
    Field::new("csr", FieldType::String),
    Field::new("common_name", FieldType::String),
    Field::new("alt_names", FieldType::CommaStringSlice),
    Field::new("ip_sans", FieldType::CommaStringSlice),
    Field::new("uri_sans", FieldType::CommaStringSlice),
    Field::new("other_sans", FieldType::CommaStringSlice),
    Field::new("ttl", FieldType::Duration),
    Field::new("not_after", FieldType::String),
    Field::new("format", FieldType::String),
    Field::new("exclude_cn_from_sans", FieldType::Bool),
    Field::new("signature_bits", FieldType::Int),
    Field::new("max_path_length", FieldType::Int),
    Field::new("use_csr_values", FieldType::Bool),
    SUBJECT_FIELDS[0],
    SUBJECT_FIELDS[1],
    SUBJECT_FIELDS[2],
    SUBJECT_FIELDS[3],
    SUBJECT_FIELDS[4],
    SUBJECT_FIELDS[5],
    SUBJECT_FIELDS[6],
    SUBJECT_FIELDS[7],
];

const CONFIG_CA_FIELDS: &[Field] = &[Field::new("pem_bundle", FieldType::String)];
const SET_SIGNED_FIELDS: &[Field] = &[Field::new("certificate", FieldType::String)];

const NOT_A_CA: &str =
    "the given certificate is not marked for CA use and cannot be used with this backend";

/// Exported keys are returned to the caller; internal ones never leave storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exported {
    Yes,
    No,
}

fn parse_export_kind(kind: &str) -> Result<Exported> {
    match kind {
        "exported" => Ok(Exported::Yes),
        "internal" => Ok(Exported::No),
        "kms" => Err(PkiError::user("managed keys are not supported by this backend")),
        other => Err(PkiError::user(format!(
            "invalid type {other:?}: must be \"exported\", \"internal\" or \"kms\""
        ))),
    }
}

fn int_to_u32(data: &FieldData, name: &str) -> Result<u32> {
    match data.int(name)? {
        Some(v) => u32::try_from(v).map_err(|_| PkiError::user(format!("invalid {name}: {v}"))),
        None => Ok(0),
    }
}

/// The permissive role used to author CA certificates, with key and subject
/// settings taken from the request.
fn ca_role(data: &FieldData, generates_key: bool) -> Result<RoleEntry> {
    let mut role = RoleEntry::permissive_ca_role();
    role.ttl = data.duration("ttl")?.unwrap_or_default();
    role.signature_bits = int_to_u32(data, "signature_bits")?;

    if generates_key {
        let key_type: KeyType = data.string_or("key_type", "rsa")?.parse()?;
        if key_type == KeyType::Any {
            return Err(PkiError::user("key_type \"any\" cannot be used to generate a key"));
        }
        role.key_type = key_type;
        role.key_bits = validate_key_type_length(key_type, int_to_u32(data, "key_bits")?)?;
    }

    role.ou = data.string_list_or_empty("ou")?;
    role.organization = data.string_list_or_empty("organization")?;
    role.country = data.string_list_or_empty("country")?;
    role.locality = data.string_list_or_empty("locality")?;
    role.province = data.string_list_or_empty("province")?;
    role.street_address = data.string_list_or_empty("street_address")?;
    role.postal_code = data.string_list_or_empty("postal_code")?;
    role.validate()?;
    Ok(role)
}

/// Explicit request value, then `config/pathlength`.
async fn requested_path_length(backend: &Backend, data: &FieldData) -> Result<Option<i32>> {
    match data.int("max_path_length")? {
        Some(v) => i32::try_from(v)
            .ok()
            .filter(|v| *v >= -1)
            .map(Some)
            .ok_or_else(|| PkiError::user(format!("invalid max_path_length: {v}"))),
        None => backend.storage().fetch_path_length().await,
    }
}

async fn record_issued(backend: &Backend, bundle: &ParsedCertBundle) -> Result<()> {
    let serial = &bundle.info.serial_number;
    backend
        .storage()
        .store_cert(serial, &bundle.certificate_der)
        .await
        .map_err(|e| e.context("unable to store certificate locally"))?;
    backend.counter().increment(CountKind::Certificates, serial);
    Ok(())
}

/// `config/ca`: imports a PEM bundle holding a CA certificate and its key.
pub async fn config_ca(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(CONFIG_CA_FIELDS)?;
    let pem_bundle = data
        .string("pem_bundle")?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PkiError::user("\"pem_bundle\" must be provided"))?;

    let bundle = parse_pem_bundle(&pem_bundle)?;
    if bundle.private_key.is_none() {
        return Err(PkiError::user("private key not found in the PEM bundle"));
    }
    if !bundle.info.is_ca {
        return Err(PkiError::user(NOT_A_CA));
    }

    backend.storage().store_ca_bundle(&bundle).await?;
    build_crl(backend)
        .await
        .map_err(|e| e.context("error building CRL after importing the CA"))?;
    info!("Imported CA certificate {}", bundle.info.serial_number);
    Ok(Response::empty())
}

/// `root/generate/<type>`.
pub async fn generate_root(backend: &Arc<Backend>, req: &Request, kind: &str) -> Result<Response> {
    let exported = parse_export_kind(kind)?;
    let data = req.fields(GENERATE_ROOT_FIELDS)?;
    let storage = backend.storage();

    if storage.fetch_ca_bundle().await?.is_some() {
        warn!("Refusing to generate a root over an existing CA");
        return Ok(Response::empty().with_warning(
            "Refusing to generate a root certificate over an existing root certificate. \
             If you really want to destroy the original root certificate, \
             please issue a delete against the root/ endpoint.",
        ));
    }

    let mut role = ca_role(&data, true)?;
    role.max_path_length = Some(requested_path_length(backend, &data).await?.unwrap_or(-1));
    let urls = storage.fetch_urls().await?;
    let system = req.system_view(backend);

    let cb = build_creation_bundle(CreationInput {
        role: &role,
        signing: None,
        csr: None,
        data: &data,
        urls: &urls,
        system: &system,
        is_ca: true,
        use_csr_values: false,
    })?;
    if cb.common_name.is_empty() {
        return Err(PkiError::user("the common_name field is required for a root"));
    }
    let bundle = create_self_signed(&cb)?;

    storage.store_ca_bundle(&bundle).await?;
    record_issued(backend, &bundle).await?;
    build_crl(backend)
        .await
        .map_err(|e| e.context("error building CRL for the new root"))?;
    info!(
        "Generated {} root {} with serial {}",
        kind, cb.common_name, bundle.info.serial_number
    );

    let format = OutputFormat::from_data(&data)?;
    let key_format = key_format_from_data(&data)?;
    let mut shown = bundle.clone();
    if exported == Exported::No {
        shown.private_key = None;
    }
    let mut out = cert_bundle_data(&shown, format, key_format)?;
    out.remove("ca_chain");
    Ok(Response::data(Value::Object(out)))
}

/// `root` delete: forgets the CA so a new one can be generated or imported.
pub async fn delete_root(backend: &Arc<Backend>) -> Result<Response> {
    backend.storage().delete_ca().await?;
    warn!("Deleted the CA bundle and CRL");
    Ok(Response::empty())
}

/// `intermediate/generate/<type>`: new key plus a CSR for an external CA to sign.
pub async fn generate_intermediate(
    backend: &Arc<Backend>,
    req: &Request,
    kind: &str,
) -> Result<Response> {
    let exported = parse_export_kind(kind)?;
    let data = req.fields(GENERATE_INTERMEDIATE_FIELDS)?;
    let role = ca_role(&data, true)?;
    let system = req.system_view(backend);
    let urls = UrlEntries::default();

    let cb = build_creation_bundle(CreationInput {
        role: &role,
        signing: None,
        csr: None,
        data: &data,
        urls: &urls,
        system: &system,
        is_ca: true,
        use_csr_values: false,
    })?;
    let csr = create_csr(&cb)?;
    backend.storage().store_pending_key(&csr.private_key).await?;
    info!("Generated intermediate CSR for {}", cb.common_name);

    let format = OutputFormat::from_data(&data)?;
    let key_format = key_format_from_data(&data)?;
    let key = (exported == Exported::Yes).then_some(&csr.private_key);
    let out = csr_data(&csr.csr_der, key, format, key_format)?;
    Ok(Response::data(Value::Object(out)))
}

/// `intermediate/set-signed`: pairs a signed certificate with the pending key.
pub async fn set_signed_intermediate(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(SET_SIGNED_FIELDS)?;
    let certificate = data
        .string("certificate")?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PkiError::user("no certificate provided in the \"certificate\" parameter"))?;

    let storage = backend.storage();
    let key = storage.fetch_pending_key().await?.ok_or_else(|| {
        PkiError::user(
            "could not find an existing private key; generate an intermediate CSR first",
        )
    })?;

    let mut bundle = parse_pem_bundle(&certificate)?;
    if bundle.private_key.is_some() {
        return Err(PkiError::user(
            "the given certificate bundle must not contain a private key",
        ));
    }
    if !bundle.info.is_ca {
        return Err(PkiError::user(NOT_A_CA));
    }
    bundle.private_key = Some(key);
    bundle.verify_key_matches()?;

    let mut response = Response::empty();
    if bundle.ca_chain_der.is_empty() {
        response = response.with_warning(
            "could not find the issuing CA in the given bundle; only the certificate was stored",
        );
    }

    storage.store_ca_bundle(&bundle).await?;
    storage.delete_pending_key().await?;
    record_issued(backend, &bundle).await?;
    build_crl(backend)
        .await
        .map_err(|e| e.context("error building CRL for the new intermediate"))?;
    info!("Installed signed intermediate {}", bundle.info.serial_number);
    Ok(response)
}

/// `root/sign-intermediate` and `issuers/<ref>/sign-intermediate`.
pub async fn sign_intermediate(
    backend: &Arc<Backend>,
    req: &Request,
    issuer_ref: &str,
) -> Result<Response> {
    let data = req.fields(SIGN_INTERMEDIATE_FIELDS)?;
    let storage = backend.storage();
    let signing = storage.fetch_signing_bundle().await?;
    if issuer_ref != "default"
        && normalize_serial(issuer_ref) != normalize_serial(&signing.info.serial_number)
    {
        return Err(PkiError::user(format!("unable to find issuer {issuer_ref:?}")));
    }

    let csr = parse_csr(&required_csr(&data)?)?;
    let mut role = ca_role(&data, false)?;
    role.max_path_length = requested_path_length(backend, &data).await?;
    let use_csr_values = data.bool_or("use_csr_values", false)?;
    let urls = storage.fetch_urls().await?;
    let system = req.system_view(backend);

    let cb = build_creation_bundle(CreationInput {
        role: &role,
        signing: Some(&signing),
        csr: Some(&csr),
        data: &data,
        urls: &urls,
        system: &system,
        is_ca: true,
        use_csr_values,
    })?;
    let bundle = sign_cert(&cb, &csr)?;
    record_issued(backend, &bundle).await?;
    info!(
        "Signed intermediate {} for {:?}",
        bundle.info.serial_number, cb.common_name
    );

    let format = OutputFormat::from_data(&data)?;
    let out = cert_bundle_data(&bundle, format, PrivateKeyFormat::Legacy)?;
    Ok(Response::data(Value::Object(out)))
}
