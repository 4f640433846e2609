//! Revocation records and CRL generation.
//!
//! Everything that reads or writes `revoked/` runs under the backend's
//! revoke lock, so a CRL always reflects a consistent set of revocations.

use crate::backend::Backend;
use crate::certutil::{normalize_serial, parse_serial, serial_to_bytes, CertInfo, PrivateKey};
use crate::counter::CountKind;
use crate::error::{PkiError, Result};
use crate::fields::parse_duration;
use crate::storage::pki::CRL_KEY;
use chrono::{TimeZone, Utc};
use rcgen::{CertificateRevocationListParams, KeyIdMethod, RevokedCertParams, SerialNumber};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Stored at `revoked/<serial>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationInfo {
    #[serde(with = "base64_bytes")]
    pub certificate_bytes: Vec<u8>,
    pub revocation_time: i64,
    #[serde(default)]
    pub revocation_time_utc: String,
}

impl RevocationInfo {
    pub fn new(certificate_bytes: Vec<u8>, revocation_time: i64) -> Self {
        let revocation_time_utc = Utc
            .timestamp_opt(revocation_time, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Self {
            certificate_bytes,
            revocation_time,
            revocation_time_utc,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Stored at `config/crl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrlConfig {
    pub expiry: String,
    pub disable: bool,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            expiry: "72h".to_string(),
            disable: false,
        }
    }
}

impl CrlConfig {
    pub fn expiry_duration(&self) -> Result<Duration> {
        parse_duration(&self.expiry)
            .map_err(|e| e.context("given expiry could not be decoded"))
    }
}

/// Revokes a stored certificate and rebuilds the CRL.
///
/// Returns `None` when the certificate had already expired: its `certs/`
/// entry is removed and nothing is added to the CRL.
pub async fn revoke_cert(backend: &Backend, serial: &str) -> Result<Option<RevocationInfo>> {
    let serial = parse_serial(serial)?;
    let storage = backend.storage();

    if let Some(ca) = storage.fetch_ca_bundle().await? {
        if normalize_serial(&ca.serial_number) == serial {
            return Err(PkiError::user(
                "adding CA to CRL is not allowed; rotate the CA instead",
            ));
        }
    }

    let _guard = backend.revoke_lock().lock().await;

    if let Some(existing) = storage.fetch_revocation(&serial).await? {
        debug!("Certificate {} already revoked", serial);
        return Ok(Some(existing));
    }

    let der = storage.fetch_cert_der(&serial).await?.ok_or_else(|| {
        PkiError::user(format!("certificate with serial {serial} not found"))
    })?;
    let info = CertInfo::from_der(&der).map_err(|e| {
        PkiError::internal(format!("error parsing stored certificate {serial}: {e}"))
    })?;

    let now = Utc::now().timestamp();
    if info.is_expired_at(now) {
        storage.delete_cert(&serial).await?;
        backend.counter().decrement(CountKind::Certificates);
        info!("Certificate {} already expired; removed without revocation", serial);
        return Ok(None);
    }

    let revocation = RevocationInfo::new(der.to_vec(), now);
    storage.store_revocation(&serial, &revocation).await?;
    storage.delete_cert(&serial).await?;
    backend.counter().increment(CountKind::Revoked, &serial);
    backend.counter().decrement(CountKind::Certificates);
    info!("Revoked certificate {}", serial);

    build_crl_locked(backend).await?;
    Ok(Some(revocation))
}

/// Acquires the revoke lock and rebuilds the CRL.
pub async fn build_crl(backend: &Backend) -> Result<usize> {
    let _guard = backend.revoke_lock().lock().await;
    build_crl_locked(backend).await
}

/// Rebuilds and stores the CRL; the caller holds the revoke lock.
///
/// Expired revocations are pruned on the way. Returns the number of
/// entries on the signed list.
pub(crate) async fn build_crl_locked(backend: &Backend) -> Result<usize> {
    let storage = backend.storage();
    let crl_config = storage.fetch_crl_config().await?;
    let now = Utc::now().timestamp();

    let mut revoked_certs = Vec::new();
    if !crl_config.disable {
        for serial in storage.list_revoked().await? {
            let Some(entry) = storage.fetch_revocation(&serial).await? else {
                continue;
            };
            let info = CertInfo::from_der(&entry.certificate_bytes).map_err(|e| {
                PkiError::internal(format!("unable to parse stored revoked certificate {serial}: {e}"))
            })?;
            if info.is_expired_at(now) {
                storage.delete_revocation(&serial).await?;
                backend.counter().decrement(CountKind::Revoked);
                debug!("Dropped expired revocation {}", serial);
                continue;
            }
            let serial_bytes = serial_to_bytes(&serial)
                .ok_or_else(|| PkiError::internal(format!("invalid stored serial {serial}")))?;
            revoked_certs.push(RevokedCertParams {
                serial_number: SerialNumber::from_slice(&serial_bytes),
                revocation_time: offset_time(entry.revocation_time)?,
                reason_code: None,
                invalidity_date: None,
            });
        }
    }

    let signing = storage.fetch_signing_bundle().await?;
    let expiry = crl_config.expiry_duration()?;
    let (issuer, issuer_key) = signing.signer(0)?;
    let this_update = offset_time(now)?;
    let entries = revoked_certs.len();

    let params = CertificateRevocationListParams {
        this_update,
        next_update: this_update + expiry,
        crl_number: SerialNumber::from(crl_number()),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::PreSpecified(signing.info.key_id()),
    };
    let crl = params
        .signed_by(&issuer, &issuer_key)
        .map_err(|e| PkiError::internal(format!("error creating new CRL: {e}")))?;
    storage.put_raw(CRL_KEY, crl.der().to_vec()).await?;

    info!("Rebuilt CRL with {} entries", entries);
    Ok(entries)
}

/// Milliseconds since the epoch, monotonic enough across rebuilds.
fn crl_number() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn offset_time(unix: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| PkiError::internal(format!("invalid timestamp {unix}: {e}")))
}

/// Resolves the serial named by a revoke request: either `serial_number`
/// directly, or the serial of a PEM `certificate` that must match the
/// stored copy. With `private_key`, the key must belong to that certificate.
pub async fn resolve_revocation_target(
    backend: &Backend,
    serial_number: Option<&str>,
    certificate_pem: Option<&str>,
    private_key_pem: Option<&str>,
) -> Result<String> {
    let storage = backend.storage();
    let (serial, cert_der) = match (serial_number, certificate_pem) {
        (Some(_), Some(_)) => {
            return Err(PkiError::user(
                "must provide either the certificate or the serial to revoke; not both",
            ))
        }
        (None, None) => {
            return Err(PkiError::user(
                "must provide either the certificate or the serial to revoke",
            ))
        }
        (Some(serial), None) => (parse_serial(serial)?, None),
        (None, Some(pem)) => {
            let block = pem::parse(pem.trim())
                .map_err(|e| PkiError::user(format!("unable to parse certificate: {e}")))?;
            let info = CertInfo::from_der(block.contents())?;
            (info.serial_number, Some(block.contents().to_vec()))
        }
    };

    let stored = match storage.fetch_cert_der(&serial).await? {
        Some(der) => Some(der.to_vec()),
        None => storage
            .fetch_revocation(&serial)
            .await?
            .map(|r| r.certificate_bytes),
    };

    if let Some(given) = &cert_der {
        match &stored {
            Some(stored) if stored == given => {}
            Some(_) => {
                return Err(PkiError::user(
                    "certificate does not match the stored certificate for this serial",
                ))
            }
            None => {
                return Err(PkiError::user(format!(
                    "certificate with serial {serial} not found"
                )))
            }
        }
    }

    if let Some(key_pem) = private_key_pem {
        let cert_der = cert_der.or(stored).ok_or_else(|| {
            PkiError::user(format!("certificate with serial {serial} not found"))
        })?;
        verify_private_key(&cert_der, key_pem)?;
    }

    Ok(serial)
}

fn verify_private_key(cert_der: &[u8], key_pem: &str) -> Result<()> {
    let info = CertInfo::from_der(cert_der)?;
    let block = pem::parse(key_pem.trim())
        .map_err(|e| PkiError::user(format!("unable to parse private key: {e}")))?;
    let key = PrivateKey::from_pem_block(block.tag(), block.contents())?;
    if key.public_key_der()? != info.spki_der {
        warn!(
            "Revocation with mismatched private key refused for {}",
            info.serial_number
        );
        return Err(PkiError::user(
            "failed to validate that the private key matches the certificate",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_info_json_shape() {
        let info = RevocationInfo::new(vec![0x30, 0x82, 0x01], 1_700_000_000);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["certificate_bytes"], "MIIB");
        assert_eq!(value["revocation_time"], 1_700_000_000);
        assert_eq!(value["revocation_time_utc"], "2023-11-14T22:13:20+00:00");
        let back: RevocationInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_crl_config_defaults() {
        let config: CrlConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.expiry_duration().unwrap(), Duration::from_secs(72 * 3600));
        assert!(!config.disable);
        let bad = CrlConfig {
            expiry: "sometime".to_string(),
            disable: false,
        };
        assert!(bad.expiry_duration().unwrap_err().is_user_error());
    }
}
