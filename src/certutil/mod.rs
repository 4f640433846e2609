//! Key and certificate codec: PEM/DER bundles, CSRs, key generation,
//! subject key identifiers and serial handling.

pub mod bundle;
pub mod keys;
pub mod serial;

pub use bundle::{
    der_to_pem, parse_csr, parse_pem_bundle, CertBundle, CertInfo, ParsedCertBundle, ParsedCsr,
};
pub use keys::{
    generate_key, public_key_info, signature_algorithm_for, subject_key_id,
    validate_key_type_length, KeyType, PrivateKey, PrivateKeyFormat,
};
pub use serial::{format_serial, normalize_serial, parse_serial, random_serial, serial_to_bytes};

use crate::error::{PkiError, Result};
use serde::{Deserialize, Serialize};

/// AIA and CRL distribution URLs embedded into issued certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlEntries {
    #[serde(default)]
    pub issuing_certificates: Vec<String>,
    #[serde(default)]
    pub crl_distribution_points: Vec<String>,
    #[serde(default, rename = "ocsp_servers")]
    pub ocsp_servers: Vec<String>,
}

impl UrlEntries {
    pub fn validate(&self) -> Result<()> {
        for url in self
            .issuing_certificates
            .iter()
            .chain(&self.crl_distribution_points)
            .chain(&self.ocsp_servers)
        {
            validate_url(url)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.issuing_certificates.is_empty()
            && self.crl_distribution_points.is_empty()
            && self.ocsp_servers.is_empty()
    }
}

/// Minimal absolute-URL syntax check: `scheme://host[...]`.
pub fn validate_url(url: &str) -> Result<()> {
    let invalid = || PkiError::user(format!("invalid URL: {url}"));
    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let scheme_ok = scheme
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    if !scheme_ok || host.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(())
}
