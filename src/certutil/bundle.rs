use super::keys::{public_key_info, subject_key_id, KeyType, PrivateKey, PrivateKeyFormat};
use super::serial::format_serial;
use crate::error::{PkiError, Result};
use rcgen::{CertificateParams, KeyIdMethod, KeyPair};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Persisted CA material, all PEM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertBundle {
    pub certificate: String,
    #[serde(default)]
    pub issuing_ca: String,
    #[serde(default)]
    pub ca_chain: Vec<String>,
    #[serde(default)]
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_type: Option<KeyType>,
    #[serde(default)]
    pub serial_number: String,
}

impl CertBundle {
    pub fn to_parsed(&self) -> Result<ParsedCertBundle> {
        let mut pem = String::new();
        if !self.private_key.is_empty() {
            pem.push_str(&self.private_key);
            pem.push('\n');
        }
        pem.push_str(&self.certificate);
        pem.push('\n');
        if !self.issuing_ca.is_empty() && self.issuing_ca != self.certificate {
            pem.push_str(&self.issuing_ca);
            pem.push('\n');
        }
        for link in &self.ca_chain {
            if link != &self.certificate && link != &self.issuing_ca {
                pem.push_str(link);
                pem.push('\n');
            }
        }
        parse_pem_bundle(&pem)
    }
}

/// Fields pulled out of a DER certificate once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    pub serial_number: String,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
    /// `-1` when the CA carries no path length constraint.
    pub max_path_len: i32,
    pub max_path_len_zero: bool,
    pub subject_key_id: Option<Vec<u8>>,
    pub spki_der: Vec<u8>,
    pub key_type: KeyType,
    pub key_bits: u32,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub uris: Vec<String>,
}

impl CertInfo {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::user(format!("unable to parse certificate: {e}")))?;

        let (is_ca, max_path_len, max_path_len_zero) = match cert.basic_constraints() {
            Ok(Some(bc)) if bc.value.ca => match bc.value.path_len_constraint {
                Some(n) => (true, n as i32, n == 0),
                None => (true, -1, false),
            },
            _ => (false, -1, false),
        };

        let mut subject_key_id_ext = None;
        let mut sans = SanLists::default();
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(kid) => {
                    subject_key_id_ext = Some(kid.0.to_vec());
                }
                ParsedExtension::SubjectAlternativeName(san) => {
                    sans.extend(&san.general_names);
                }
                _ => {}
            }
        }

        let spki_der = cert.public_key().raw.to_vec();
        let (key_type, key_bits) = public_key_info(&spki_der)?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Ok(CertInfo {
            serial_number: format_serial(cert.raw_serial()),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca,
            max_path_len,
            max_path_len_zero,
            subject_key_id: subject_key_id_ext,
            spki_der,
            key_type,
            key_bits,
            common_name,
            dns_names: sans.dns_names,
            email_addresses: sans.email_addresses,
            ip_addresses: sans.ip_addresses,
            uris: sans.uris,
        })
    }

    pub fn is_expired_at(&self, unix_now: i64) -> bool {
        self.not_after < unix_now
    }

    /// SKI from the extension, or derived from the key when absent.
    pub fn key_id(&self) -> Vec<u8> {
        self.subject_key_id
            .clone()
            .unwrap_or_else(|| subject_key_id(&self.spki_der))
    }
}

#[derive(Debug, Default)]
struct SanLists {
    dns_names: Vec<String>,
    email_addresses: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    uris: Vec<String>,
}

impl SanLists {
    fn extend(&mut self, names: &[GeneralName<'_>]) {
        for name in names {
            match name {
                GeneralName::DNSName(dns) => self.dns_names.push(dns.to_string()),
                GeneralName::RFC822Name(email) => self.email_addresses.push(email.to_string()),
                GeneralName::URI(uri) => self.uris.push(uri.to_string()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_octets(raw) {
                        self.ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// A certificate with its issuer chain and, optionally, its private key.
#[derive(Debug, Clone)]
pub struct ParsedCertBundle {
    pub certificate_der: Vec<u8>,
    pub info: CertInfo,
    pub issuing_ca_der: Vec<u8>,
    pub ca_chain_der: Vec<Vec<u8>>,
    pub private_key: Option<PrivateKey>,
}

impl ParsedCertBundle {
    pub fn new(certificate_der: Vec<u8>, issuing_ca_der: Vec<u8>) -> Result<Self> {
        let info = CertInfo::from_der(&certificate_der)?;
        Ok(Self {
            certificate_der,
            info,
            issuing_ca_der,
            ca_chain_der: Vec::new(),
            private_key: None,
        })
    }

    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn private_key_type(&self) -> Option<KeyType> {
        self.private_key.as_ref().map(|k| k.key_type())
    }

    pub fn certificate_pem(&self) -> String {
        der_to_pem("CERTIFICATE", &self.certificate_der)
    }

    pub fn issuing_ca_pem(&self) -> String {
        der_to_pem("CERTIFICATE", &self.issuing_ca_der)
    }

    pub fn ca_chain_pem(&self) -> Vec<String> {
        self.ca_chain_der
            .iter()
            .map(|der| der_to_pem("CERTIFICATE", der))
            .collect()
    }

    /// Errors when the private key does not belong to the certificate.
    pub fn verify_key_matches(&self) -> Result<()> {
        if let Some(key) = &self.private_key {
            if key.public_key_der()? != self.info.spki_der {
                return Err(PkiError::user(
                    "public key of the certificate does not match the private key",
                ));
            }
        }
        Ok(())
    }

    pub fn to_cert_bundle(&self) -> Result<CertBundle> {
        let private_key = match &self.private_key {
            Some(key) => key.to_pem(PrivateKeyFormat::Legacy)?,
            None => String::new(),
        };
        Ok(CertBundle {
            certificate: self.certificate_pem(),
            issuing_ca: self.issuing_ca_pem(),
            ca_chain: self.ca_chain_pem(),
            private_key,
            private_key_type: self.private_key_type(),
            serial_number: self.info.serial_number.clone(),
        })
    }

    /// Rebuilds an rcgen issuer from this CA so it can sign children.
    pub fn signer(&self, signature_bits: u32) -> Result<(rcgen::Certificate, KeyPair)> {
        let key = self.private_key.as_ref().ok_or_else(|| {
            PkiError::user("unable to sign: the CA bundle does not contain a private key")
        })?;
        let key_pair = key.key_pair(signature_bits)?;
        let mut params = CertificateParams::from_ca_cert_pem(&self.certificate_pem())?;
        params.key_identifier_method = KeyIdMethod::PreSpecified(self.info.key_id());
        let issuer = params.self_signed(&key_pair)?;
        Ok((issuer, key_pair))
    }
}

/// RFC 7468 armour with `\n` line endings.
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_config(&pem::Pem::new(label, der.to_vec()), config)
}

/// Splits a PEM string into certificate chain and private key.
///
/// A lone certificate is treated as self-signed and becomes its own issuer.
pub fn parse_pem_bundle(pem_bundle: &str) -> Result<ParsedCertBundle> {
    let blocks = pem::parse_many(pem_bundle)
        .map_err(|e| PkiError::user(format!("error parsing PEM bundle: {e}")))?;
    if blocks.is_empty() {
        return Err(PkiError::user("no data found in PEM bundle"));
    }

    let mut certs: Vec<Vec<u8>> = Vec::new();
    let mut private_key = None;
    for block in blocks {
        match block.tag() {
            "CERTIFICATE" | "X509 CERTIFICATE" => certs.push(block.contents().to_vec()),
            "CRL" | "X509 CRL" => {}
            tag => {
                if private_key.is_some() {
                    return Err(PkiError::user("more than one private key given"));
                }
                private_key = Some(PrivateKey::from_pem_block(tag, block.contents())?);
            }
        }
    }

    if certs.is_empty() {
        return Err(PkiError::user("no certificate found in PEM bundle"));
    }

    let certificate_der = certs.remove(0);
    let issuing_ca_der = if certs.is_empty() {
        certificate_der.clone()
    } else {
        certs[0].clone()
    };

    let mut bundle = ParsedCertBundle::new(certificate_der, issuing_ca_der)?;
    bundle.ca_chain_der = certs;
    bundle.private_key = private_key;
    bundle.verify_key_matches()?;
    Ok(bundle)
}

/// A verified certificate signing request.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    pub der: Vec<u8>,
    pub common_name: Option<String>,
    pub spki_der: Vec<u8>,
    pub key_type: KeyType,
    pub key_bits: u32,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub uris: Vec<String>,
}

impl ParsedCsr {
    pub fn pem(&self) -> String {
        der_to_pem("CERTIFICATE REQUEST", &self.der)
    }
}

/// Decodes a PEM CSR and checks its self-signature.
pub fn parse_csr(csr_pem: &str) -> Result<ParsedCsr> {
    let block = pem::parse(csr_pem.trim())
        .map_err(|_| PkiError::user("csr contains no data"))?;
    let der = block.contents().to_vec();
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| PkiError::user(format!("certificate request could not be parsed: {e}")))?;
    csr.verify_signature()
        .map_err(|_| PkiError::user("request signature invalid"))?;

    let info = &csr.certification_request_info;
    let spki_der = info.subject_pki.raw.to_vec();
    let (key_type, key_bits) = public_key_info(&spki_der)?;

    let mut sans = SanLists::default();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                sans.extend(&san.general_names);
            }
        }
    }

    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(ParsedCsr {
        der: der.clone(),
        common_name,
        spki_der,
        key_type,
        key_bits,
        dns_names: sans.dns_names,
        email_addresses: sans.email_addresses,
        ip_addresses: sans.ip_addresses,
        uris: sans.uris,
    })
}
