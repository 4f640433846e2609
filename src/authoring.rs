//! Certificate and CSR authoring on top of rcgen.

use crate::certutil::{
    der_to_pem, generate_key, random_serial, subject_key_id, KeyType, ParsedCertBundle,
    ParsedCsr, PrivateKey, UrlEntries,
};
use crate::creation::{CreationBundle, KeyUsage};
use crate::error::{PkiError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, CrlDistributionPoint,
    CustomExtension, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    OtherNameValue, SanType, SerialNumber,
};
use time::OffsetDateTime;
use tracing::{debug, info};
use yasna::models::ObjectIdentifier;
use yasna::Tag;

const OID_AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const OID_AD_OCSP: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1];
const OID_AD_CA_ISSUERS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 2];
const OID_STREET_ADDRESS: &[u64] = &[2, 5, 4, 9];
const OID_POSTAL_CODE: &[u64] = &[2, 5, 4, 17];
const OID_SUBJECT_SERIAL_NUMBER: &[u64] = &[2, 5, 4, 5];

/// A freshly generated key and the CSR it signed.
#[derive(Debug, Clone)]
pub struct CsrBundle {
    pub csr_pem: String,
    pub csr_der: Vec<u8>,
    pub private_key: PrivateKey,
}

/// Generates a key and a self-signed CA certificate.
pub fn create_self_signed(cb: &CreationBundle<'_>) -> Result<ParsedCertBundle> {
    let key = generate_key(cb.key_type, cb.key_bits)?;
    let key_pair = key.key_pair(cb.signature_bits)?;
    let spki = key.public_key_der()?;

    let mut params = base_params(cb, &spki)?;
    params.is_ca = ca_constraint(cb)?;
    params.key_usages = (KeyUsage::CERT_SIGN | KeyUsage::CRL_SIGN).purposes();
    params.use_authority_key_identifier_extension = false;

    let cert = params.self_signed(&key_pair)?;
    let der = cert.der().to_vec();
    let bundle = ParsedCertBundle::new(der.clone(), der)?.with_private_key(key);
    info!(
        "Created self-signed CA {} with serial {}",
        cb.common_name, bundle.info.serial_number
    );
    Ok(bundle)
}

/// Generates a key and a leaf certificate signed by `cb.signing`.
pub fn create_leaf(cb: &CreationBundle<'_>) -> Result<ParsedCertBundle> {
    let signing = signing_bundle(cb)?;
    let key = generate_key(cb.key_type, cb.key_bits)?;
    let key_pair = key.key_pair(0)?;
    let spki = key.public_key_der()?;

    let mut params = base_params(cb, &spki)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = cb.key_usage.purposes();
    params.extended_key_usages = extended_key_usages(cb);
    params.use_authority_key_identifier_extension = true;

    let (issuer, issuer_key) = signing.signer(cb.signature_bits)?;
    let cert = params.signed_by(&key_pair, &issuer, &issuer_key)?;
    let bundle = issued_bundle(cert.der().to_vec(), signing)?.with_private_key(key);
    debug!("Created leaf certificate {}", bundle.info.serial_number);
    Ok(bundle)
}

/// Generates a key and a CSR carrying the bundle's subject and SANs.
pub fn create_csr(cb: &CreationBundle<'_>) -> Result<CsrBundle> {
    let key = generate_key(cb.key_type, cb.key_bits)?;
    let key_pair = key.key_pair(cb.signature_bits)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(cb);
    params.subject_alt_names = subject_alt_names(cb)?;

    let csr = params.serialize_request(&key_pair)?;
    let csr_der = csr.der().to_vec();
    Ok(CsrBundle {
        csr_pem: der_to_pem("CERTIFICATE REQUEST", &csr_der),
        csr_der,
        private_key: key,
    })
}

/// Signs a verified CSR with `cb.signing`.
pub fn sign_cert(cb: &CreationBundle<'_>, csr: &ParsedCsr) -> Result<ParsedCertBundle> {
    let signing = signing_bundle(cb)?;
    check_csr_key(cb.key_type, cb.key_bits, csr)?;

    if cb.is_ca && signing.info.is_ca && signing.info.max_path_len_zero {
        return Err(PkiError::user(
            "signing certificate has a max path length of zero, and cannot issue further CA certificates",
        ));
    }

    let mut csr_params = CertificateSigningRequestParams::from_pem(&csr.pem())
        .map_err(|e| PkiError::user(format!("unable to use certificate request: {e}")))?;

    if cb.use_csr_values {
        let params = &mut csr_params.params;
        let template = base_params(cb, &csr.spki_der)?;
        params.serial_number = template.serial_number;
        params.not_before = template.not_before;
        params.not_after = template.not_after;
        params.key_identifier_method = template.key_identifier_method;
        params.custom_extensions.extend(template.custom_extensions);
        params.crl_distribution_points = template.crl_distribution_points;
        if params.key_usages.is_empty() && !cb.is_ca {
            params.key_usages = cb.key_usage.purposes();
        }
        if params.extended_key_usages.is_empty() && !cb.is_ca {
            params.extended_key_usages = extended_key_usages(cb);
        }
    } else {
        csr_params.params = base_params(cb, &csr.spki_der)?;
        if !cb.is_ca {
            csr_params.params.key_usages = cb.key_usage.purposes();
            csr_params.params.extended_key_usages = extended_key_usages(cb);
        }
    }

    if cb.is_ca {
        csr_params.params.is_ca = ca_constraint(cb)?;
        csr_params.params.key_usages = (KeyUsage::CERT_SIGN | KeyUsage::CRL_SIGN).purposes();
    } else {
        csr_params.params.is_ca = IsCa::ExplicitNoCa;
    }
    csr_params.params.use_authority_key_identifier_extension = true;

    let (issuer, issuer_key) = signing.signer(cb.signature_bits)?;
    let cert = csr_params.signed_by(&issuer, &issuer_key)?;
    let bundle = issued_bundle(cert.der().to_vec(), signing)?;
    info!(
        "Signed {} certificate {} for {:?}",
        if cb.is_ca { "CA" } else { "leaf" },
        bundle.info.serial_number,
        bundle.info.common_name
    );
    Ok(bundle)
}

fn signing_bundle<'a>(cb: &CreationBundle<'a>) -> Result<&'a ParsedCertBundle> {
    cb.signing
        .ok_or_else(|| PkiError::internal("no signing bundle supplied for a signed certificate"))
}

/// Rejects CSR keys the role does not permit.
fn check_csr_key(role_key_type: KeyType, role_key_bits: u32, csr: &ParsedCsr) -> Result<()> {
    if csr.key_type == KeyType::Rsa && csr.key_bits < 2048 {
        return Err(PkiError::user(
            "RSA keys < 2048 bits are unsafe and not supported",
        ));
    }
    match role_key_type {
        KeyType::Any => Ok(()),
        expected if expected != csr.key_type => Err(PkiError::user(format!(
            "role requires keys of type {expected}"
        ))),
        KeyType::Rsa if csr.key_bits < role_key_bits => Err(PkiError::user(format!(
            "role requires a minimum of a {role_key_bits}-bit key, but CSR's key is {} bits",
            csr.key_bits
        ))),
        KeyType::Ec if role_key_bits != 0 && csr.key_bits != role_key_bits => {
            Err(PkiError::user(format!(
                "role requires a {role_key_bits}-bit ECDSA key, but CSR's key is {} bits",
                csr.key_bits
            )))
        }
        _ => Ok(()),
    }
}

/// Serial, validity, subject, SANs, SKI and distribution URLs.
fn base_params(cb: &CreationBundle<'_>, spki_der: &[u8]) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
    params.not_before = timestamp(cb.not_before)?;
    params.not_after = timestamp(cb.not_after)?;
    params.distinguished_name = distinguished_name(cb);
    params.subject_alt_names = subject_alt_names(cb)?;
    params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(spki_der));

    if !cb.urls.crl_distribution_points.is_empty() {
        params.crl_distribution_points = vec![CrlDistributionPoint {
            uris: cb.urls.crl_distribution_points.clone(),
        }];
    }
    if let Some(aia) = authority_info_access(&cb.urls) {
        params.custom_extensions.push(aia);
    }
    Ok(params)
}

fn timestamp(unix: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| PkiError::internal(format!("invalid certificate time {unix}: {e}")))
}

fn ca_constraint(cb: &CreationBundle<'_>) -> Result<IsCa> {
    if cb.max_path_length < 0 && !cb.max_path_len_zero {
        return Ok(IsCa::Ca(BasicConstraints::Unconstrained));
    }
    let len = u8::try_from(cb.max_path_length.max(0)).map_err(|_| {
        PkiError::user(format!("max_path_length {} is too large", cb.max_path_length))
    })?;
    Ok(IsCa::Ca(BasicConstraints::Constrained(len)))
}

fn distinguished_name(cb: &CreationBundle<'_>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    let subject = &cb.subject;
    let mut push = |ty: DnType, values: &[String]| {
        if let Some(value) = values.iter().find(|v| !v.is_empty()) {
            dn.push(ty, value.as_str());
        }
    };
    push(DnType::CountryName, &subject.country);
    push(DnType::StateOrProvinceName, &subject.province);
    push(DnType::LocalityName, &subject.locality);
    push(DnType::CustomDnType(OID_STREET_ADDRESS.to_vec()), &subject.street_address);
    push(DnType::CustomDnType(OID_POSTAL_CODE.to_vec()), &subject.postal_code);
    push(DnType::OrganizationName, &subject.organization);
    push(DnType::OrganizationalUnitName, &subject.ou);
    push(
        DnType::CustomDnType(OID_SUBJECT_SERIAL_NUMBER.to_vec()),
        std::slice::from_ref(&subject.serial_number),
    );
    if !cb.common_name.is_empty() {
        dn.push(DnType::CommonName, cb.common_name.as_str());
    }
    dn
}

fn subject_alt_names(cb: &CreationBundle<'_>) -> Result<Vec<SanType>> {
    let mut sans = Vec::new();
    for dns in &cb.dns_names {
        let name = dns
            .clone()
            .try_into()
            .map_err(|e| PkiError::user(format!("invalid DNS name {dns}: {e}")))?;
        sans.push(SanType::DnsName(name));
    }
    for email in &cb.email_addresses {
        let name = email
            .clone()
            .try_into()
            .map_err(|e| PkiError::user(format!("invalid email address {email}: {e}")))?;
        sans.push(SanType::Rfc822Name(name));
    }
    for ip in &cb.ip_addresses {
        sans.push(SanType::IpAddress(*ip));
    }
    for uri in &cb.uris {
        let name = uri
            .clone()
            .try_into()
            .map_err(|e| PkiError::user(format!("invalid URI {uri}: {e}")))?;
        sans.push(SanType::URI(name));
    }
    for other in &cb.other_sans {
        sans.push(SanType::OtherName((
            other.oid_arcs()?,
            OtherNameValue::Utf8String(other.value.clone()),
        )));
    }
    Ok(sans)
}

fn extended_key_usages(cb: &CreationBundle<'_>) -> Vec<ExtendedKeyUsagePurpose> {
    let mut usages = cb.ext_key_usage.purposes();
    usages.extend(
        cb.ext_key_usage_oids
            .iter()
            .cloned()
            .map(ExtendedKeyUsagePurpose::Other),
    );
    usages
}

/// Authority Information Access: OCSP responders then CA issuer URLs.
fn authority_info_access(urls: &UrlEntries) -> Option<CustomExtension> {
    if urls.issuing_certificates.is_empty() && urls.ocsp_servers.is_empty() {
        return None;
    }
    let entries = urls
        .ocsp_servers
        .iter()
        .map(|url| (OID_AD_OCSP, url))
        .chain(
            urls.issuing_certificates
                .iter()
                .map(|url| (OID_AD_CA_ISSUERS, url)),
        );
    let content = yasna::construct_der(|writer| {
        writer.write_sequence_of(|writer| {
            for (method, url) in entries {
                writer.next().write_sequence(|writer| {
                    writer.next().write_oid(&ObjectIdentifier::from_slice(method));
                    writer
                        .next()
                        .write_tagged_implicit(Tag::context(6), |writer| {
                            writer.write_ia5_string(url)
                        });
                });
            }
        })
    });
    Some(CustomExtension::from_oid_content(
        OID_AUTHORITY_INFO_ACCESS,
        content,
    ))
}

/// Wraps a freshly signed certificate with its issuer and chain.
fn issued_bundle(der: Vec<u8>, signing: &ParsedCertBundle) -> Result<ParsedCertBundle> {
    let mut bundle = ParsedCertBundle::new(der, signing.certificate_der.clone())?;
    bundle.ca_chain_der.push(signing.certificate_der.clone());
    for link in &signing.ca_chain_der {
        if !bundle.ca_chain_der.contains(link) {
            bundle.ca_chain_der.push(link.clone());
        }
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certutil::{parse_csr, CertInfo};
    use crate::creation::{ExtKeyUsage, SubjectFields};
    use crate::role::OtherSan;
    use std::time::Duration;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn bundle<'a>(common_name: &str, signing: Option<&'a ParsedCertBundle>) -> CreationBundle<'a> {
        let now = chrono::Utc::now().timestamp();
        CreationBundle {
            common_name: common_name.to_string(),
            subject: SubjectFields::default(),
            dns_names: vec![common_name.to_string()],
            email_addresses: Vec::new(),
            ip_addresses: Vec::new(),
            uris: Vec::new(),
            other_sans: Vec::new(),
            is_ca: signing.is_none(),
            key_type: KeyType::Ec,
            key_bits: 256,
            signature_bits: 0,
            signing,
            ttl: Duration::from_secs(3600),
            not_before: now - 30,
            not_after: now + 3600,
            key_usage: KeyUsage::DIGITAL_SIGNATURE | KeyUsage::KEY_AGREEMENT,
            ext_key_usage: ExtKeyUsage::SERVER_AUTH,
            ext_key_usage_oids: Vec::new(),
            use_csr_values: false,
            urls: UrlEntries::default(),
            max_path_length: -1,
            max_path_len_zero: false,
        }
    }

    fn root() -> ParsedCertBundle {
        let mut cb = bundle("root.example.com", None);
        cb.not_after += 86400;
        cb.urls = UrlEntries {
            issuing_certificates: vec!["http://pki.example.com/v1/pki/ca".to_string()],
            crl_distribution_points: vec!["http://pki.example.com/v1/pki/crl".to_string()],
            ocsp_servers: vec!["http://ocsp.example.com".to_string()],
        };
        create_self_signed(&cb).unwrap()
    }

    #[test]
    fn test_self_signed_root() {
        let ca = root();
        assert_eq!(ca.certificate_der, ca.issuing_ca_der);
        assert!(ca.info.is_ca);
        assert_eq!(ca.info.max_path_len, -1);
        ca.verify_key_matches().unwrap();
        assert_eq!(
            ca.info.subject_key_id.clone().unwrap(),
            subject_key_id(&ca.info.spki_der)
        );

        let (_, cert) = X509Certificate::from_der(&ca.certificate_der).unwrap();
        let mut saw_aia = false;
        let mut saw_crl_dp = false;
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    saw_aia = true;
                    assert_eq!(aia.accessdescs.len(), 2);
                }
                ParsedExtension::CRLDistributionPoints(_) => saw_crl_dp = true,
                _ => {}
            }
        }
        assert!(saw_aia && saw_crl_dp);
    }

    #[test]
    fn test_leaf_signed_by_root() {
        let ca = root();
        let mut cb = bundle("www.example.com", Some(&ca));
        cb.email_addresses = vec!["ops@example.com".to_string()];
        cb.ip_addresses = vec!["192.0.2.10".parse().unwrap()];
        cb.other_sans = vec![OtherSan {
            oid: "1.3.6.1.4.1.311.20.2.3".to_string(),
            value: "ops@example.com".to_string(),
        }];
        let leaf = create_leaf(&cb).unwrap();

        assert!(!leaf.info.is_ca);
        assert_eq!(leaf.issuing_ca_der, ca.certificate_der);
        assert_eq!(leaf.ca_chain_der, vec![ca.certificate_der.clone()]);
        assert_eq!(leaf.info.dns_names, vec!["www.example.com"]);
        assert_eq!(leaf.info.email_addresses, vec!["ops@example.com"]);
        leaf.verify_key_matches().unwrap();

        let (_, cert) = X509Certificate::from_der(&leaf.certificate_der).unwrap();
        let (_, issuer) = X509Certificate::from_der(&ca.certificate_der).unwrap();
        cert.verify_signature(Some(issuer.public_key())).unwrap();
        let has_other_name = cert
            .subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::OtherName(..)));
        assert!(has_other_name);
    }

    #[test]
    fn test_csr_then_sign_intermediate() {
        let ca = root();
        let mut csr_cb = bundle("Intermediate CA", None);
        csr_cb.dns_names.clear();
        let csr = create_csr(&csr_cb).unwrap();
        let parsed = parse_csr(&csr.csr_pem).unwrap();
        assert_eq!(parsed.common_name.as_deref(), Some("Intermediate CA"));

        let mut cb = bundle("Intermediate CA", Some(&ca));
        cb.is_ca = true;
        cb.use_csr_values = true;
        cb.max_path_length = 0;
        cb.max_path_len_zero = true;
        let intermediate = sign_cert(&cb, &parsed).unwrap();
        let info = CertInfo::from_der(&intermediate.certificate_der).unwrap();
        assert!(info.is_ca);
        assert!(info.max_path_len_zero);
        assert_eq!(info.spki_der, parsed.spki_der);

        // A zero-path-length CA may not mint further CAs.
        let with_key = intermediate.with_private_key(csr.private_key);
        let grandchild = create_csr(&bundle("Sub CA", None)).unwrap();
        let grandchild = parse_csr(&grandchild.csr_pem).unwrap();
        let mut cb = bundle("Sub CA", Some(&with_key));
        cb.is_ca = true;
        let err = sign_cert(&cb, &grandchild).unwrap_err();
        assert!(err.to_string().contains("max path length of zero"));
    }

    #[test]
    fn test_sign_checks_csr_key_type() {
        let ca = root();
        let csr = create_csr(&bundle("svc.example.com", None)).unwrap();
        let parsed = parse_csr(&csr.csr_pem).unwrap();

        let mut cb = bundle("svc.example.com", Some(&ca));
        cb.key_type = KeyType::Rsa;
        cb.key_bits = 2048;
        let err = sign_cert(&cb, &parsed).unwrap_err();
        assert!(err.is_user_error());

        cb.key_type = KeyType::Any;
        let leaf = sign_cert(&cb, &parsed).unwrap();
        assert_eq!(leaf.info.spki_der, parsed.spki_der);
        assert!(!leaf.info.is_ca);
    }
}
