//! Turns a role, request data and an optional signer into a [`CreationBundle`].

use crate::certutil::{KeyType, ParsedCertBundle, ParsedCsr, UrlEntries};
use crate::error::{PkiError, Result};
use crate::fields::FieldData;
use crate::role::{
    is_hostname, parse_ip_sans, parse_oid, parse_other_sans, serial_number_allowed,
    validate_ip_sans, validate_names, validate_other_sans, validate_uri_sans, OtherSan, RoleEntry,
};
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};
use std::net::IpAddr;
use std::ops::BitOr;
use std::time::Duration;
use tracing::debug;

/// X.509 key usage bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyUsage(u16);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: KeyUsage = KeyUsage(1 << 0);
    pub const CONTENT_COMMITMENT: KeyUsage = KeyUsage(1 << 1);
    pub const KEY_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 2);
    pub const DATA_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 3);
    pub const KEY_AGREEMENT: KeyUsage = KeyUsage(1 << 4);
    pub const CERT_SIGN: KeyUsage = KeyUsage(1 << 5);
    pub const CRL_SIGN: KeyUsage = KeyUsage(1 << 6);
    pub const ENCIPHER_ONLY: KeyUsage = KeyUsage(1 << 7);
    pub const DECIPHER_ONLY: KeyUsage = KeyUsage(1 << 8);

    const PURPOSES: [(KeyUsage, KeyUsagePurpose); 9] = [
        (Self::DIGITAL_SIGNATURE, KeyUsagePurpose::DigitalSignature),
        (Self::CONTENT_COMMITMENT, KeyUsagePurpose::ContentCommitment),
        (Self::KEY_ENCIPHERMENT, KeyUsagePurpose::KeyEncipherment),
        (Self::DATA_ENCIPHERMENT, KeyUsagePurpose::DataEncipherment),
        (Self::KEY_AGREEMENT, KeyUsagePurpose::KeyAgreement),
        (Self::CERT_SIGN, KeyUsagePurpose::KeyCertSign),
        (Self::CRL_SIGN, KeyUsagePurpose::CrlSign),
        (Self::ENCIPHER_ONLY, KeyUsagePurpose::EncipherOnly),
        (Self::DECIPHER_ONLY, KeyUsagePurpose::DecipherOnly),
    ];

    pub fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn purposes(self) -> Vec<KeyUsagePurpose> {
        Self::PURPOSES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, purpose)| purpose.clone())
            .collect()
    }
}

impl BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

/// Accepts the usage names with or without a `KeyUsage` prefix, in any case.
pub fn parse_key_usages(names: &[String]) -> Result<KeyUsage> {
    let mut usage = KeyUsage::default();
    for name in names {
        let normalized = name.trim().to_lowercase();
        let normalized = normalized.strip_prefix("keyusage").unwrap_or(&normalized);
        let bit = match normalized {
            "digitalsignature" => KeyUsage::DIGITAL_SIGNATURE,
            "contentcommitment" | "nonrepudiation" => KeyUsage::CONTENT_COMMITMENT,
            "keyencipherment" => KeyUsage::KEY_ENCIPHERMENT,
            "dataencipherment" => KeyUsage::DATA_ENCIPHERMENT,
            "keyagreement" => KeyUsage::KEY_AGREEMENT,
            "certsign" => KeyUsage::CERT_SIGN,
            "crlsign" => KeyUsage::CRL_SIGN,
            "encipheronly" => KeyUsage::ENCIPHER_ONLY,
            "decipheronly" => KeyUsage::DECIPHER_ONLY,
            "" => continue,
            _ => return Err(PkiError::user(format!("unknown key usage: {name}"))),
        };
        usage = usage | bit;
    }
    Ok(usage)
}

/// Extended key usage bits, from the role's flags and `ext_key_usage` names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtKeyUsage(u16);

impl ExtKeyUsage {
    pub const SERVER_AUTH: ExtKeyUsage = ExtKeyUsage(1 << 0);
    pub const CLIENT_AUTH: ExtKeyUsage = ExtKeyUsage(1 << 1);
    pub const CODE_SIGNING: ExtKeyUsage = ExtKeyUsage(1 << 2);
    pub const EMAIL_PROTECTION: ExtKeyUsage = ExtKeyUsage(1 << 3);
    pub const ANY: ExtKeyUsage = ExtKeyUsage(1 << 4);
    pub const TIME_STAMPING: ExtKeyUsage = ExtKeyUsage(1 << 5);
    pub const OCSP_SIGNING: ExtKeyUsage = ExtKeyUsage(1 << 6);
    pub const IPSEC_END_SYSTEM: ExtKeyUsage = ExtKeyUsage(1 << 7);
    pub const IPSEC_TUNNEL: ExtKeyUsage = ExtKeyUsage(1 << 8);
    pub const IPSEC_USER: ExtKeyUsage = ExtKeyUsage(1 << 9);
    pub const MICROSOFT_SGC: ExtKeyUsage = ExtKeyUsage(1 << 10);
    pub const NETSCAPE_SGC: ExtKeyUsage = ExtKeyUsage(1 << 11);

    pub fn contains(self, other: ExtKeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn purposes(self) -> Vec<ExtendedKeyUsagePurpose> {
        let table: [(ExtKeyUsage, ExtendedKeyUsagePurpose); 12] = [
            (Self::ANY, ExtendedKeyUsagePurpose::Any),
            (Self::SERVER_AUTH, ExtendedKeyUsagePurpose::ServerAuth),
            (Self::CLIENT_AUTH, ExtendedKeyUsagePurpose::ClientAuth),
            (Self::CODE_SIGNING, ExtendedKeyUsagePurpose::CodeSigning),
            (Self::EMAIL_PROTECTION, ExtendedKeyUsagePurpose::EmailProtection),
            (Self::TIME_STAMPING, ExtendedKeyUsagePurpose::TimeStamping),
            (Self::OCSP_SIGNING, ExtendedKeyUsagePurpose::OcspSigning),
            (
                Self::IPSEC_END_SYSTEM,
                ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 5]),
            ),
            (
                Self::IPSEC_TUNNEL,
                ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 6]),
            ),
            (
                Self::IPSEC_USER,
                ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 7]),
            ),
            (
                Self::MICROSOFT_SGC,
                ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 4, 1, 311, 10, 3, 3]),
            ),
            (
                Self::NETSCAPE_SGC,
                ExtendedKeyUsagePurpose::Other(vec![2, 16, 840, 1, 113730, 4, 1]),
            ),
        ];
        table
            .into_iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, purpose)| purpose)
            .collect()
    }
}

impl BitOr for ExtKeyUsage {
    type Output = ExtKeyUsage;

    fn bitor(self, rhs: ExtKeyUsage) -> ExtKeyUsage {
        ExtKeyUsage(self.0 | rhs.0)
    }
}

pub fn parse_ext_key_usages(names: &[String]) -> Result<ExtKeyUsage> {
    let mut usage = ExtKeyUsage::default();
    for name in names {
        let normalized = name.trim().to_lowercase();
        let normalized = normalized.strip_prefix("extkeyusage").unwrap_or(&normalized);
        let bit = match normalized {
            "any" => ExtKeyUsage::ANY,
            "serverauth" => ExtKeyUsage::SERVER_AUTH,
            "clientauth" => ExtKeyUsage::CLIENT_AUTH,
            "codesigning" => ExtKeyUsage::CODE_SIGNING,
            "emailprotection" => ExtKeyUsage::EMAIL_PROTECTION,
            "timestamping" => ExtKeyUsage::TIME_STAMPING,
            "ocspsigning" => ExtKeyUsage::OCSP_SIGNING,
            "ipsecendsystem" => ExtKeyUsage::IPSEC_END_SYSTEM,
            "ipsectunnel" => ExtKeyUsage::IPSEC_TUNNEL,
            "ipsecuser" => ExtKeyUsage::IPSEC_USER,
            "microsoftservergatedcrypto" => ExtKeyUsage::MICROSOFT_SGC,
            "netscapeservergatedcrypto" => ExtKeyUsage::NETSCAPE_SGC,
            "" => continue,
            _ => return Err(PkiError::user(format!("unknown extended key usage: {name}"))),
        };
        usage = usage | bit;
    }
    Ok(usage)
}

/// Subject attributes beyond the common name. Only the first value of
/// each list is encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectFields {
    pub ou: Vec<String>,
    pub organization: Vec<String>,
    pub country: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
    pub serial_number: String,
}

/// Host-supplied defaults for requests that don't carry their own TTL.
#[derive(Debug, Clone)]
pub struct SystemView {
    pub default_lease_ttl: Duration,
    pub max_lease_ttl: Duration,
    /// Display name of the calling token, used by `allow_token_displayname`.
    pub display_name: String,
}

impl Default for SystemView {
    fn default() -> Self {
        Self {
            default_lease_ttl: Duration::from_secs(768 * 3600),
            max_lease_ttl: Duration::from_secs(768 * 3600),
            display_name: String::new(),
        }
    }
}

/// Everything needed to author one certificate or CSR.
#[derive(Debug, Clone)]
pub struct CreationBundle<'a> {
    pub common_name: String,
    pub subject: SubjectFields,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub uris: Vec<String>,
    pub other_sans: Vec<OtherSan>,
    pub is_ca: bool,
    pub key_type: KeyType,
    pub key_bits: u32,
    pub signature_bits: u32,
    /// `None` for self-signed roots and CSRs.
    pub signing: Option<&'a ParsedCertBundle>,
    pub ttl: Duration,
    pub not_before: i64,
    pub not_after: i64,
    pub key_usage: KeyUsage,
    pub ext_key_usage: ExtKeyUsage,
    pub ext_key_usage_oids: Vec<Vec<u64>>,
    pub use_csr_values: bool,
    pub urls: UrlEntries,
    /// `-1` means unconstrained.
    pub max_path_length: i32,
    pub max_path_len_zero: bool,
}

/// Inputs to [`build_creation_bundle`].
pub struct CreationInput<'a> {
    pub role: &'a RoleEntry,
    pub signing: Option<&'a ParsedCertBundle>,
    pub csr: Option<&'a ParsedCsr>,
    pub data: &'a FieldData,
    pub urls: &'a UrlEntries,
    pub system: &'a SystemView,
    pub is_ca: bool,
    pub use_csr_values: bool,
}

pub const NOT_BEFORE_SKEW_SECS: i64 = 30;

pub fn build_creation_bundle<'a>(input: CreationInput<'a>) -> Result<CreationBundle<'a>> {
    let CreationInput {
        role,
        signing,
        csr,
        data,
        urls,
        system,
        is_ca,
        use_csr_values,
    } = input;

    // Common name.
    let mut common_name = String::new();
    if let (Some(csr), true) = (csr, role.use_csr_common_name) {
        common_name = csr.common_name.clone().unwrap_or_default();
    }
    if common_name.is_empty() {
        common_name = data.string_or("common_name", "")?;
        if common_name.is_empty() && role.require_cn {
            return Err(PkiError::user(
                "the common_name field is required, or must be provided in a CSR with \"use_csr_common_name\" set to true, unless \"require_cn\" is set to false",
            ));
        }
    }

    let subject_serial = data.string_or("serial_number", "")?;
    if !subject_serial.is_empty() && !serial_number_allowed(role, &subject_serial) {
        return Err(PkiError::user(format!(
            "serial_number {subject_serial} not allowed by this role"
        )));
    }

    // DNS names and emails.
    let use_csr_sans = csr.is_some() && role.use_csr_sans;
    let mut dns_names = Vec::new();
    let mut email_addresses = Vec::new();
    if let (Some(csr), true) = (csr, use_csr_sans) {
        dns_names.extend(csr.dns_names.iter().cloned());
        email_addresses.extend(csr.email_addresses.iter().cloned());
    }

    let exclude_cn = data.bool_or("exclude_cn_from_sans", false)?;
    if !common_name.is_empty() && !exclude_cn {
        route_name(&common_name, &mut dns_names, &mut email_addresses);
    }
    if !use_csr_sans {
        for name in data.string_list_or_empty("alt_names")? {
            route_name(&name, &mut dns_names, &mut email_addresses);
        }
    }
    dedup(&mut dns_names);
    dedup(&mut email_addresses);

    let display_name = system.display_name.as_str();
    if !common_name.is_empty() {
        let bad = validate_names(display_name, std::slice::from_ref(&common_name), role);
        if !bad.is_empty() {
            return Err(PkiError::user(format!(
                "common name {bad} not allowed by this role"
            )));
        }
    }
    let bad = validate_names(display_name, &dns_names, role);
    if !bad.is_empty() {
        return Err(PkiError::user(format!(
            "subject alternate name {bad} not allowed by this role"
        )));
    }
    let bad = validate_names(display_name, &email_addresses, role);
    if !bad.is_empty() {
        return Err(PkiError::user(format!(
            "email address {bad} not allowed by this role"
        )));
    }

    // IP, URI and other SANs.
    let ip_addresses = match (csr, use_csr_sans) {
        (Some(csr), true) => csr.ip_addresses.clone(),
        _ => parse_ip_sans(&data.string_list_or_empty("ip_sans")?)?,
    };
    validate_ip_sans(role, &ip_addresses)?;

    let uris = match (csr, use_csr_sans) {
        (Some(csr), true) => csr.uris.clone(),
        _ => data.string_list_or_empty("uri_sans")?,
    };
    validate_uri_sans(role, &uris)?;

    let other_sans = parse_other_sans(&data.string_list_or_empty("other_sans")?)?;
    validate_other_sans(role, &other_sans)?;

    // Validity window.
    let now = Utc::now().timestamp();
    let (ttl, not_after) = resolve_validity(role, data, system, now)?;
    if let Some(signer) = signing {
        if not_after > signer.info.not_after {
            return Err(PkiError::user(format!(
                "cannot satisfy request, as TTL would result in notAfter of {} that is beyond the expiration of the CA certificate at {}",
                rfc3339(not_after),
                rfc3339(signer.info.not_after)
            )));
        }
    }

    // Usages.
    let key_usage = parse_key_usages(&role.key_usage)?;
    let mut ext_key_usage = parse_ext_key_usages(&role.ext_key_usage)?;
    if role.server_flag {
        ext_key_usage = ext_key_usage | ExtKeyUsage::SERVER_AUTH;
    }
    if role.client_flag {
        ext_key_usage = ext_key_usage | ExtKeyUsage::CLIENT_AUTH;
    }
    if role.code_signing_flag {
        ext_key_usage = ext_key_usage | ExtKeyUsage::CODE_SIGNING;
    }
    if role.email_protection_flag {
        ext_key_usage = ext_key_usage | ExtKeyUsage::EMAIL_PROTECTION;
    }
    let ext_key_usage_oids = role
        .ext_key_usage_oids
        .iter()
        .map(|oid| parse_oid(oid))
        .collect::<Result<Vec<_>>>()?;

    // Path length.
    let (max_path_length, max_path_len_zero) = match (role.max_path_length, signing) {
        (Some(len), _) => (len, len == 0),
        (None, Some(signer)) if is_ca => inherit_path_length(signer),
        _ => (-1, false),
    };

    debug!(
        "Built creation bundle for {:?} (ttl {}s, is_ca {})",
        common_name,
        ttl.as_secs(),
        is_ca
    );

    Ok(CreationBundle {
        common_name,
        subject: SubjectFields {
            ou: role.ou.clone(),
            organization: role.organization.clone(),
            country: role.country.clone(),
            locality: role.locality.clone(),
            province: role.province.clone(),
            street_address: role.street_address.clone(),
            postal_code: role.postal_code.clone(),
            serial_number: subject_serial,
        },
        dns_names,
        email_addresses,
        ip_addresses,
        uris,
        other_sans,
        is_ca,
        key_type: role.key_type,
        key_bits: role.key_bits,
        signature_bits: role.signature_bits,
        signing,
        ttl,
        not_before: now - NOT_BEFORE_SKEW_SECS,
        not_after,
        key_usage,
        ext_key_usage,
        ext_key_usage_oids,
        use_csr_values,
        urls: urls.clone(),
        max_path_length,
        max_path_len_zero,
    })
}

/// Emails go to the email list, hostnames (wildcards included) to DNS.
fn route_name(name: &str, dns_names: &mut Vec<String>, emails: &mut Vec<String>) {
    if name.contains('@') {
        emails.push(name.to_string());
    } else if is_hostname(name.strip_prefix("*.").unwrap_or(name)) {
        dns_names.push(name.to_string());
    }
}

fn dedup(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|item| seen.insert(item.clone()));
}

/// Resolves `(ttl, not_after)` from the request, the role and the system.
fn resolve_validity(
    role: &RoleEntry,
    data: &FieldData,
    system: &SystemView,
    now: i64,
) -> Result<(Duration, i64)> {
    let requested_ttl = data.duration("ttl")?.filter(|d| !d.is_zero());
    let requested_not_after = data.string("not_after")?.filter(|s| !s.is_empty());

    if let Some(raw) = requested_not_after {
        if requested_ttl.is_some() {
            return Err(PkiError::user(
                "Either ttl or not_after should be provided. Both should not be provided in the same request.",
            ));
        }
        let not_after = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| PkiError::user(format!("invalid not_after {raw:?}: {e}")))?
            .timestamp();
        if not_after <= now {
            return Err(PkiError::user(format!(
                "not_after {raw} is in the past"
            )));
        }
        let ttl = Duration::from_secs(u64::try_from(not_after - now).unwrap_or(0));
        return Ok((ttl, not_after));
    }

    let max_ttl = if role.max_ttl.is_zero() {
        system.max_lease_ttl
    } else {
        role.max_ttl
    };

    let ttl = match requested_ttl {
        Some(ttl) => {
            if ttl > max_ttl {
                return Err(PkiError::user(format!(
                    "ttl is larger than maximum allowed ({})",
                    max_ttl.as_secs()
                )));
            }
            ttl
        }
        None => {
            let fallback = if role.ttl.is_zero() {
                system.default_lease_ttl
            } else {
                role.ttl
            };
            fallback.min(max_ttl)
        }
    };

    let secs = i64::try_from(ttl.as_secs())
        .map_err(|_| PkiError::user("ttl is too large"))?;
    Ok((ttl, now.saturating_add(secs)))
}

/// Path length for a CA signed by `signer` when the role doesn't pin one.
pub fn inherit_path_length(signer: &ParsedCertBundle) -> (i32, bool) {
    let info = &signer.info;
    if info.max_path_len < 0 {
        (-1, false)
    } else if info.max_path_len == 0 && info.max_path_len_zero {
        (0, true)
    } else {
        let next = info.max_path_len - 1;
        (next, next == 0)
    }
}

pub fn rfc3339(unix: i64) -> String {
    Utc.timestamp_opt(unix, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| unix.to_string())
}
