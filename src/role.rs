//! Role policies and the name admission checks that enforce them.

use crate::certutil::{validate_key_type_length, KeyType};
use crate::creation::{parse_ext_key_usages, parse_key_usages};
use crate::error::{PkiError, Result};
use crate::fields::{duration_secs, Field, FieldData, FieldType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

pub const ROLE_FIELDS: &[Field] = &[
    Field::new("ttl", FieldType::Duration),
    Field::new("max_ttl", FieldType::Duration),
    Field::new("allow_localhost", FieldType::Bool),
    Field::new("allowed_base_domain", FieldType::String),
    Field::new("allowed_domains", FieldType::CommaStringSlice),
    Field::new("allow_bare_domains", FieldType::Bool),
    Field::new("allow_subdomains", FieldType::Bool),
    Field::new("allow_wildcard_certificates", FieldType::Bool),
    Field::new("allow_token_displayname", FieldType::Bool),
    Field::new("allow_any_name", FieldType::Bool),
    Field::new("enforce_hostnames", FieldType::Bool),
    Field::new("allow_ip_sans", FieldType::Bool),
    Field::new("allowed_uri_sans", FieldType::CommaStringSlice),
    Field::new("allowed_other_sans", FieldType::CommaStringSlice),
    Field::new("allowed_serial_numbers", FieldType::CommaStringSlice),
    Field::new("server_flag", FieldType::Bool),
    Field::new("client_flag", FieldType::Bool),
    Field::new("code_signing_flag", FieldType::Bool),
    Field::new("email_protection_flag", FieldType::Bool),
    Field::new("key_type", FieldType::String),
    Field::new("key_bits", FieldType::Int),
    Field::new("signature_bits", FieldType::Int),
    Field::new("key_usage", FieldType::CommaStringSlice),
    Field::new("ext_key_usage", FieldType::CommaStringSlice),
    Field::new("ext_key_usage_oids", FieldType::CommaStringSlice),
    Field::new("ou", FieldType::CommaStringSlice),
    Field::new("organization", FieldType::CommaStringSlice),
    Field::new("country", FieldType::CommaStringSlice),
    Field::new("locality", FieldType::CommaStringSlice),
    Field::new("province", FieldType::CommaStringSlice),
    Field::new("street_address", FieldType::CommaStringSlice),
    Field::new("postal_code", FieldType::CommaStringSlice),
    Field::new("use_csr_common_name", FieldType::Bool),
    Field::new("use_csr_sans", FieldType::Bool),
    Field::new("require_cn", FieldType::Bool),
    Field::new("generate_lease", FieldType::Bool),
    Field::new("no_store", FieldType::Bool),
    Field::new("max_path_length", FieldType::Int),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleEntry {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    #[serde(with = "duration_secs")]
    pub max_ttl: Duration,
    pub allow_localhost: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub allowed_base_domain: String,
    pub allowed_domains: Vec<String>,
    pub allow_bare_domains: bool,
    pub allow_subdomains: bool,
    pub allow_wildcard_certificates: bool,
    pub allow_token_displayname: bool,
    pub allow_any_name: bool,
    pub enforce_hostnames: bool,
    pub allow_ip_sans: bool,
    pub allowed_uri_sans: Vec<String>,
    pub allowed_other_sans: Vec<String>,
    pub allowed_serial_numbers: Vec<String>,
    pub server_flag: bool,
    pub client_flag: bool,
    pub code_signing_flag: bool,
    pub email_protection_flag: bool,
    pub key_type: KeyType,
    pub key_bits: u32,
    pub signature_bits: u32,
    pub key_usage: Vec<String>,
    pub ext_key_usage: Vec<String>,
    pub ext_key_usage_oids: Vec<String>,
    pub ou: Vec<String>,
    pub organization: Vec<String>,
    pub country: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
    pub use_csr_common_name: bool,
    pub use_csr_sans: bool,
    pub require_cn: bool,
    pub generate_lease: bool,
    pub no_store: bool,
    /// `None` inherits from the signing CA.
    pub max_path_length: Option<i32>,
}

impl Default for RoleEntry {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
            allow_localhost: true,
            allowed_base_domain: String::new(),
            allowed_domains: Vec::new(),
            allow_bare_domains: false,
            allow_subdomains: false,
            allow_wildcard_certificates: true,
            allow_token_displayname: false,
            allow_any_name: false,
            enforce_hostnames: true,
            allow_ip_sans: true,
            allowed_uri_sans: Vec::new(),
            allowed_other_sans: Vec::new(),
            allowed_serial_numbers: Vec::new(),
            server_flag: true,
            client_flag: true,
            code_signing_flag: false,
            email_protection_flag: false,
            key_type: KeyType::Rsa,
            key_bits: 0,
            signature_bits: 0,
            key_usage: vec![
                "DigitalSignature".to_string(),
                "KeyAgreement".to_string(),
                "KeyEncipherment".to_string(),
            ],
            ext_key_usage: Vec::new(),
            ext_key_usage_oids: Vec::new(),
            ou: Vec::new(),
            organization: Vec::new(),
            country: Vec::new(),
            locality: Vec::new(),
            province: Vec::new(),
            street_address: Vec::new(),
            postal_code: Vec::new(),
            use_csr_common_name: true,
            use_csr_sans: true,
            require_cn: true,
            generate_lease: false,
            no_store: false,
            max_path_length: None,
        }
    }
}

impl RoleEntry {
    /// Builds a role from write data; absent fields take their defaults.
    pub fn from_field_data(data: &FieldData) -> Result<Self> {
        let mut role = RoleEntry::default();

        if let Some(v) = data.duration("ttl")? {
            role.ttl = v;
        }
        if let Some(v) = data.duration("max_ttl")? {
            role.max_ttl = v;
        }
        macro_rules! set_bool {
            ($($name:ident),*) => {
                $(if let Some(v) = data.bool(stringify!($name))? { role.$name = v; })*
            };
        }
        set_bool!(
            allow_localhost,
            allow_bare_domains,
            allow_subdomains,
            allow_wildcard_certificates,
            allow_token_displayname,
            allow_any_name,
            enforce_hostnames,
            allow_ip_sans,
            server_flag,
            client_flag,
            code_signing_flag,
            email_protection_flag,
            use_csr_common_name,
            use_csr_sans,
            require_cn,
            generate_lease,
            no_store
        );
        macro_rules! set_list {
            ($($name:ident),*) => {
                $(if let Some(v) = data.string_list(stringify!($name))? { role.$name = v; })*
            };
        }
        set_list!(
            allowed_domains,
            allowed_uri_sans,
            allowed_other_sans,
            allowed_serial_numbers,
            key_usage,
            ext_key_usage,
            ext_key_usage_oids,
            ou,
            organization,
            country,
            locality,
            province,
            street_address,
            postal_code
        );
        if let Some(base) = data.string("allowed_base_domain")? {
            role.allowed_base_domain = base;
        }
        if let Some(kt) = data.string("key_type")? {
            role.key_type = kt.parse()?;
        }
        if let Some(bits) = data.int("key_bits")? {
            role.key_bits = u32::try_from(bits)
                .map_err(|_| PkiError::user(format!("invalid key_bits: {bits}")))?;
        }
        if let Some(bits) = data.int("signature_bits")? {
            role.signature_bits = u32::try_from(bits)
                .map_err(|_| PkiError::user(format!("invalid signature_bits: {bits}")))?;
        }
        if let Some(len) = data.int("max_path_length")? {
            role.max_path_length = Some(
                i32::try_from(len)
                    .map_err(|_| PkiError::user(format!("invalid max_path_length: {len}")))?,
            );
        }

        role.upgrade_legacy_fields();
        role.validate()?;
        Ok(role)
    }

    /// Checks cross-field constraints and resolves defaulted key bits.
    pub fn validate(&mut self) -> Result<()> {
        if self.key_type != KeyType::Any {
            self.key_bits = validate_key_type_length(self.key_type, self.key_bits)?;
        }
        if !matches!(self.signature_bits, 0 | 256 | 384 | 512) {
            return Err(PkiError::user(format!(
                "unsupported signature_bits: {}",
                self.signature_bits
            )));
        }
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(PkiError::user(
                "\"ttl\" value must be less than \"max_ttl\" value",
            ));
        }
        parse_key_usages(&self.key_usage)?;
        parse_ext_key_usages(&self.ext_key_usage)?;
        for oid in &self.ext_key_usage_oids {
            parse_oid(oid)?;
        }
        if !(self.allowed_other_sans.len() == 1 && self.allowed_other_sans[0] == "*") {
            parse_other_sans(&self.allowed_other_sans)
                .map_err(|e| e.context("unable to parse allowed_other_sans"))?;
        }
        Ok(())
    }

    /// Folds the single-domain legacy field into `allowed_domains`.
    pub fn upgrade_legacy_fields(&mut self) {
        if !self.allowed_base_domain.is_empty() {
            let base = std::mem::take(&mut self.allowed_base_domain);
            if !self.allowed_domains.contains(&base) {
                self.allowed_domains.push(base);
            }
        }
    }

    pub fn to_response(&self) -> Value {
        json!({
            "ttl": self.ttl.as_secs(),
            "max_ttl": self.max_ttl.as_secs(),
            "allow_localhost": self.allow_localhost,
            "allowed_domains": self.allowed_domains,
            "allow_bare_domains": self.allow_bare_domains,
            "allow_subdomains": self.allow_subdomains,
            "allow_wildcard_certificates": self.allow_wildcard_certificates,
            "allow_token_displayname": self.allow_token_displayname,
            "allow_any_name": self.allow_any_name,
            "enforce_hostnames": self.enforce_hostnames,
            "allow_ip_sans": self.allow_ip_sans,
            "allowed_uri_sans": self.allowed_uri_sans,
            "allowed_other_sans": self.allowed_other_sans,
            "allowed_serial_numbers": self.allowed_serial_numbers,
            "server_flag": self.server_flag,
            "client_flag": self.client_flag,
            "code_signing_flag": self.code_signing_flag,
            "email_protection_flag": self.email_protection_flag,
            "key_type": self.key_type,
            "key_bits": self.key_bits,
            "signature_bits": self.signature_bits,
            "key_usage": self.key_usage,
            "ext_key_usage": self.ext_key_usage,
            "ext_key_usage_oids": self.ext_key_usage_oids,
            "ou": self.ou,
            "organization": self.organization,
            "country": self.country,
            "locality": self.locality,
            "province": self.province,
            "street_address": self.street_address,
            "postal_code": self.postal_code,
            "use_csr_common_name": self.use_csr_common_name,
            "use_csr_sans": self.use_csr_sans,
            "require_cn": self.require_cn,
            "generate_lease": self.generate_lease,
            "no_store": self.no_store,
            "max_path_length": self.max_path_length,
        })
    }

    /// Permissive role used for CA generation and intermediate signing.
    pub fn permissive_ca_role() -> Self {
        RoleEntry {
            allow_localhost: true,
            allow_any_name: true,
            allow_ip_sans: true,
            enforce_hostnames: false,
            allowed_uri_sans: vec!["*".to_string()],
            allowed_other_sans: vec!["*".to_string()],
            allowed_serial_numbers: vec!["*".to_string()],
            key_type: KeyType::Any,
            use_csr_common_name: true,
            use_csr_sans: true,
            ..RoleEntry::default()
        }
    }
}

fn hostname_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"^([A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?\.)*[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?$",
        )
        .unwrap_or_else(|e| panic!("hostname pattern is a constant: {e}"))
    })
}

pub fn is_hostname(name: &str) -> bool {
    hostname_regex().is_match(name)
}

/// Role names are a single storage segment: ASCII alphanumerics plus
/// `-`, `_`, `.`, `:` and `@`, never `.` or `..` on their own.
pub fn validate_role_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PkiError::user("missing role name"));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'));
    if !valid_chars || name == "." || name == ".." {
        return Err(PkiError::user(format!("invalid role name: {name:?}")));
    }
    Ok(())
}

/// Returns the first name the role rejects, or an empty string when all pass.
pub fn validate_names(display_name: &str, names: &[String], role: &RoleEntry) -> String {
    for name in names {
        if !name_allowed(display_name, name, role) {
            return name.clone();
        }
    }
    String::new()
}

fn name_allowed(display_name: &str, name: &str, role: &RoleEntry) -> bool {
    let mut reduced = name;
    let mut email_domain = name;
    let mut is_email = false;
    let mut is_wildcard = false;

    if name.contains('@') {
        let Some((user, domain)) = name.split_once('@') else {
            return false;
        };
        if user.is_empty() || domain.is_empty() || domain.contains('@') {
            return false;
        }
        reduced = domain;
        email_domain = domain;
        is_email = true;
    }

    if let Some(base) = reduced.strip_prefix("*.") {
        if is_email || !role.allow_wildcard_certificates {
            return false;
        }
        reduced = base;
        is_wildcard = true;
    }

    if role.enforce_hostnames && !is_hostname(reduced) {
        return false;
    }

    if role.allow_any_name {
        return true;
    }

    if role.allow_localhost {
        if reduced == "localhost"
            || reduced == "localdomain"
            || (is_email && (email_domain == "localhost" || email_domain == "localdomain"))
        {
            return true;
        }
        if role.allow_subdomains
            && (reduced.ends_with(".localhost")
                || reduced.ends_with(".localdomain")
                || (is_wildcard && (reduced == "localhost" || reduced == "localdomain")))
        {
            return true;
        }
    }

    if role.allow_token_displayname && !display_name.is_empty() {
        if name == display_name {
            return true;
        }
        if role.allow_subdomains {
            if is_email {
                if let Some((_, display_domain)) = display_name.split_once('@') {
                    if !display_domain.contains('@')
                        && reduced.ends_with(&format!(".{display_domain}"))
                    {
                        return true;
                    }
                }
            }
            if reduced.ends_with(&format!(".{display_name}"))
                || (is_wildcard && reduced == display_name)
            {
                return true;
            }
        }
    }

    for domain in role.allowed_domains.iter().filter(|d| !d.is_empty()) {
        if role.allow_bare_domains
            && (name.eq_ignore_ascii_case(domain)
                || (is_email && email_domain.eq_ignore_ascii_case(domain)))
        {
            return true;
        }
        if role.allow_subdomains
            && (reduced.ends_with(&format!(".{domain}"))
                || (is_wildcard && reduced.eq_ignore_ascii_case(domain)))
        {
            return true;
        }
    }

    false
}

/// `*` matches any run of characters, including none.
pub fn glob_match(pattern: &str, subject: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == subject;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !subject.starts_with(first) || subject.len() < first.len() + last.len() {
        return false;
    }
    let mut rest = &subject[first.len()..subject.len() - last.len()];
    if !subject.ends_with(last) {
        return false;
    }
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    true
}

pub fn validate_ip_sans(role: &RoleEntry, ips: &[IpAddr]) -> Result<()> {
    if let Some(ip) = ips.first() {
        if !role.allow_ip_sans {
            return Err(PkiError::user(format!(
                "IP Subject Alternative Names are not allowed in this role, but was provided {ip}"
            )));
        }
    }
    Ok(())
}

pub fn parse_ip_sans(raw: &[String]) -> Result<Vec<IpAddr>> {
    raw.iter()
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| PkiError::user(format!("the value {s:?} is not a valid IP address")))
        })
        .collect()
}

pub fn validate_uri_sans(role: &RoleEntry, uris: &[String]) -> Result<()> {
    if uris.is_empty() {
        return Ok(());
    }
    if role.allowed_uri_sans.is_empty() {
        return Err(PkiError::user(
            "URI Subject Alternative Names are not allowed in this role, but were provided via the API",
        ));
    }
    for uri in uris {
        crate::certutil::validate_url(uri)
            .map_err(|_| PkiError::user(format!("invalid URI Subject Alternative Name: {uri}")))?;
        if !role.allowed_uri_sans.iter().any(|allowed| glob_match(allowed, uri)) {
            return Err(PkiError::user(format!(
                "URI Subject Alternative Name {uri} not allowed by this role"
            )));
        }
    }
    Ok(())
}

/// An `otherName` SAN carried as a UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherSan {
    pub oid: String,
    pub value: String,
}

impl OtherSan {
    pub fn oid_arcs(&self) -> Result<Vec<u64>> {
        parse_oid(&self.oid)
    }
}

pub fn parse_oid(oid: &str) -> Result<Vec<u64>> {
    let arcs: std::result::Result<Vec<u64>, _> = oid.split('.').map(str::parse).collect();
    match arcs {
        Ok(arcs) if arcs.len() >= 2 => Ok(arcs),
        _ => Err(PkiError::user(format!("invalid object identifier: {oid}"))),
    }
}

/// Parses `<oid>;UTF8:<value>` entries.
pub fn parse_other_sans(entries: &[String]) -> Result<Vec<OtherSan>> {
    entries
        .iter()
        .map(|entry| {
            let (oid, rest) = entry
                .split_once(';')
                .ok_or_else(|| PkiError::user(format!("invalid other SAN: {entry}")))?;
            let (kind, value) = rest
                .split_once(':')
                .ok_or_else(|| PkiError::user(format!("invalid other SAN: {entry}")))?;
            if !matches!(kind.to_uppercase().as_str(), "UTF8" | "UTF-8") {
                return Err(PkiError::user(format!(
                    "only UTF8 other SANs are supported, got {kind} in {entry}"
                )));
            }
            parse_oid(oid)?;
            Ok(OtherSan {
                oid: oid.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

pub fn validate_other_sans(role: &RoleEntry, requested: &[OtherSan]) -> Result<()> {
    if requested.is_empty() {
        return Ok(());
    }
    if role.allowed_other_sans.len() == 1 && role.allowed_other_sans[0] == "*" {
        return Ok(());
    }
    let allowed = parse_other_sans(&role.allowed_other_sans)?;
    for san in requested {
        let ok = allowed
            .iter()
            .any(|a| a.oid == san.oid && glob_match(&a.value, &san.value));
        if !ok {
            return Err(PkiError::user(format!(
                "other SAN {};UTF8:{} not allowed by this role",
                san.oid, san.value
            )));
        }
    }
    Ok(())
}

/// Whether a requested subject `serialNumber` is permitted.
pub fn serial_number_allowed(role: &RoleEntry, serial: &str) -> bool {
    role.allowed_serial_numbers.iter().filter(|s| !s.is_empty()).any(|allowed| {
        (allowed.contains('*') && glob_match(allowed, serial)) || allowed == serial
    })
}
