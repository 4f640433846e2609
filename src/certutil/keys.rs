use super::bundle::der_to_pem;
use crate::error::{PkiError, Result};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, PrivateKeyInfo};
use rand::rngs::OsRng;
use rcgen::{KeyPair, SignatureAlgorithm};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";

pub const RSA_KEY_SIZES: [u32; 4] = [2048, 3072, 4096, 8192];
pub const EC_KEY_SIZES: [u32; 4] = [224, 256, 384, 521];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ec,
    Ed25519,
    /// Role-only: any key type may be signed.
    Any,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Ec => "ec",
            KeyType::Ed25519 => "ed25519",
            KeyType::Any => "any",
        }
    }

    /// Size used when a caller passes `0`.
    pub fn default_bits(&self) -> u32 {
        match self {
            KeyType::Rsa => 2048,
            KeyType::Ec => 256,
            KeyType::Ed25519 | KeyType::Any => 0,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rsa" => Ok(KeyType::Rsa),
            "ec" => Ok(KeyType::Ec),
            "ed25519" => Ok(KeyType::Ed25519),
            "any" => Ok(KeyType::Any),
            other => Err(PkiError::user(format!("unknown key type: {other}"))),
        }
    }
}

/// Checks a `(key_type, key_bits)` pair and resolves `0` to the type default.
pub fn validate_key_type_length(key_type: KeyType, key_bits: u32) -> Result<u32> {
    let bits = if key_bits == 0 { key_type.default_bits() } else { key_bits };
    match key_type {
        KeyType::Rsa => {
            if bits < 2048 {
                return Err(PkiError::user(format!(
                    "RSA keys < 2048 bits are unsafe and not supported: got {bits}"
                )));
            }
            if !RSA_KEY_SIZES.contains(&bits) {
                return Err(PkiError::user(format!("unsupported bit length for RSA key: {bits}")));
            }
        }
        KeyType::Ec => {
            if !EC_KEY_SIZES.contains(&bits) {
                return Err(PkiError::user(format!("unsupported bit length for EC key: {bits}")));
            }
        }
        KeyType::Ed25519 => return Ok(0),
        KeyType::Any => {}
    }
    Ok(bits)
}

/// Picks the signing algorithm for a key.
///
/// RSA honours `signature_bits` (0 means SHA-256); EC always uses the
/// curve's native digest; Ed25519 is pure EdDSA.
pub fn signature_algorithm_for(
    key_type: KeyType,
    key_bits: u32,
    signature_bits: u32,
) -> Result<&'static SignatureAlgorithm> {
    match key_type {
        KeyType::Rsa => match signature_bits {
            0 | 256 => Ok(&rcgen::PKCS_RSA_SHA256),
            384 => Ok(&rcgen::PKCS_RSA_SHA384),
            512 => Ok(&rcgen::PKCS_RSA_SHA512),
            other => Err(PkiError::user(format!("unsupported signature bits: {other}"))),
        },
        KeyType::Ec => match key_bits {
            0 | 256 => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
            384 => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
            other => Err(PkiError::user(format!(
                "EC curve of {other} bits is not supported by the signing backend"
            ))),
        },
        KeyType::Ed25519 => Ok(&rcgen::PKCS_ED25519),
        KeyType::Any => Err(PkiError::user("a concrete key type is required for signing")),
    }
}

/// SHA-1 over the DER `SubjectPublicKeyInfo`.
pub fn subject_key_id(spki_der: &[u8]) -> Vec<u8> {
    Sha1::digest(spki_der).to_vec()
}

/// Key type and size of a DER `SubjectPublicKeyInfo`.
pub fn public_key_info(spki_der: &[u8]) -> Result<(KeyType, u32)> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| PkiError::user(format!("unable to parse public key: {e}")))?;
    let oid = spki.algorithm.algorithm.to_id_string();
    if oid == OID_ED25519 {
        return Ok((KeyType::Ed25519, 0));
    }
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok((KeyType::Rsa, rsa.key_size() as u32)),
        Ok(PublicKey::EC(point)) => {
            let bits = match point.data().len() {
                57 => 224,
                65 => 256,
                97 => 384,
                133 => 521,
                other => {
                    return Err(PkiError::user(format!("unsupported EC point length: {other}")))
                }
            };
            Ok((KeyType::Ec, bits))
        }
        _ => Err(PkiError::user(format!("unsupported public key algorithm: {oid}"))),
    }
}

/// Output encoding for private keys handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateKeyFormat {
    /// PKCS#1 for RSA, SEC1 for EC, PKCS#8 for Ed25519.
    Legacy,
    Pkcs8,
}

impl FromStr for PrivateKeyFormat {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "der" | "pem" => Ok(PrivateKeyFormat::Legacy),
            "pkcs8" => Ok(PrivateKeyFormat::Pkcs8),
            other => Err(PkiError::user(format!("invalid private_key_format: {other}"))),
        }
    }
}

/// A private key held as PKCS#8 DER plus its classification.
#[derive(Clone)]
pub struct PrivateKey {
    pkcs8_der: Vec<u8>,
    key_type: KeyType,
    bits: u32,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type)
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Loads a PEM block body, accepting PKCS#1, SEC1 and PKCS#8 framings.
    pub fn from_pem_block(tag: &str, contents: &[u8]) -> Result<Self> {
        let pkcs8_der = match tag {
            "RSA PRIVATE KEY" => {
                let key = RsaPrivateKey::from_pkcs1_der(contents)
                    .map_err(|e| PkiError::user(format!("unable to parse RSA private key: {e}")))?;
                key.to_pkcs8_der()
                    .map_err(|e| PkiError::internal(format!("unable to encode RSA key: {e}")))?
                    .as_bytes()
                    .to_vec()
            }
            "EC PRIVATE KEY" => {
                if let Ok(key) = p256::SecretKey::from_sec1_der(contents) {
                    key.to_pkcs8_der()
                        .map_err(|e| PkiError::internal(format!("unable to encode EC key: {e}")))?
                        .as_bytes()
                        .to_vec()
                } else {
                    let key = p384::SecretKey::from_sec1_der(contents).map_err(|_| {
                        PkiError::user("unable to parse EC private key: unsupported curve")
                    })?;
                    key.to_pkcs8_der()
                        .map_err(|e| PkiError::internal(format!("unable to encode EC key: {e}")))?
                        .as_bytes()
                        .to_vec()
                }
            }
            _ => contents.to_vec(),
        };
        Self::from_pkcs8_der(pkcs8_der)
    }

    pub fn from_pkcs8_der(pkcs8_der: Vec<u8>) -> Result<Self> {
        let (key_type, bits) = {
            let info = PrivateKeyInfo::try_from(pkcs8_der.as_slice())
                .map_err(|e| PkiError::user(format!("unable to parse private key: {e}")))?;
            match info.algorithm.oid.to_string().as_str() {
                OID_RSA_ENCRYPTION => {
                    let key = RsaPrivateKey::from_pkcs8_der(&pkcs8_der).map_err(|e| {
                        PkiError::user(format!("unable to parse RSA private key: {e}"))
                    })?;
                    (KeyType::Rsa, (key.size() * 8) as u32)
                }
                OID_EC_PUBLIC_KEY => {
                    if p256::SecretKey::from_pkcs8_der(&pkcs8_der).is_ok() {
                        (KeyType::Ec, 256)
                    } else if p384::SecretKey::from_pkcs8_der(&pkcs8_der).is_ok() {
                        (KeyType::Ec, 384)
                    } else {
                        return Err(PkiError::user("unsupported EC private key curve"));
                    }
                }
                OID_ED25519 => (KeyType::Ed25519, 0),
                other => {
                    return Err(PkiError::user(format!(
                        "unsupported private key algorithm: {other}"
                    )))
                }
            }
        };
        Ok(Self { pkcs8_der, key_type, bits })
    }

    /// Builds an rcgen key pair whose algorithm signs with `signature_bits`.
    pub fn key_pair(&self, signature_bits: u32) -> Result<KeyPair> {
        let alg = signature_algorithm_for(self.key_type, self.bits, signature_bits)?;
        Ok(KeyPair::from_pem_and_sign_algo(&self.pkcs8_pem(), alg)?)
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.key_pair(0)?.public_key_der())
    }

    pub fn pkcs8_pem(&self) -> String {
        der_to_pem("PRIVATE KEY", &self.pkcs8_der)
    }

    /// DER plus PEM label in the requested format.
    pub fn encode(&self, format: PrivateKeyFormat) -> Result<(&'static str, Vec<u8>)> {
        if format == PrivateKeyFormat::Pkcs8 {
            return Ok(("PRIVATE KEY", self.pkcs8_der.clone()));
        }
        match (self.key_type, self.bits) {
            (KeyType::Rsa, _) => {
                let key = RsaPrivateKey::from_pkcs8_der(&self.pkcs8_der)
                    .map_err(|e| PkiError::internal(format!("stored RSA key is corrupt: {e}")))?;
                let der = key
                    .to_pkcs1_der()
                    .map_err(|e| PkiError::internal(format!("unable to encode RSA key: {e}")))?;
                Ok(("RSA PRIVATE KEY", der.as_bytes().to_vec()))
            }
            (KeyType::Ec, 384) => {
                let key = p384::SecretKey::from_pkcs8_der(&self.pkcs8_der)
                    .map_err(|e| PkiError::internal(format!("stored EC key is corrupt: {e}")))?;
                let der = key
                    .to_sec1_der()
                    .map_err(|e| PkiError::internal(format!("unable to encode EC key: {e}")))?;
                Ok(("EC PRIVATE KEY", der.to_vec()))
            }
            (KeyType::Ec, _) => {
                let key = p256::SecretKey::from_pkcs8_der(&self.pkcs8_der)
                    .map_err(|e| PkiError::internal(format!("stored EC key is corrupt: {e}")))?;
                let der = key
                    .to_sec1_der()
                    .map_err(|e| PkiError::internal(format!("unable to encode EC key: {e}")))?;
                Ok(("EC PRIVATE KEY", der.to_vec()))
            }
            _ => Ok(("PRIVATE KEY", self.pkcs8_der.clone())),
        }
    }

    pub fn to_pem(&self, format: PrivateKeyFormat) -> Result<String> {
        let (label, der) = self.encode(format)?;
        Ok(der_to_pem(label, &der))
    }
}

/// Generates a fresh key; `bits == 0` resolves to the type default.
pub fn generate_key(key_type: KeyType, bits: u32) -> Result<PrivateKey> {
    let bits = validate_key_type_length(key_type, bits)?;
    debug!("Generating {} key ({} bits)", key_type, bits);
    match key_type {
        KeyType::Rsa => {
            let key = RsaPrivateKey::new(&mut OsRng, bits as usize)
                .map_err(|e| PkiError::internal(format!("failed to generate RSA key: {e}")))?;
            let der = key
                .to_pkcs8_der()
                .map_err(|e| PkiError::internal(format!("failed to encode RSA key: {e}")))?;
            Ok(PrivateKey {
                pkcs8_der: der.as_bytes().to_vec(),
                key_type,
                bits,
            })
        }
        KeyType::Ec => {
            let alg = signature_algorithm_for(key_type, bits, 0)?;
            let pair = KeyPair::generate_for(alg)?;
            Ok(PrivateKey {
                pkcs8_der: pair.serialize_der(),
                key_type,
                bits,
            })
        }
        KeyType::Ed25519 => {
            let pair = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
            Ok(PrivateKey {
                pkcs8_der: pair.serialize_der(),
                key_type,
                bits: 0,
            })
        }
        KeyType::Any => Err(PkiError::user(
            "key type \"any\" cannot be used to generate a key",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_sizes() {
        assert_eq!(validate_key_type_length(KeyType::Rsa, 0).unwrap(), 2048);
        assert_eq!(validate_key_type_length(KeyType::Ec, 0).unwrap(), 256);
        assert_eq!(validate_key_type_length(KeyType::Ed25519, 4096).unwrap(), 0);
        assert!(validate_key_type_length(KeyType::Rsa, 1024).is_err());
        assert!(validate_key_type_length(KeyType::Rsa, 2049).is_err());
        assert!(validate_key_type_length(KeyType::Ec, 512).is_err());
        assert_eq!(validate_key_type_length(KeyType::Ec, 521).unwrap(), 521);
    }

    #[test]
    fn test_signature_algorithms() {
        assert_eq!(
            signature_algorithm_for(KeyType::Rsa, 2048, 0).unwrap(),
            &rcgen::PKCS_RSA_SHA256
        );
        assert_eq!(
            signature_algorithm_for(KeyType::Rsa, 2048, 512).unwrap(),
            &rcgen::PKCS_RSA_SHA512
        );
        assert_eq!(
            signature_algorithm_for(KeyType::Ec, 384, 256).unwrap(),
            &rcgen::PKCS_ECDSA_P384_SHA384
        );
        assert!(signature_algorithm_for(KeyType::Ec, 521, 0).is_err());
        assert!(signature_algorithm_for(KeyType::Rsa, 2048, 1).is_err());
    }

    #[test]
    fn test_generate_ec_and_reload_legacy() {
        let key = generate_key(KeyType::Ec, 384).unwrap();
        assert_eq!(key.key_type(), KeyType::Ec);
        assert_eq!(key.bits(), 384);

        let (label, der) = key.encode(PrivateKeyFormat::Legacy).unwrap();
        assert_eq!(label, "EC PRIVATE KEY");
        let reloaded = PrivateKey::from_pem_block(label, &der).unwrap();
        assert_eq!(reloaded.bits(), 384);
        assert_eq!(
            reloaded.public_key_der().unwrap(),
            key.public_key_der().unwrap()
        );

        let spki = key.public_key_der().unwrap();
        assert_eq!(public_key_info(&spki).unwrap(), (KeyType::Ec, 384));
        assert_eq!(subject_key_id(&spki).len(), 20);
    }

    #[test]
    fn test_generate_rsa_pkcs1_round_trip() {
        let key = generate_key(KeyType::Rsa, 2048).unwrap();
        let pem = key.to_pem(PrivateKeyFormat::Legacy).unwrap();
        assert!(pem.contains("BEGIN RSA PRIVATE KEY"));
        let parsed = ::pem::parse(pem).unwrap();
        let reloaded = PrivateKey::from_pem_block(parsed.tag(), parsed.contents()).unwrap();
        assert_eq!(reloaded.key_type(), KeyType::Rsa);
        assert_eq!(reloaded.bits(), 2048);
        let spki = reloaded.public_key_der().unwrap();
        assert_eq!(public_key_info(&spki).unwrap(), (KeyType::Rsa, 2048));
    }

    #[test]
    fn test_generate_ed25519() {
        let key = generate_key(KeyType::Ed25519, 0).unwrap();
        assert!(key.to_pem(PrivateKeyFormat::Legacy).unwrap().contains("BEGIN PRIVATE KEY"));
        let spki = key.public_key_der().unwrap();
        assert_eq!(public_key_info(&spki).unwrap(), (KeyType::Ed25519, 0));
    }

    #[test]
    fn test_unsupported_ec_curve() {
        assert!(generate_key(KeyType::Ec, 224).is_err());
        assert!(generate_key(KeyType::Any, 0).is_err());
    }
}
