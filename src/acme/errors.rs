use crate::error::PkiError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const ERROR_URN_PREFIX: &str = "urn:ietf:params:acme:error:";

/// RFC 8555 section 6.7 error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmeErrorType {
    AccountDoesNotExist,
    AlreadyRevoked,
    BadCsr,
    BadNonce,
    BadPublicKey,
    BadRevocationReason,
    BadSignatureAlgorithm,
    Caa,
    Compound,
    Connection,
    Dns,
    ExternalAccountRequired,
    IncorrectResponse,
    InvalidContact,
    Malformed,
    OrderNotReady,
    RateLimited,
    RejectedIdentifier,
    ServerInternal,
    Tls,
    Unauthorized,
    UnsupportedContact,
    UnsupportedIdentifier,
    UserActionRequired,
}

impl AcmeErrorType {
    pub const ALL: [AcmeErrorType; 24] = [
        AcmeErrorType::AccountDoesNotExist,
        AcmeErrorType::AlreadyRevoked,
        AcmeErrorType::BadCsr,
        AcmeErrorType::BadNonce,
        AcmeErrorType::BadPublicKey,
        AcmeErrorType::BadRevocationReason,
        AcmeErrorType::BadSignatureAlgorithm,
        AcmeErrorType::Caa,
        AcmeErrorType::Compound,
        AcmeErrorType::Connection,
        AcmeErrorType::Dns,
        AcmeErrorType::ExternalAccountRequired,
        AcmeErrorType::IncorrectResponse,
        AcmeErrorType::InvalidContact,
        AcmeErrorType::Malformed,
        AcmeErrorType::OrderNotReady,
        AcmeErrorType::RateLimited,
        AcmeErrorType::RejectedIdentifier,
        AcmeErrorType::ServerInternal,
        AcmeErrorType::Tls,
        AcmeErrorType::Unauthorized,
        AcmeErrorType::UnsupportedContact,
        AcmeErrorType::UnsupportedIdentifier,
        AcmeErrorType::UserActionRequired,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            AcmeErrorType::AccountDoesNotExist => "accountDoesNotExist",
            AcmeErrorType::AlreadyRevoked => "alreadyRevoked",
            AcmeErrorType::BadCsr => "badCSR",
            AcmeErrorType::BadNonce => "badNonce",
            AcmeErrorType::BadPublicKey => "badPublicKey",
            AcmeErrorType::BadRevocationReason => "badRevocationReason",
            AcmeErrorType::BadSignatureAlgorithm => "badSignatureAlgorithm",
            AcmeErrorType::Caa => "caa",
            AcmeErrorType::Compound => "compound",
            AcmeErrorType::Connection => "connection",
            AcmeErrorType::Dns => "dns",
            AcmeErrorType::ExternalAccountRequired => "externalAccountRequired",
            AcmeErrorType::IncorrectResponse => "incorrectResponse",
            AcmeErrorType::InvalidContact => "invalidContact",
            AcmeErrorType::Malformed => "malformed",
            AcmeErrorType::OrderNotReady => "orderNotReady",
            AcmeErrorType::RateLimited => "rateLimited",
            AcmeErrorType::RejectedIdentifier => "rejectedIdentifier",
            AcmeErrorType::ServerInternal => "serverInternal",
            AcmeErrorType::Tls => "tls",
            AcmeErrorType::Unauthorized => "unauthorized",
            AcmeErrorType::UnsupportedContact => "unsupportedContact",
            AcmeErrorType::UnsupportedIdentifier => "unsupportedIdentifier",
            AcmeErrorType::UserActionRequired => "userActionRequired",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AcmeErrorType::AccountDoesNotExist => "The request specified an account that does not exist",
            AcmeErrorType::AlreadyRevoked => {
                "The request specified a certificate to be revoked that has already been revoked"
            }
            AcmeErrorType::BadCsr => "The CSR is unacceptable (e.g., due to a short key)",
            AcmeErrorType::BadNonce => "The client sent an unacceptable anti-replay nonce",
            AcmeErrorType::BadPublicKey => {
                "The JWS was signed by a public key the server does not support"
            }
            AcmeErrorType::BadRevocationReason => {
                "The revocation reason provided is not allowed by the server"
            }
            AcmeErrorType::BadSignatureAlgorithm => {
                "The JWS was signed with an algorithm the server does not support"
            }
            AcmeErrorType::Caa => {
                "Certification Authority Authorization (CAA) records forbid the CA from issuing a certificate"
            }
            AcmeErrorType::Compound => {
                "Specific error conditions are indicated in the 'subproblems' array"
            }
            AcmeErrorType::Connection => "The server could not connect to validation target",
            AcmeErrorType::Dns => "There was a problem with a DNS query during identifier validation",
            AcmeErrorType::ExternalAccountRequired => {
                "The request must include a value for the 'externalAccountBinding' field"
            }
            AcmeErrorType::IncorrectResponse => {
                "Response received didn't match the challenge's requirements"
            }
            AcmeErrorType::InvalidContact => "A contact URL for an account was invalid",
            AcmeErrorType::Malformed => "The request message was malformed",
            AcmeErrorType::OrderNotReady => {
                "The request attempted to finalize an order that is not ready to be finalized"
            }
            AcmeErrorType::RateLimited => "The request exceeds a rate limit",
            AcmeErrorType::RejectedIdentifier => {
                "The server will not issue certificates for the identifier"
            }
            AcmeErrorType::ServerInternal => "The server experienced an internal error",
            AcmeErrorType::Tls => "The server received a TLS error during validation",
            AcmeErrorType::Unauthorized => "The client lacks sufficient authorization",
            AcmeErrorType::UnsupportedContact => {
                "A contact URL for an account used an unsupported protocol scheme"
            }
            AcmeErrorType::UnsupportedIdentifier => "An identifier is of an unsupported type",
            AcmeErrorType::UserActionRequired => {
                "Visit the 'instance' URL and take actions specified there"
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AcmeErrorType::Caa | AcmeErrorType::OrderNotReady => 403,
            AcmeErrorType::RateLimited => 429,
            AcmeErrorType::ExternalAccountRequired
            | AcmeErrorType::Unauthorized
            | AcmeErrorType::UserActionRequired => 401,
            AcmeErrorType::ServerInternal
            | AcmeErrorType::Connection
            | AcmeErrorType::Dns
            | AcmeErrorType::Tls => 500,
            _ => 400,
        }
    }

    pub fn urn(&self) -> String {
        format!("{ERROR_URN_PREFIX}{}", self.id())
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.strip_prefix(ERROR_URN_PREFIX).unwrap_or(id);
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }
}

impl fmt::Display for AcmeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An ACME error with an optional specific detail.
///
/// A compound error keeps its first member as the outer error and the rest
/// as subproblems.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct AcmeError {
    kind: AcmeErrorType,
    detail: Option<String>,
    subproblems: Vec<AcmeError>,
}

impl AcmeError {
    pub fn new(kind: AcmeErrorType, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind,
            detail: (!detail.is_empty()).then_some(detail),
            subproblems: Vec::new(),
        }
    }

    pub fn from_type(kind: AcmeErrorType) -> Self {
        Self {
            kind,
            detail: None,
            subproblems: Vec::new(),
        }
    }

    /// `None` when `errors` is empty.
    pub fn compound(mut errors: Vec<AcmeError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let mut outer = errors.remove(0);
        outer.subproblems.extend(errors);
        Some(outer)
    }

    pub fn kind(&self) -> AcmeErrorType {
        self.kind
    }

    pub fn detail(&self) -> &str {
        self.detail.as_deref().unwrap_or_else(|| self.kind.description())
    }

    pub fn subproblems(&self) -> &[AcmeError] {
        &self.subproblems
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn problem_document(&self) -> ProblemDocument {
        ProblemDocument {
            error_type: self.kind.urn(),
            detail: self.detail().to_string(),
            subproblems: self.subproblems.iter().map(|e| e.problem_document()).collect(),
        }
    }
}

impl fmt::Display for AcmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail())
    }
}

/// `application/problem+json` body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProblemDocument {
    #[serde(rename = "type")]
    pub error_type: String,
    pub detail: String,
    pub subproblems: Vec<ProblemDocument>,
}

/// Maps any engine error to an HTTP status and problem document. Plain
/// user errors become `malformed`; anything else outside the ACME taxonomy
/// becomes `serverInternal`.
pub fn translate_error(err: &PkiError) -> (u16, ProblemDocument) {
    let acme = match err {
        PkiError::Acme(e) => e.clone(),
        PkiError::User(msg) => AcmeError::new(AcmeErrorType::Malformed, msg.clone()),
        other => AcmeError::new(AcmeErrorType::ServerInternal, other.to_string()),
    };
    (acme.status_code(), acme.problem_document())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_already_revoked_document() {
        let err = PkiError::from(AcmeError::from_type(AcmeErrorType::AlreadyRevoked));
        let (status, doc) = translate_error(&err);
        assert_eq!(status, 400);
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({
                "type": "urn:ietf:params:acme:error:alreadyRevoked",
                "detail": "The request specified a certificate to be revoked that has already been revoked",
                "subproblems": []
            })
        );
    }

    #[test]
    fn test_status_table() {
        use AcmeErrorType::*;
        for kind in AcmeErrorType::ALL {
            let expected = match kind {
                Caa | OrderNotReady => 403,
                RateLimited => 429,
                ExternalAccountRequired | Unauthorized | UserActionRequired => 401,
                ServerInternal | Connection | Dns | Tls => 500,
                _ => 400,
            };
            assert_eq!(kind.status_code(), expected, "{kind}");
            assert_eq!(AcmeErrorType::from_id(&kind.urn()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_errors_become_server_internal() {
        let (status, doc) = translate_error(&PkiError::internal("disk on fire"));
        assert_eq!(status, 500);
        assert_eq!(doc.error_type, "urn:ietf:params:acme:error:serverInternal");
        assert_eq!(doc.detail, "disk on fire");

        let (status, doc) = translate_error(&PkiError::user("\"status\" must be provided"));
        assert_eq!(status, 400);
        assert_eq!(doc.error_type, "urn:ietf:params:acme:error:malformed");
    }

    #[test]
    fn test_compound_keeps_first_as_outer() {
        let err = AcmeError::compound(vec![
            AcmeError::new(AcmeErrorType::RejectedIdentifier, "evil.com is not allowed"),
            AcmeError::from_type(AcmeErrorType::Caa),
            AcmeError::new(AcmeErrorType::Dns, "NXDOMAIN"),
        ])
        .unwrap();
        let doc = err.problem_document();
        assert_eq!(doc.error_type, "urn:ietf:params:acme:error:rejectedIdentifier");
        assert_eq!(doc.detail, "evil.com is not allowed");
        assert_eq!(doc.subproblems.len(), 2);
        assert_eq!(doc.subproblems[1].detail, "NXDOMAIN");
        assert!(AcmeError::compound(vec![]).is_none());
    }
}
