use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pki::certificate::{Certificate, TimeValidity};
use crate::pki::crl::RevocationList;

/// Where the revocation status of a certificate comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RevocationSource {
    Nothing,
    Ocsp { url: String },
    /// HTTP(S) URL or local file path
    Crl { location: String },
}

/// Answer of an OCSP responder for a single certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked {
        revoked_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    },
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Fetches revocation data over the network or from disk.
#[cfg_attr(test, mockall::automock)]
pub trait RevocationTransport: Send + Sync {
    /// Asks the responder at `url` about `certificate`
    fn fetch_ocsp(
        &self,
        url: &str,
        certificate: &Certificate,
        issuer: &Certificate,
    ) -> std::result::Result<OcspStatus, TransportError>;

    /// Raw CRL bytes, DER or PEM
    fn fetch_crl(&self, location: &str) -> std::result::Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ValidateCertInput {
    pub certificate: Certificate,
    /// Enables the issuer signature check and is required for OCSP
    pub issuer: Option<Certificate>,
    pub check_cert_time: bool,
    pub source: RevocationSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationStatus {
    Valid,
    Expired,
    NotYetValid,
    Revoked,
    Unknown,
    /// Time check passed, revocation was not requested
    Unchecked,
    Untrusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RevocationStatus {
    NotRevoked,
    Revoked {
        revoked_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    },
    Unknown { reason: String },
    Unchecked,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    /// `None` when the time check was not requested
    pub time: Option<TimeValidity>,
    pub revocation: RevocationStatus,
    pub detail: String,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    /// Turns a failed outcome into the matching error.
    ///
    /// `Unchecked` passes through since no revocation check was asked for.
    pub fn into_result(self) -> Result<Self> {
        let detail = self.detail.clone();
        match self.status {
            ValidationStatus::Valid | ValidationStatus::Unchecked => Ok(self),
            ValidationStatus::Expired => Err(Error::CertificateExpired(detail)),
            ValidationStatus::NotYetValid => Err(Error::NotYetValid(detail)),
            ValidationStatus::Revoked => Err(Error::Revoked(detail)),
            ValidationStatus::Unknown => Err(Error::RevocationUnknown(detail)),
            ValidationStatus::Untrusted => Err(Error::Untrusted(detail)),
        }
    }
}

/// Time and revocation checks for a single certificate
pub struct CertificateValidator {
    transport: Arc<dyn RevocationTransport>,
}

impl CertificateValidator {
    pub fn new(transport: Arc<dyn RevocationTransport>) -> Self {
        Self { transport }
    }

    pub fn validate(&self, input: &ValidateCertInput) -> Result<ValidationResult> {
        self.validate_at(input, Utc::now())
    }

    pub fn validate_at(
        &self,
        input: &ValidateCertInput,
        now: DateTime<Utc>,
    ) -> Result<ValidationResult> {
        let certificate = &input.certificate;
        let describe = |reason: &str| format!("{}; {reason}", certificate.describe());

        let time = input
            .check_cert_time
            .then(|| certificate.time_validity_at(now));
        let time_failure = match time {
            Some(TimeValidity::Expired) => Some(ValidationStatus::Expired),
            Some(TimeValidity::NotYetValid) => Some(ValidationStatus::NotYetValid),
            _ => None,
        };
        if let Some(status) = time_failure {
            info!(serial = %certificate.serial_number, ?status, "certificate outside its validity period");
            return Ok(ValidationResult {
                status,
                time,
                revocation: RevocationStatus::Unchecked,
                detail: describe("outside the validity period"),
            });
        }

        if let Some(issuer) = &input.issuer
            && !certificate.is_issued_by(issuer)?
        {
            warn!(serial = %certificate.serial_number, issuer = %issuer.subject, "certificate not issued by the given issuer");
            return Ok(ValidationResult {
                status: ValidationStatus::Untrusted,
                time,
                revocation: RevocationStatus::Unchecked,
                detail: describe(&format!("not signed by {}", issuer.subject)),
            });
        }

        let revocation = match &input.source {
            RevocationSource::Nothing => RevocationStatus::Unchecked,
            RevocationSource::Ocsp { url } => self.check_ocsp(url, certificate, input.issuer.as_ref()),
            RevocationSource::Crl { location } => {
                self.check_crl(location, certificate, input.issuer.as_ref(), now)
            }
        };

        let (status, reason) = match &revocation {
            RevocationStatus::NotRevoked => (ValidationStatus::Valid, "not revoked".to_owned()),
            RevocationStatus::Unchecked => (
                ValidationStatus::Unchecked,
                "revocation not checked".to_owned(),
            ),
            RevocationStatus::Revoked { revoked_at, reason } => (
                ValidationStatus::Revoked,
                format!(
                    "revoked at {} ({})",
                    revoked_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown time".into()),
                    reason.as_deref().unwrap_or("unspecified")
                ),
            ),
            RevocationStatus::Unknown { reason } => {
                (ValidationStatus::Unknown, format!("revocation unknown: {reason}"))
            }
        };
        info!(serial = %certificate.serial_number, ?status, "certificate validated");

        Ok(ValidationResult {
            status,
            time,
            revocation,
            detail: describe(&reason),
        })
    }

    fn check_ocsp(
        &self,
        url: &str,
        certificate: &Certificate,
        issuer: Option<&Certificate>,
    ) -> RevocationStatus {
        let Some(issuer) = issuer else {
            return RevocationStatus::Unknown {
                reason: "OCSP requires the issuer certificate".into(),
            };
        };
        match self.transport.fetch_ocsp(url, certificate, issuer) {
            Ok(OcspStatus::Good) => RevocationStatus::NotRevoked,
            Ok(OcspStatus::Revoked { revoked_at, reason }) => {
                RevocationStatus::Revoked { revoked_at, reason }
            }
            Ok(OcspStatus::Unknown) => RevocationStatus::Unknown {
                reason: format!("responder {url} does not know the certificate"),
            },
            Err(e) => {
                warn!(url, "OCSP query failed: {e}");
                RevocationStatus::Unknown {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn check_crl(
        &self,
        location: &str,
        certificate: &Certificate,
        issuer: Option<&Certificate>,
        now: DateTime<Utc>,
    ) -> RevocationStatus {
        let unknown = |reason: String| {
            warn!(location, "CRL unusable: {reason}");
            RevocationStatus::Unknown { reason }
        };

        let bytes = match self.transport.fetch_crl(location) {
            Ok(bytes) => bytes,
            Err(e) => return unknown(e.to_string()),
        };
        let crl = match RevocationList::from_bytes(&bytes) {
            Ok(crl) => crl,
            Err(e) => return unknown(e.to_string()),
        };
        if crl.is_stale_at(now) {
            return unknown(format!(
                "CRL of {} is outside its update window",
                crl.issuer
            ));
        }
        if !crl.covers(certificate) {
            return unknown(format!("CRL is issued by {}", crl.issuer));
        }
        if let Some(issuer) = issuer
            && !matches!(crl.verify_signature(issuer), Ok(true))
        {
            return unknown(format!("CRL signature does not verify with {}", issuer.subject));
        }

        debug!(location, entries = crl.revoked.len(), "CRL checked");
        match crl.find(certificate) {
            Some(entry) => RevocationStatus::Revoked {
                revoked_at: Some(entry.revoked_at),
                reason: entry.reason.map(str::to_owned),
            },
            None => RevocationStatus::NotRevoked,
        }
    }
}
