use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;

const PEM_CRL_TAG: &str = "X509 CRL";

/// One revoked serial number
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevokedEntry {
    /// Upper case hex without leading zeros
    pub serial_number: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: Option<&'static str>,
}

/// A parsed Certificate Revocation List
#[derive(Debug, Clone)]
pub struct RevocationList {
    der: Vec<u8>,
    pub issuer: String,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked: Vec<RevokedEntry>,
}

/// RFC 5280 CRLReason names
pub(crate) fn reason_name(code: u8) -> &'static str {
    match code {
        1 => "keyCompromise",
        2 => "cACompromise",
        3 => "affiliationChanged",
        4 => "superseded",
        5 => "cessationOfOperation",
        6 => "certificateHold",
        8 => "removeFromCRL",
        9 => "privilegeWithdrawn",
        10 => "aACompromise",
        _ => "unspecified",
    }
}

pub(crate) fn normalized_serial(raw: &[u8]) -> String {
    let first = raw
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(raw.len().saturating_sub(1));
    hex::encode_upper(&raw[first..])
}

fn asn1_to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| Error::InvalidInput("CRL time out of range".into()))
}

impl RevocationList {
    /// Parses a DER or PEM encoded CRL
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let trimmed = bytes.trim_ascii();
        let der = if trimmed.starts_with(b"-----BEGIN") {
            let pem = ::pem::parse(trimmed)
                .map_err(|e| Error::InvalidInput(format!("invalid PEM CRL: {e}")))?;
            if pem.tag() != PEM_CRL_TAG {
                return Err(Error::InvalidInput(format!(
                    "expected a {PEM_CRL_TAG} PEM block, got {}",
                    pem.tag()
                )));
            }
            pem.into_contents()
        } else {
            trimmed.to_vec()
        };
        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (issuer, this_update, next_update, revoked) = {
            let (_, crl) = CertificateRevocationList::from_der(&der)
                .map_err(|e| Error::InvalidInput(format!("invalid CRL: {e}")))?;

            let mut revoked = Vec::new();
            for entry in crl.iter_revoked_certificates() {
                revoked.push(RevokedEntry {
                    serial_number: normalized_serial(entry.raw_serial()),
                    revoked_at: asn1_to_utc(entry.revocation_date)?,
                    reason: entry.reason_code().map(|(_, code)| reason_name(code.0)),
                });
            }
            (
                crl.issuer().to_string(),
                asn1_to_utc(crl.last_update())?,
                crl.next_update().map(asn1_to_utc).transpose()?,
                revoked,
            )
        };

        debug!(issuer, entries = revoked.len(), "CRL parsed");
        Ok(Self {
            der,
            issuer,
            this_update,
            next_update,
            revoked,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Past `nextUpdate`, or not yet issued
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now < self.this_update || self.next_update.is_some_and(|next| now > next)
    }

    /// True if the CRL names `certificate`'s issuer
    pub fn covers(&self, certificate: &Certificate) -> bool {
        self.issuer == certificate.issuer
    }

    /// Verifies the CRL signature with the issuer certificate
    pub fn verify_signature(&self, issuer: &Certificate) -> Result<bool> {
        let (_, crl) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| Error::InvalidInput(format!("invalid CRL: {e}")))?;
        let issuer_cert = issuer.parsed()?;

        if issuer_cert.subject() != crl.issuer() {
            return Ok(false);
        }
        match crl.verify_signature(issuer_cert.public_key()) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(issuer = %self.issuer, "CRL signature verification failed: {e}");
                Ok(false)
            }
        }
    }

    /// The entry revoking `certificate`, if any
    pub fn find(&self, certificate: &Certificate) -> Option<&RevokedEntry> {
        self.revoked
            .iter()
            .find(|entry| entry.serial_number == certificate.serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_parse_and_lookup() {
        let identity = test_utils::identity();
        let cert = Certificate::from_der(identity.cert_der.clone()).unwrap();
        let der = test_utils::crl_der(&identity.ca, &[&[0x0a, 0x1b, 0x2c]], (2999, 1, 1));
        let crl = RevocationList::from_bytes(&der).unwrap();

        assert_eq!(crl.issuer, cert.issuer);
        assert!(crl.covers(&cert));
        assert!(!crl.is_stale_at(Utc::now()));

        let entry = crl.find(&cert).unwrap();
        assert_eq!(entry.serial_number, "0A1B2C");
        assert_eq!(entry.reason, Some("keyCompromise"));

        let ca = Certificate::from_der(identity.ca_der.clone()).unwrap();
        assert!(crl.verify_signature(&ca).unwrap());
        assert!(!crl.verify_signature(&cert).unwrap());
    }

    #[test]
    fn test_pem_and_staleness() {
        let identity = test_utils::identity();
        let der = test_utils::crl_der(&identity.ca, &[&[0x01]], (2024, 2, 1));
        let pem_text = ::pem::encode(&::pem::Pem::new(PEM_CRL_TAG, der));
        let crl = RevocationList::from_bytes(pem_text.as_bytes()).unwrap();

        assert!(crl.is_stale_at(Utc::now()));
        let cert = Certificate::from_der(identity.cert_der.clone()).unwrap();
        assert!(crl.find(&cert).is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            RevocationList::from_bytes(b"not a crl"),
            Err(Error::InvalidInput(_))
        ));
    }
}
