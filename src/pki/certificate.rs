use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::Serialize;
use x509_parser::oid_registry::Oid;
use x509_parser::prelude::*;

use crate::crypto::KeyAlgorithm;
use crate::error::{Error, Result};

const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Parsed X.509 certificate.
///
/// Cloning is cheap, the DER bytes are shared.
#[derive(Clone, Serialize)]
pub struct Certificate {
    #[serde(skip)]
    raw: Arc<Vec<u8>>,
    pub subject: String,
    pub issuer: String,
    /// Upper-case hex of the serial number, without leading zero bytes
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(skip)]
    spki_oid: Vec<u32>,
}

/// Outcome of comparing a validity window with a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeValidity {
    Valid,
    Expired,
    NotYetValid,
}

/// Fields selectable through [`Certificate::info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertField {
    Subject,
    Issuer,
    CommonName,
    /// `serialNumber` RDN, the individual identification number (IIN)
    SubjectSerialNumber,
    Organization,
    /// `OU` RDN, the business identification number (BIN) for legal entities
    OrganizationalUnit,
    Country,
    Email,
    IssuerCommonName,
    SerialNumber,
    NotBefore,
    NotAfter,
    SignatureAlgorithm,
    KeyAlgorithm,
}

impl CertField {
    pub const ALL: &'static [CertField] = &[
        CertField::Subject,
        CertField::Issuer,
        CertField::CommonName,
        CertField::SubjectSerialNumber,
        CertField::Organization,
        CertField::OrganizationalUnit,
        CertField::Country,
        CertField::Email,
        CertField::IssuerCommonName,
        CertField::SerialNumber,
        CertField::NotBefore,
        CertField::NotAfter,
        CertField::SignatureAlgorithm,
        CertField::KeyAlgorithm,
    ];

    pub fn label(self) -> &'static str {
        match self {
            CertField::Subject => "subject",
            CertField::Issuer => "issuer",
            CertField::CommonName => "subject.commonName",
            CertField::SubjectSerialNumber => "subject.serialNumber",
            CertField::Organization => "subject.organization",
            CertField::OrganizationalUnit => "subject.organizationalUnit",
            CertField::Country => "subject.country",
            CertField::Email => "subject.email",
            CertField::IssuerCommonName => "issuer.commonName",
            CertField::SerialNumber => "serialNumber",
            CertField::NotBefore => "notBefore",
            CertField::NotAfter => "notAfter",
            CertField::SignatureAlgorithm => "signatureAlgorithm",
            CertField::KeyAlgorithm => "keyAlgorithm",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.label() == label)
    }
}

fn asn1_to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| Error::MalformedContainer("certificate time out of range".into()))
}

fn oid_arcs(oid: &Oid) -> Vec<u32> {
    oid.iter()
        .map(|arcs| arcs.map(|a| a as u32).collect())
        .unwrap_or_default()
}

fn rdn_value(name: &X509Name, dotted_oid: &str) -> Option<String> {
    name.iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == dotted_oid)
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

impl Certificate {
    /// Parses a DER encoded certificate
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = der.into();
        let (subject, issuer, serial_number, not_before, not_after, spki_oid) = {
            let (_, cert) = X509Certificate::from_der(&raw)
                .map_err(|e| Error::MalformedContainer(format!("invalid certificate: {e}")))?;
            let serial = cert.raw_serial();
            let first = serial
                .iter()
                .position(|b| *b != 0)
                .unwrap_or(serial.len().saturating_sub(1));
            (
                cert.subject().to_string(),
                cert.issuer().to_string(),
                hex::encode_upper(&serial[first..]),
                asn1_to_utc(cert.validity().not_before)?,
                asn1_to_utc(cert.validity().not_after)?,
                oid_arcs(&cert.public_key().algorithm.algorithm),
            )
        };
        Ok(Self {
            raw: Arc::new(raw),
            subject,
            issuer,
            serial_number,
            not_before,
            not_after,
            spki_oid,
        })
    }

    /// Parses a PEM `CERTIFICATE` block
    pub fn from_pem(pem_text: impl AsRef<[u8]>) -> Result<Self> {
        let pem = ::pem::parse(pem_text)
            .map_err(|e| Error::InvalidInput(format!("invalid PEM certificate: {e}")))?;
        if pem.tag() != PEM_CERTIFICATE_TAG {
            return Err(Error::InvalidInput(format!(
                "expected a {PEM_CERTIFICATE_TAG} PEM block, got {}",
                pem.tag()
            )));
        }
        Self::from_der(pem.contents())
    }

    /// Accepts PEM, base64 DER or raw DER
    pub fn from_any(bytes: &[u8]) -> Result<Self> {
        let trimmed = bytes.trim_ascii();
        if trimmed.starts_with(b"-----BEGIN") {
            return Self::from_pem(trimmed);
        }
        if trimmed.first() == Some(&0x30) {
            return Self::from_der(trimmed);
        }
        let der = BASE64
            .decode(trimmed)
            .map_err(|e| Error::InvalidInput(format!("certificate is not PEM, DER or base64: {e}")))?;
        Self::from_der(der)
    }

    pub fn der(&self) -> &[u8] {
        &self.raw
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.der())
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new(PEM_CERTIFICATE_TAG, self.der().to_vec()))
    }

    /// Borrowed x509-parser view of the certificate
    pub(crate) fn parsed(&self) -> Result<X509Certificate<'_>> {
        X509Certificate::from_der(&self.raw)
            .map(|(_, cert)| cert)
            .map_err(|e| Error::MalformedContainer(format!("invalid certificate: {e}")))
    }

    /// DER `SubjectPublicKeyInfo`
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.parsed()?.public_key().raw.to_vec())
    }

    pub fn key_algorithm(&self) -> Result<KeyAlgorithm> {
        KeyAlgorithm::from_spki_oid(&self.spki_oid)
    }

    /// Serial number bytes without leading zeros
    pub fn serial_bytes(&self) -> Vec<u8> {
        hex::decode(&self.serial_number).unwrap_or_default()
    }

    pub fn time_validity_at(&self, now: DateTime<Utc>) -> TimeValidity {
        if now < self.not_before {
            TimeValidity::NotYetValid
        } else if now > self.not_after {
            TimeValidity::Expired
        } else {
            TimeValidity::Valid
        }
    }

    /// Fails with `CertificateExpired` / `NotYetValid` outside the validity window
    pub fn check_time(&self, now: DateTime<Utc>) -> Result<()> {
        match self.time_validity_at(now) {
            TimeValidity::Valid => Ok(()),
            TimeValidity::Expired => Err(Error::CertificateExpired(format!(
                "{} expired at {}",
                self.subject, self.not_after
            ))),
            TimeValidity::NotYetValid => Err(Error::NotYetValid(format!(
                "{} is valid from {}",
                self.subject, self.not_before
            ))),
        }
    }

    /// True if `issuer` names this certificate's issuer and its key verifies the signature
    pub fn is_issued_by(&self, issuer: &Certificate) -> Result<bool> {
        let cert = self.parsed()?;
        let issuer_cert = issuer.parsed()?;
        if cert.issuer() != issuer_cert.subject() {
            return Ok(false);
        }
        Ok(cert.verify_signature(Some(issuer_cert.public_key())).is_ok())
    }

    /// Renders the requested fields as `label=value` lines.
    ///
    /// Fields absent from the certificate are skipped.
    pub fn info(&self, fields: &[CertField]) -> Result<String> {
        let cert = self.parsed()?;
        let mut lines = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match field {
                CertField::Subject => Some(self.subject.clone()),
                CertField::Issuer => Some(self.issuer.clone()),
                CertField::CommonName => rdn_value(cert.subject(), "2.5.4.3"),
                CertField::SubjectSerialNumber => rdn_value(cert.subject(), "2.5.4.5"),
                CertField::Organization => rdn_value(cert.subject(), "2.5.4.10"),
                CertField::OrganizationalUnit => rdn_value(cert.subject(), "2.5.4.11"),
                CertField::Country => rdn_value(cert.subject(), "2.5.4.6"),
                CertField::Email => rdn_value(cert.subject(), "1.2.840.113549.1.9.1"),
                CertField::IssuerCommonName => rdn_value(cert.issuer(), "2.5.4.3"),
                CertField::SerialNumber => Some(self.serial_number.clone()),
                CertField::NotBefore => Some(self.not_before.to_rfc3339()),
                CertField::NotAfter => Some(self.not_after.to_rfc3339()),
                CertField::SignatureAlgorithm => {
                    Some(cert.signature_algorithm.algorithm.to_id_string())
                }
                CertField::KeyAlgorithm => Some(
                    self.key_algorithm()
                        .map(|alg| alg.to_string())
                        .unwrap_or_else(|_| cert.public_key().algorithm.algorithm.to_id_string()),
                ),
            };
            if let Some(value) = value {
                lines.push(format!("{}={value}", field.label()));
            }
        }
        Ok(lines.join("\n"))
    }

    /// Short diagnostic description used in validation results and logs
    pub fn describe(&self) -> String {
        format!(
            "subject={}; issuer={}; serial={}; valid {} .. {}",
            self.subject,
            self.issuer,
            self.serial_number,
            self.not_before.to_rfc3339(),
            self.not_after.to_rfc3339()
        )
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial_number", &self.serial_number)
            .field("not_after", &self.not_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use chrono::Duration;

    #[test]
    fn test_parse_fields() {
        let identity = test_utils::identity();
        let cert = Certificate::from_der(identity.cert_der.clone()).unwrap();

        assert!(cert.subject.contains("CN=TEST USER"));
        assert!(cert.issuer.contains("CN=Test Root CA"));
        assert_eq!(cert.serial_number, "0A1B2C");
        assert_eq!(cert.serial_bytes(), vec![0x0a, 0x1b, 0x2c]);
        assert_eq!(cert.key_algorithm().unwrap(), KeyAlgorithm::Ecdsa);
        assert_eq!(cert.der(), identity.cert_der.as_slice());
    }

    #[test]
    fn test_pem_and_base64_round_trip() {
        let identity = test_utils::identity();
        let cert = Certificate::from_der(identity.cert_der).unwrap();

        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(Certificate::from_any(pem.as_bytes()).unwrap(), cert);
        assert_eq!(
            Certificate::from_any(cert.to_base64().as_bytes()).unwrap(),
            cert
        );
        assert_eq!(Certificate::from_any(cert.der()).unwrap(), cert);
    }

    #[test]
    fn test_time_validity() {
        let cert = Certificate::from_der(test_utils::identity().cert_der).unwrap();
        let now = Utc::now();

        assert_eq!(cert.time_validity_at(now), TimeValidity::Valid);
        assert_eq!(
            cert.time_validity_at(cert.not_after + Duration::days(1)),
            TimeValidity::Expired
        );
        assert!(matches!(
            cert.check_time(cert.not_before - Duration::days(1)),
            Err(Error::NotYetValid(_))
        ));
    }

    #[test]
    fn test_info_fields() {
        let cert = Certificate::from_der(test_utils::identity().cert_der).unwrap();
        let info = cert
            .info(&[
                CertField::CommonName,
                CertField::SubjectSerialNumber,
                CertField::SerialNumber,
                CertField::Email,
            ])
            .unwrap();

        assert!(info.contains("subject.commonName=TEST USER"));
        assert!(info.contains("subject.serialNumber=IIN123456789012"));
        assert!(info.contains("serialNumber=0A1B2C"));
        // no e-mail RDN in the fixture
        assert!(!info.contains("subject.email"));
        assert_eq!(
            CertField::from_label("notAfter"),
            Some(CertField::NotAfter)
        );
    }

    #[test]
    fn test_issued_by() {
        let identity = test_utils::identity();
        let cert = Certificate::from_der(identity.cert_der).unwrap();
        let ca = Certificate::from_der(identity.ca_der).unwrap();

        assert!(cert.is_issued_by(&ca).unwrap());
        assert!(!ca.is_issued_by(&cert).unwrap());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Certificate::from_der(vec![0x30, 0x03, 0x02, 0x01, 0x01]),
            Err(Error::MalformedContainer(_))
        ));
    }
}
