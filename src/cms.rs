//! CMS (RFC 5652) signature containers.
//!
//! [`SignatureEngine`] signs payloads or precomputed digests with the identity
//! of a [`KeyStore`] and verifies attached and detached `SignedData`.

pub(crate) mod builder;
mod verifier;

pub use verifier::{SignerReport, TimestampInfo};

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::asn1::oid::ID_DATA;
use crate::crypto::{CryptoBackend, HashAlg};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::pki::keystore::KeyStore;

pub(crate) use verifier::{
    decode_timestamp_token, embedded_certificates, parse_signed_data, timestamp_over,
};

const PEM_CMS_TAG: &str = "CMS";

/// Source of RFC 3161 timestamp tokens.
#[cfg_attr(test, mockall::automock)]
pub trait TimestampClient: Send + Sync {
    /// Requests a token over `digest`, returning the DER `TimeStampToken`.
    ///
    /// Failures must be reported as [`Error::TimestampUnavailable`].
    fn request_timestamp(&self, alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>>;
}

/// DER encoded `ContentInfo(SignedData)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureContainer {
    der: Vec<u8>,
}

impl SignatureContainer {
    /// Wraps DER bytes after checking they hold a `SignedData`
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        verifier::parse_signed_data(&der)?;
        Ok(Self { der })
    }

    pub fn from_base64(text: impl AsRef<[u8]>) -> Result<Self> {
        let der = BASE64
            .decode(text.as_ref().trim_ascii())
            .map_err(|e| Error::MalformedContainer(format!("invalid base64: {e}")))?;
        Self::from_der(der)
    }

    pub fn from_pem(text: impl AsRef<[u8]>) -> Result<Self> {
        let pem = pem::parse(text)
            .map_err(|e| Error::MalformedContainer(format!("invalid PEM: {e}")))?;
        Self::from_der(pem.into_contents())
    }

    /// Accepts PEM, base64 or DER
    pub fn from_any(bytes: &[u8]) -> Result<Self> {
        let trimmed = bytes.trim_ascii();
        if trimmed.starts_with(b"-----BEGIN") {
            Self::from_pem(trimmed)
        } else if trimmed.first() == Some(&0x30) {
            Self::from_der(trimmed)
        } else {
            Self::from_base64(trimmed)
        }
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn into_der(self) -> Vec<u8> {
        self.der
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.der)
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_CMS_TAG, self.der.clone()))
    }

    /// True when the payload is not embedded
    pub fn is_detached(&self) -> Result<bool> {
        let signed_data = verifier::parse_signed_data(&self.der)?;
        Ok(signed_data.encap_content_info.content.is_none())
    }
}

impl AsRef<[u8]> for SignatureContainer {
    fn as_ref(&self) -> &[u8] {
        &self.der
    }
}

/// Arguments of [`SignatureEngine::verify`]
#[derive(Debug, Clone, Copy)]
pub struct VerifyInput<'a> {
    /// DER container bytes
    pub signature: &'a [u8],
    /// The signed payload, required for detached containers
    pub data: Option<&'a [u8]>,
    pub is_detached: bool,
    pub must_check_cert_time: bool,
}

/// Outcome of a successful verification
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub signers: Vec<SignerReport>,
    /// Every certificate in the container, in encoded order
    pub certificates: Vec<Certificate>,
    /// The embedded payload of an attached container
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl VerifyReport {
    /// The first signer
    pub fn signer(&self) -> &SignerReport {
        &self.signers[0]
    }
}

/// Signs and verifies CMS containers.
pub struct SignatureEngine {
    keystore: Arc<KeyStore>,
    crypto: Arc<dyn CryptoBackend>,
    tsa: Option<Arc<dyn TimestampClient>>,
}

impl SignatureEngine {
    pub fn new(keystore: Arc<KeyStore>, crypto: Arc<dyn CryptoBackend>) -> Self {
        Self {
            keystore,
            crypto,
            tsa: None,
        }
    }

    pub fn with_timestamp_client(mut self, tsa: Arc<dyn TimestampClient>) -> Self {
        self.tsa = Some(tsa);
        self
    }

    /// Signs `data` with the loaded identity.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn sign(&self, data: &[u8], detached: bool, with_timestamp: bool) -> Result<SignatureContainer> {
        let hash = self
            .keystore
            .with_identity(|identity| Ok(identity.hash_algorithm()))?;
        let digest = hash.hash(data)?;
        let content = (!detached).then_some(data);
        self.sign_digest(hash, &digest, content, with_timestamp)
    }

    /// Signs a digest computed elsewhere; the container is always detached.
    #[instrument(skip(self, digest))]
    pub fn sign_hash(
        &self,
        alg: HashAlg,
        digest: &[u8],
        detached: bool,
        with_timestamp: bool,
    ) -> Result<SignatureContainer> {
        if !detached {
            return Err(Error::InvalidInput(
                "an attached container needs the payload, not its hash".into(),
            ));
        }
        if digest.len() != alg.output_size() {
            return Err(Error::InvalidInput(format!(
                "{alg} digest must be {} bytes, got {}",
                alg.output_size(),
                digest.len()
            )));
        }
        self.sign_digest(alg, digest, None, with_timestamp)
    }

    fn sign_digest(
        &self,
        hash: HashAlg,
        digest: &[u8],
        content: Option<&[u8]>,
        with_timestamp: bool,
    ) -> Result<SignatureContainer> {
        let tsa = if with_timestamp {
            Some(self.tsa.as_ref().ok_or_else(|| {
                Error::TimestampUnavailable("no timestamp authority configured".into())
            })?)
        } else {
            None
        };

        let der = self.keystore.with_identity(|identity| {
            if identity.hash_algorithm() != hash {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "{} keys sign with {}, not {hash}",
                    identity.key_algorithm(),
                    identity.hash_algorithm()
                )));
            }

            let signed_attrs = builder::signed_attributes(ID_DATA, digest, Utc::now())?;
            let attrs_digest = hash.hash(rasn::der::encode(&signed_attrs)?)?;
            let signature = self.crypto.sign_digest(identity.key(), hash, &attrs_digest)?;

            let timestamp_token = match tsa {
                Some(tsa) => {
                    let imprint = hash.hash(&signature)?;
                    Some(tsa.request_timestamp(hash, &imprint).map_err(|e| match e {
                        Error::TimestampUnavailable(_) => e,
                        other => Error::TimestampUnavailable(other.to_string()),
                    })?)
                }
                None => None,
            };

            let mut certificates = vec![identity.certificate().clone()];
            certificates.extend(identity.chain().iter().cloned());

            builder::assemble(builder::SignerParts {
                content_type: ID_DATA,
                content,
                hash,
                key_algorithm: identity.key_algorithm(),
                signed_attrs,
                signature,
                timestamp_token,
                certificates: &certificates,
            })
        })?;

        info!(
            detached = content.is_none(),
            timestamped = with_timestamp,
            size = der.len(),
            "CMS signature created"
        );
        Ok(SignatureContainer { der })
    }

    /// Verifies a container. Trust and revocation are left to the validator.
    #[instrument(skip(self, input), fields(detached = input.is_detached))]
    pub fn verify(&self, input: &VerifyInput<'_>) -> Result<VerifyReport> {
        let signed_data = verifier::parse_signed_data(input.signature)?;
        let embedded = signed_data.encap_content_info.content.as_ref();

        let content: &[u8] = match (input.is_detached, embedded, input.data) {
            (true, Some(_), _) => {
                return Err(Error::MalformedContainer(
                    "container embeds its payload but was verified as detached".into(),
                ));
            }
            (true, None, Some(data)) => data,
            (true, None, None) => {
                return Err(Error::InvalidInput(
                    "detached verification needs the signed data".into(),
                ));
            }
            (false, Some(content), _) => content.as_ref(),
            (false, None, _) => {
                return Err(Error::MalformedContainer(
                    "container carries no payload, verify it as detached".into(),
                ));
            }
        };

        let signers = verifier::verify_signers(&signed_data, content, self.crypto.as_ref(), true)?;
        if input.must_check_cert_time {
            let now = Utc::now();
            for signer in &signers {
                signer.certificate.check_time(now)?;
            }
        }

        let certificates = verifier::embedded_certificates(&signed_data)?
            .into_iter()
            .map(|(_, cert)| cert)
            .collect();
        debug!(signers = signers.len(), "CMS signature verified");

        Ok(VerifyReport {
            signers,
            certificates,
            content: embedded.map(|c| c.to_vec()),
        })
    }

    pub fn verify_detached(&self, signature: &[u8], data: &[u8]) -> Result<VerifyReport> {
        self.verify(&VerifyInput {
            signature,
            data: Some(data),
            is_detached: true,
            must_check_cert_time: false,
        })
    }

    /// When the container was signed.
    ///
    /// Prefers the timestamp token's time over the signer's own `signingTime`.
    pub fn signing_time(&self, signature: &[u8]) -> Result<DateTime<Utc>> {
        let signed_data = verifier::parse_signed_data(signature)?;
        let signer_infos = signed_data.signer_infos.to_vec();
        let signer_info = signer_infos
            .first()
            .ok_or_else(|| Error::MalformedContainer("container holds no SignerInfo".into()))?;
        signing_time_of(signer_info, self.crypto.as_ref())
    }
}

fn signing_time_of(
    signer_info: &rasn_cms::SignerInfo,
    crypto: &dyn CryptoBackend,
) -> Result<DateTime<Utc>> {
    use crate::asn1::oid::{SIGNING_TIME_OID, TIMESTAMP_TOKEN_OID};

    let find = |attrs: Option<&rasn::types::SetOf<rasn_cms::Attribute>>, oid: &[u32]| {
        attrs.and_then(|attrs| {
            attrs
                .to_vec()
                .into_iter()
                .find(|attr| attr.r#type.as_ref() == oid)
                .and_then(|attr| attr.values.to_vec().first().map(|v| (*v).clone()))
        })
    };

    if let Some(token) = find(signer_info.unsigned_attrs.as_ref(), TIMESTAMP_TOKEN_OID) {
        let (tst_info, _) = decode_timestamp_token(token.as_bytes(), crypto)?;
        return Ok(tst_info.gen_time.with_timezone(&Utc));
    }
    if let Some(value) = find(signer_info.signed_attrs.as_ref(), SIGNING_TIME_OID) {
        return verifier::decode_time(&value);
    }
    Err(Error::MalformedContainer(
        "container has neither a timestamp nor a signingTime".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OpensslBackend;
    use crate::test_utils;

    fn engine() -> (SignatureEngine, test_utils::TestIdentity) {
        let identity = test_utils::identity();
        let engine = SignatureEngine::new(identity.keystore(), Arc::new(OpensslBackend));
        (engine, identity)
    }

    #[test]
    fn test_attached_round_trip() {
        let (engine, identity) = engine();
        let container = engine.sign(b"attached payload", false, false).unwrap();
        assert!(!container.is_detached().unwrap());

        let report = engine
            .verify(&VerifyInput {
                signature: container.as_der(),
                data: None,
                is_detached: false,
                must_check_cert_time: true,
            })
            .unwrap();
        assert_eq!(report.signer().certificate.der(), identity.cert_der.as_slice());
        assert_eq!(report.signer().hash_algorithm, HashAlg::Sha256);
        assert!(report.signer().signing_time.is_some());
        assert_eq!(report.content.as_deref(), Some(&b"attached payload"[..]));
        assert_eq!(report.certificates.len(), 2);
    }

    #[test]
    fn test_detached_mismatch() {
        let (engine, _) = engine();
        let container = engine.sign(b"hello", true, false).unwrap();
        assert!(container.is_detached().unwrap());

        assert!(engine.verify_detached(container.as_der(), b"hello").is_ok());
        assert!(matches!(
            engine.verify_detached(container.as_der(), b"hello!"),
            Err(Error::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_mode_confusion_is_rejected() {
        let (engine, _) = engine();
        let attached = engine.sign(b"data", false, false).unwrap();
        assert!(matches!(
            engine.verify_detached(attached.as_der(), b"data"),
            Err(Error::MalformedContainer(_))
        ));

        let detached = engine.sign(b"data", true, false).unwrap();
        let err = engine
            .verify(&VerifyInput {
                signature: detached.as_der(),
                data: None,
                is_detached: false,
                must_check_cert_time: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::MalformedContainer(_)));
    }

    #[test]
    fn test_sign_hash() {
        let (engine, _) = engine();
        let digest = HashAlg::Sha256.hash(b"precomputed").unwrap();
        let container = engine.sign_hash(HashAlg::Sha256, &digest, true, false).unwrap();
        assert!(engine.verify_detached(container.as_der(), b"precomputed").is_ok());

        assert!(matches!(
            engine.sign_hash(HashAlg::Sha256, &digest[..31], true, false),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine.sign_hash(HashAlg::Sha256, &digest, false, false),
            Err(Error::InvalidInput(_))
        ));
        let gost = HashAlg::Gost34311.hash(b"precomputed").unwrap();
        assert!(matches!(
            engine.sign_hash(HashAlg::Gost34311, &gost, true, false),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_timestamp_failure_is_surfaced() {
        let (engine, _) = engine();
        let mut tsa = MockTimestampClient::new();
        tsa.expect_request_timestamp()
            .returning(|_, _| Err(Error::TimestampUnavailable("tsa down".into())));
        let engine = engine.with_timestamp_client(Arc::new(tsa));

        assert!(matches!(
            engine.sign(b"data", true, true),
            Err(Error::TimestampUnavailable(_))
        ));
    }

    #[test]
    fn test_timestamped_signature() {
        let (engine, _) = engine();
        let engine = engine.with_timestamp_client(Arc::new(test_utils::FakeTsa::new()));
        let container = engine.sign(b"stamped", true, true).unwrap();

        let report = engine.verify_detached(container.as_der(), b"stamped").unwrap();
        let timestamp = report.signer().timestamp.as_ref().unwrap();
        assert_eq!(timestamp.policy, "1.2.3.4");
        assert_eq!(timestamp.hash_algorithm, HashAlg::Sha256);
        assert_eq!(
            timestamp.authority.as_ref().map(|c| c.subject.as_str()),
            Some("CN=Test TSA")
        );
        assert_eq!(engine.signing_time(container.as_der()).unwrap(), timestamp.gen_time);
    }

    #[test]
    fn test_timestamp_without_client() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.sign(b"data", true, true),
            Err(Error::TimestampUnavailable(_))
        ));
    }

    #[test]
    fn test_signing_time_and_encodings() {
        let (engine, _) = engine();
        let before = Utc::now() - chrono::Duration::seconds(2);
        let container = engine.sign(b"data", true, false).unwrap();

        let time = engine.signing_time(container.as_der()).unwrap();
        assert!(time >= before);

        let from_pem = SignatureContainer::from_any(container.to_pem().as_bytes()).unwrap();
        let from_b64 = SignatureContainer::from_any(container.to_base64().as_bytes()).unwrap();
        assert_eq!(from_pem, container);
        assert_eq!(from_b64, container);
    }

    #[test]
    fn test_malformed_container() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.verify_detached(b"\x30\x03\x02\x01\x01", b"data"),
            Err(Error::MalformedContainer(_))
        ));
        assert!(matches!(
            SignatureContainer::from_der(b"garbage".to_vec()),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_closed_store() {
        let (engine, identity) = engine();
        engine.keystore.close();
        assert!(matches!(engine.sign(b"data", true, false), Err(Error::Closed)));
        drop(identity);
    }
}
