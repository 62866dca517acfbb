use chrono::{DateTime, Utc};
use rasn::prelude::{ObjectIdentifier, *};
use rasn_cms::{Attribute, CertificateChoices, ContentInfo, SignedData, SignerIdentifier, SignerInfo};
use serde::Serialize;
use tracing::debug;

use crate::asn1::oid::{
    CONTENT_TYPE_OID, ID_CT_TST_INFO, ID_SIGNED_DATA, MESSAGE_DIGEST_OID, SIGNING_TIME_OID,
    TIMESTAMP_TOKEN_OID, to_dotted,
};
use crate::asn1::tsp::TstInfo;
use crate::crypto::{CryptoBackend, HashAlg, digest_of_signature_oid};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;

/// Details of an embedded RFC 3161 timestamp
#[derive(Debug, Clone, Serialize)]
pub struct TimestampInfo {
    pub gen_time: DateTime<Utc>,
    pub policy: String,
    pub hash_algorithm: HashAlg,
    /// Authority certificate, when the token carries one
    pub authority: Option<Certificate>,
}

/// One verified `SignerInfo`
#[derive(Debug, Clone, Serialize)]
pub struct SignerReport {
    pub certificate: Certificate,
    pub hash_algorithm: HashAlg,
    pub signing_time: Option<DateTime<Utc>>,
    pub timestamp: Option<TimestampInfo>,
}

/// Decodes a DER `ContentInfo` and unwraps its `SignedData`
pub(crate) fn parse_signed_data(der: &[u8]) -> Result<SignedData> {
    let content_info: ContentInfo = rasn::der::decode(der)
        .map_err(|e| Error::MalformedContainer(format!("not a CMS ContentInfo: {e}")))?;
    if content_info.content_type.as_ref() != ID_SIGNED_DATA {
        return Err(Error::MalformedContainer(format!(
            "content type {} is not signedData",
            to_dotted(content_info.content_type.as_ref())
        )));
    }
    rasn::der::decode(content_info.content.as_bytes())
        .map_err(|e| Error::MalformedContainer(format!("invalid SignedData: {e}")))
}

/// Every X.509 certificate carried in the container, in encoded order
pub(crate) fn embedded_certificates(
    signed_data: &SignedData,
) -> Result<Vec<(rasn_pkix::Certificate, Certificate)>> {
    let Some(certificates) = signed_data.certificates.as_ref() else {
        return Ok(Vec::new());
    };
    let mut found = Vec::new();
    for choice in certificates.to_vec() {
        let cert = match choice {
            CertificateChoices::Certificate(c) => c.as_ref(),
            _ => continue,
        };
        let der = rasn::der::encode(cert)?;
        found.push((cert.clone(), Certificate::from_der(der)?));
    }
    Ok(found)
}

fn matches_signer(sid: &SignerIdentifier, cert: &rasn_pkix::Certificate) -> bool {
    // OID for Subject Key Identifier: 2.5.29.14
    const SKI_OID: &[u32] = &[2, 5, 29, 14];

    match sid {
        SignerIdentifier::IssuerAndSerialNumber(issuer_and_serial) => {
            issuer_and_serial.issuer == cert.tbs_certificate.issuer
                && issuer_and_serial.serial_number == cert.tbs_certificate.serial_number
        }
        SignerIdentifier::SubjectKeyIdentifier(subject_key_id) => cert
            .tbs_certificate
            .extensions
            .as_ref()
            .and_then(|exts| exts.iter().find(|ext| ext.extn_id.as_ref() == SKI_OID))
            .and_then(|ext| rasn::der::decode::<OctetString>(&ext.extn_value).ok())
            .is_some_and(|ski| ski.as_ref() == subject_key_id.as_ref()),
    }
}

fn first_value(attrs: &[Attribute], oid: &[u32]) -> Option<Any> {
    attrs
        .iter()
        .find(|attr| attr.r#type.as_ref() == oid)
        .and_then(|attr| attr.values.to_vec().first().map(|v| (*v).clone()))
}

pub(crate) fn decode_time(value: &Any) -> Result<DateTime<Utc>> {
    let bytes = value.as_bytes();
    match bytes.first() {
        Some(0x17) => Ok(rasn::der::decode::<UtcTime>(bytes)?),
        Some(0x18) => Ok(rasn::der::decode::<GeneralizedTime>(bytes)?.with_timezone(&Utc)),
        _ => Err(Error::MalformedContainer(
            "signingTime is neither UTCTime nor GeneralizedTime".into(),
        )),
    }
}

/// Builds the digest that the signature value covers.
///
/// With signed attributes this checks `contentType` and `messageDigest`
/// against the content and returns the hash of their DER `SET OF`.
fn signature_input(
    signer_info: &SignerInfo,
    content_type: &ObjectIdentifier,
    content_digest: &[u8],
    hash: HashAlg,
) -> Result<(Vec<u8>, Option<DateTime<Utc>>)> {
    let Some(signed_attrs) = signer_info.signed_attrs.as_ref() else {
        return Ok((content_digest.to_vec(), None));
    };
    let attrs: Vec<Attribute> = signed_attrs.to_vec().into_iter().cloned().collect();

    let declared_type = first_value(&attrs, CONTENT_TYPE_OID)
        .ok_or_else(|| Error::MalformedContainer("missing contentType attribute".into()))?;
    let declared_type: ObjectIdentifier = rasn::der::decode(declared_type.as_bytes())?;
    if &declared_type != content_type {
        return Err(Error::SignatureMismatch(
            "contentType attribute does not match eContentType".into(),
        ));
    }

    let message_digest = first_value(&attrs, MESSAGE_DIGEST_OID)
        .ok_or_else(|| Error::MalformedContainer("missing messageDigest attribute".into()))?;
    let message_digest: OctetString = rasn::der::decode(message_digest.as_bytes())?;
    if message_digest.len() != hash.output_size() {
        return Err(Error::SignatureMismatch(format!(
            "messageDigest length {} does not fit {hash}",
            message_digest.len()
        )));
    }
    if message_digest.as_ref() != content_digest {
        return Err(Error::SignatureMismatch(
            "message digest does not match the signed content".into(),
        ));
    }

    let signing_time = first_value(&attrs, SIGNING_TIME_OID)
        .map(|v| decode_time(&v))
        .transpose()?;

    // RFC 5652 5.4: the signature covers the DER encoding of SignedAttributes
    let der = rasn::der::encode(signed_attrs)?;
    Ok((hash.hash(der)?, signing_time))
}

/// Verifies every `SignerInfo` of `signed_data` over `content`.
pub(crate) fn verify_signers(
    signed_data: &SignedData,
    content: &[u8],
    crypto: &dyn CryptoBackend,
    with_timestamps: bool,
) -> Result<Vec<SignerReport>> {
    let certificates = embedded_certificates(signed_data)?;
    let signer_infos = signed_data.signer_infos.to_vec();
    if signer_infos.is_empty() {
        return Err(Error::MalformedContainer("container holds no SignerInfo".into()));
    }

    let mut reports = Vec::with_capacity(signer_infos.len());
    for signer_info in signer_infos {
        let hash = HashAlg::from_oid(signer_info.digest_algorithm.algorithm.as_ref())?;
        if let Some(implied) = digest_of_signature_oid(signer_info.signature_algorithm.algorithm.as_ref())?
            && implied != hash
        {
            return Err(Error::SignatureMismatch(format!(
                "signature algorithm implies {implied} but the digest algorithm is {hash}"
            )));
        }

        let (_, certificate) = certificates
            .iter()
            .find(|(raw, _)| matches_signer(&signer_info.sid, raw))
            .ok_or(Error::NoCertificatePresent)?;

        let content_digest = hash.hash(content)?;
        let (input, signing_time) = signature_input(
            signer_info,
            &signed_data.encap_content_info.content_type,
            &content_digest,
            hash,
        )?;

        let spki = certificate.public_key_der()?;
        if !crypto.verify_digest(&spki, hash, &input, signer_info.signature.as_ref())? {
            return Err(Error::SignatureMismatch(format!(
                "signature of {} does not verify",
                certificate.subject
            )));
        }
        debug!(signer = %certificate.subject, alg = %hash, "signer verified");

        let timestamp = if with_timestamps {
            embedded_timestamp(signer_info, crypto)?
        } else {
            None
        };

        reports.push(SignerReport {
            certificate: certificate.clone(),
            hash_algorithm: hash,
            signing_time,
            timestamp,
        });
    }
    Ok(reports)
}

/// Checks the `id-aa-timeStampToken` unsigned attribute, if any.
///
/// The token imprint must cover the signature value.
fn embedded_timestamp(
    signer_info: &SignerInfo,
    crypto: &dyn CryptoBackend,
) -> Result<Option<TimestampInfo>> {
    let Some(unsigned_attrs) = signer_info.unsigned_attrs.as_ref() else {
        return Ok(None);
    };
    let attrs: Vec<Attribute> = unsigned_attrs.to_vec().into_iter().cloned().collect();
    let Some(token) = first_value(&attrs, TIMESTAMP_TOKEN_OID) else {
        return Ok(None);
    };

    timestamp_over(token.as_bytes(), signer_info.signature.as_ref(), crypto).map(Some)
}

/// Checks that a timestamp token covers `signature` and describes it.
pub(crate) fn timestamp_over(
    token: &[u8],
    signature: &[u8],
    crypto: &dyn CryptoBackend,
) -> Result<TimestampInfo> {
    let (tst_info, authority) = decode_timestamp_token(token, crypto)?;
    let imprint = &tst_info.message_imprint;
    let hash = HashAlg::from_oid(imprint.hash_algorithm.algorithm.as_ref())?;
    if hash.hash(signature)? != imprint.hashed_message.as_ref() {
        return Err(Error::SignatureMismatch(
            "timestamp does not cover the signature value".into(),
        ));
    }

    Ok(TimestampInfo {
        gen_time: tst_info.gen_time.with_timezone(&Utc),
        policy: to_dotted(tst_info.policy.as_ref()),
        hash_algorithm: hash,
        authority,
    })
}

/// Verifies a timestamp token's own signature and decodes its TSTInfo.
pub(crate) fn decode_timestamp_token(
    token: &[u8],
    crypto: &dyn CryptoBackend,
) -> Result<(TstInfo, Option<Certificate>)> {
    let signed_data = parse_signed_data(token)?;
    if signed_data.encap_content_info.content_type.as_ref() != ID_CT_TST_INFO {
        return Err(Error::MalformedContainer(
            "timestamp token does not encapsulate TSTInfo".into(),
        ));
    }
    let content = signed_data
        .encap_content_info
        .content
        .as_ref()
        .ok_or_else(|| Error::MalformedContainer("timestamp token has no TSTInfo".into()))?;

    // Tokens requested without certReq carry no certificate to check against
    let authority = if embedded_certificates(&signed_data)?.is_empty() {
        None
    } else {
        let reports = verify_signers(&signed_data, content, crypto, false)?;
        reports.into_iter().next().map(|r| r.certificate)
    };

    let tst_info = TstInfo::from_der(content)
        .map_err(|e| Error::MalformedContainer(format!("invalid TSTInfo: {e}")))?;
    Ok((tst_info, authority))
}
