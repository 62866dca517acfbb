use chrono::{DateTime, SubsecRound, Utc};
use rasn::prelude::{ObjectIdentifier as Oid, *};
use rasn_cms::{
    AlgorithmIdentifier, Attribute, CertificateChoices, ContentInfo, EncapsulatedContentInfo,
    IssuerAndSerialNumber, SignedData, SignerIdentifier, SignerInfo,
};

use crate::asn1::oid::{
    CONTENT_TYPE_OID, ID_SIGNED_DATA, MESSAGE_DIGEST_OID, SIGNING_TIME_OID, TIMESTAMP_TOKEN_OID,
};
use crate::crypto::{HashAlg, KeyAlgorithm};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;

/// DER of an ASN.1 NULL, the parameters of RSA signature algorithms
const DER_NULL: [u8; 2] = [0x05, 0x00];

fn attribute(oid: &'static [u32], value: Vec<u8>) -> Attribute {
    Attribute {
        r#type: Oid::new_unchecked(oid.into()),
        values: vec![Any::new(value)].into(),
    }
}

/// `contentType`, `signingTime` and `messageDigest` signed attributes
pub(crate) fn signed_attributes(
    content_type: &'static [u32],
    digest: &[u8],
    signing_time: DateTime<Utc>,
) -> Result<SetOf<Attribute>> {
    let content_type = rasn::der::encode(&Oid::new_unchecked(content_type.into()))?;
    let signing_time: UtcTime = signing_time.trunc_subsecs(0);
    let message_digest = rasn::der::encode(&OctetString::from(digest.to_vec()))?;

    let mut attrs = SetOf::new();
    attrs.insert(attribute(CONTENT_TYPE_OID, content_type));
    attrs.insert(attribute(SIGNING_TIME_OID, rasn::der::encode(&signing_time)?));
    attrs.insert(attribute(MESSAGE_DIGEST_OID, message_digest));
    Ok(attrs)
}

/// Everything needed to frame one signer into a `SignedData`
pub(crate) struct SignerParts<'a> {
    pub content_type: &'static [u32],
    /// `None` produces a detached container
    pub content: Option<&'a [u8]>,
    pub hash: HashAlg,
    pub key_algorithm: KeyAlgorithm,
    pub signed_attrs: SetOf<Attribute>,
    pub signature: Vec<u8>,
    /// DER `ContentInfo` of an RFC 3161 token
    pub timestamp_token: Option<Vec<u8>>,
    /// Signer certificate first, then the rest of the chain
    pub certificates: &'a [Certificate],
}

fn signature_algorithm(key: KeyAlgorithm, hash: HashAlg) -> Result<AlgorithmIdentifier> {
    let parameters = match key {
        KeyAlgorithm::Rsa => Some(Any::new(DER_NULL.to_vec())),
        KeyAlgorithm::Ecdsa | KeyAlgorithm::Gost34310 => None,
    };
    Ok(AlgorithmIdentifier {
        algorithm: Oid::new_unchecked(key.signature_oid(hash)?.into()),
        parameters,
    })
}

pub(crate) fn digest_algorithm(hash: HashAlg) -> AlgorithmIdentifier {
    AlgorithmIdentifier {
        algorithm: Oid::new_unchecked(hash.oid().into()),
        parameters: None,
    }
}

/// Frames the signer into a DER `ContentInfo(SignedData)`.
pub(crate) fn assemble(parts: SignerParts<'_>) -> Result<Vec<u8>> {
    let signer = parts
        .certificates
        .first()
        .ok_or(Error::NoCertificatePresent)?;
    let signer_cert: rasn_pkix::Certificate = rasn::der::decode(signer.der())?;

    let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
        issuer: signer_cert.tbs_certificate.issuer.clone(),
        serial_number: signer_cert.tbs_certificate.serial_number.clone(),
    });

    let unsigned_attrs = match parts.timestamp_token {
        Some(token) => {
            let mut attrs = SetOf::new();
            attrs.insert(attribute(TIMESTAMP_TOKEN_OID, token));
            Some(attrs)
        }
        None => None,
    };

    let signer_info = SignerInfo {
        version: Integer::from(1),
        sid,
        digest_algorithm: digest_algorithm(parts.hash),
        signed_attrs: Some(parts.signed_attrs),
        signature_algorithm: signature_algorithm(parts.key_algorithm, parts.hash)?,
        signature: OctetString::from(parts.signature),
        unsigned_attrs,
    };

    let mut certificates = SetOf::new();
    certificates.insert(CertificateChoices::Certificate(Box::new(signer_cert)));
    for cert in &parts.certificates[1..] {
        let cert: rasn_pkix::Certificate = rasn::der::decode(cert.der())?;
        certificates.insert(CertificateChoices::Certificate(Box::new(cert)));
    }

    let signed_data = SignedData {
        version: Integer::from(1),
        digest_algorithms: vec![digest_algorithm(parts.hash)].into(),
        encap_content_info: EncapsulatedContentInfo {
            content_type: Oid::new_unchecked(parts.content_type.into()),
            content: parts.content.map(|c| OctetString::from(c.to_vec())),
        },
        certificates: Some(certificates),
        crls: None,
        signer_infos: vec![signer_info].into(),
    };

    let content_info = ContentInfo {
        content_type: Oid::new_unchecked(ID_SIGNED_DATA.into()),
        content: Any::new(rasn::der::encode(&signed_data)?),
    };
    Ok(rasn::der::encode(&content_info)?)
}
