use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use quick_xml::de::from_str as xml_from_str;
use tracing::{debug, info};

use crate::cms::timestamp_over;
use crate::crypto::{CryptoBackend, HashAlg, KeyAlgorithm, ecdsa_raw_to_der, signature_method_from_uri};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::xmldsig::utils::ElementSpan;
use crate::xmldsig::*;

/// Decodes base64 that may be wrapped over several lines
pub(crate) fn decode_base64(text: &str, what: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| Error::MalformedXml(format!("{what} is not valid base64: {e}")))
}

fn find_signature(xml: &str) -> Result<(ElementSpan, Signature)> {
    let span = utils::find_element(xml, |tag| tag.is(ns::DS, "Signature"))?
        .ok_or(Error::NoSignaturePresent)?;
    let signature: Signature = xml_from_str(&utils::subtree_with_ns(xml, &span)?)?;
    Ok((span, signature))
}

/// `SignatureMethod/@Algorithm` of the first signature
pub(crate) fn signature_algorithm(xml: &str) -> Result<String> {
    let (_, signature) = find_signature(xml)?;
    Ok(signature.signed_info.signature_method.algorithm)
}

/// Reproduces the octets a reference digest was computed over.
fn dereference(xml: &str, signature_span: &ElementSpan, reference: &Reference) -> Result<String> {
    let transforms = reference
        .transforms
        .as_ref()
        .map(|t| t.transform.as_slice())
        .unwrap_or_default();

    let mut document = xml.to_owned();
    let mut canonical: Option<&Transform> = None;
    for transform in transforms {
        match transform.algorithm.as_str() {
            algorithms::ENVELOPED_SIGNATURE => document = utils::strip_span(xml, signature_span),
            algorithms::EXCLUSIVE_C14N => canonical = Some(transform),
            other => {
                return Err(Error::UnsupportedAlgorithm(format!("transform {other}")));
            }
        }
    }

    let target = match reference.uri.as_str() {
        "" => document,
        uri => {
            let id = uri.strip_prefix('#').ok_or_else(|| {
                Error::UnsupportedAlgorithm(format!("external reference {uri}"))
            })?;
            let span = utils::find_by_id(&document, id)?.ok_or_else(|| {
                Error::ReferenceMismatch(format!("referenced element {uri} not found"))
            })?;
            utils::subtree_with_ns(&document, &span)?
        }
    };

    // Without an explicit canonicalization transform the node set is still
    // serialized with exclusive C14N
    let prefixes = canonical.and_then(Transform::prefixes);
    c14n::canonicalize(target, prefixes.as_deref())
}

fn check_references(xml: &str, signature_span: &ElementSpan, signed_info: &SignedInfo) -> Result<()> {
    if signed_info.references.is_empty() {
        return Err(Error::MalformedXml("SignedInfo has no Reference".into()));
    }
    for reference in &signed_info.references {
        let hash = HashAlg::from_uri(&reference.digest_method.algorithm)?;
        let octets = dereference(xml, signature_span, reference)?;
        let expected = decode_base64(&reference.digest_value, "DigestValue")?;
        if hash.hash(octets.as_bytes())? != expected {
            return Err(Error::ReferenceMismatch(format!(
                "digest of reference '{}' does not match",
                reference.uri
            )));
        }
        debug!(uri = %reference.uri, "reference digest verified");
    }
    Ok(())
}

/// Every reference of a WS-Security signature must resolve to the Body
/// child of the Envelope.
fn check_soap_body(xml: &str, signed_info: &SignedInfo) -> Result<()> {
    let (soap_ns, _) = wsse::soap_envelope(xml)?;
    let body = wsse::find_body(xml, soap_ns)?;
    for reference in &signed_info.references {
        let target = match reference.uri.strip_prefix('#') {
            Some(id) => utils::find_by_id(xml, id)?,
            None => None,
        };
        if target.map(|span| span.start) != Some(body.start) {
            return Err(Error::ReferenceMismatch(format!(
                "reference '{}' does not point at the SOAP Body",
                reference.uri
            )));
        }
    }
    Ok(())
}

/// The certificate named by `KeyInfo`
fn signer_certificate(xml: &str, key_info: Option<&KeyInfo>) -> Result<Certificate> {
    let key_info = key_info.ok_or(Error::NoCertificatePresent)?;

    if let Some(text) = key_info
        .x509_data
        .as_ref()
        .and_then(|data| data.certificates.first())
    {
        return Certificate::from_der(decode_base64(text, "X509Certificate")?);
    }

    let uri = key_info
        .security_token_ref
        .as_ref()
        .and_then(|str_ref| str_ref.reference.as_ref())
        .map(|r| r.uri.as_str())
        .ok_or(Error::NoCertificatePresent)?;
    let id = uri.strip_prefix('#').ok_or(Error::NoCertificatePresent)?;
    let token = utils::find_element(xml, |tag| {
        tag.is(ns::WSSE, "BinarySecurityToken") && tag.id().as_deref() == Some(id)
    })?
    .ok_or(Error::NoCertificatePresent)?;
    Certificate::from_der(decode_base64(&utils::element_text(xml, &token)?, "BinarySecurityToken")?)
}

fn signed_info_c14n(xml: &str, signature_span: &ElementSpan, signed_info: &SignedInfo) -> Result<String> {
    if signed_info.canon_method.algorithm != algorithms::EXCLUSIVE_C14N {
        return Err(Error::UnsupportedAlgorithm(format!(
            "canonicalization {}",
            signed_info.canon_method.algorithm
        )));
    }
    let span = utils::find_elements(xml, |tag| tag.is(ns::DS, "SignedInfo"))?
        .into_iter()
        .find(|span| span.start > signature_span.start && span.end <= signature_span.end)
        .ok_or_else(|| Error::MalformedXml("Signature has no SignedInfo".into()))?;
    let prefixes = signed_info.canon_method.prefixes();
    c14n::canonicalize(utils::subtree_with_ns(xml, &span)?, prefixes.as_deref())
}

fn embedded_timestamp(
    signature: &Signature,
    signature_value: &[u8],
    crypto: &dyn CryptoBackend,
) -> Result<Option<TimestampInfo>> {
    let Some(object) = signature.object.as_ref() else {
        return Ok(None);
    };
    let encapsulated = &object
        .qualifying_properties
        .unsigned_properties
        .unsigned_signature_properties
        .signature_timestamp
        .encapsulated;
    let token = decode_base64(encapsulated, "EncapsulatedTimeStamp")?;
    timestamp_over(&token, signature_value, crypto).map(Some)
}

pub(crate) fn verify(
    xml: &str,
    must_check_cert_time: bool,
    crypto: &dyn CryptoBackend,
) -> Result<XmlVerifyReport> {
    let (span, signature) = find_signature(xml)?;
    let signed_info = &signature.signed_info;
    let (key_algorithm, hash) = signature_method_from_uri(&signed_info.signature_method.algorithm)?;

    let canonical_signed_info = signed_info_c14n(xml, &span, signed_info)?;
    check_references(xml, &span, signed_info)?;
    let wsse_signature = signature
        .key_info
        .as_ref()
        .is_some_and(|key_info| key_info.security_token_ref.is_some());
    if wsse_signature {
        check_soap_body(xml, signed_info)?;
    }

    let certificate = signer_certificate(xml, signature.key_info.as_ref())?;
    if certificate.key_algorithm()? != key_algorithm {
        return Err(Error::SignatureMismatch(format!(
            "{} certificate cannot verify a {key_algorithm} signature",
            certificate.key_algorithm()?
        )));
    }

    let signature_value = decode_base64(&signature.signature_value, "SignatureValue")?;
    let der_signature = match key_algorithm {
        KeyAlgorithm::Ecdsa => ecdsa_raw_to_der(&signature_value)
            .map_err(|_| Error::SignatureMismatch("malformed ECDSA signature value".into()))?,
        _ => signature_value.clone(),
    };
    let digest = hash.hash(canonical_signed_info.as_bytes())?;
    let spki = certificate.public_key_der()?;
    if !crypto.verify_digest(&spki, hash, &digest, &der_signature)? {
        return Err(Error::SignatureMismatch(format!(
            "SignatureValue of {} does not verify",
            certificate.subject
        )));
    }

    if must_check_cert_time {
        certificate.check_time(Utc::now())?;
    }
    let timestamp = embedded_timestamp(&signature, &signature_value, crypto)?;

    info!(signer = %certificate.subject, alg = %hash, "XML signature verified");
    Ok(XmlVerifyReport {
        certificate,
        signature_algorithm: signed_info.signature_method.algorithm.clone(),
        hash_algorithm: hash,
        references: signed_info.references.iter().map(|r| r.uri.clone()).collect(),
        timestamp,
    })
}
