use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use quick_xml::se::to_string_with_root as xml_to_string;
use tracing::info;

use crate::cms::TimestampClient;
use crate::crypto::{CryptoBackend, HashAlg, KeyAlgorithm, ecdsa_der_to_raw};
use crate::error::{Error, Result};
use crate::pki::keystore::SigningIdentity;
use crate::xmldsig::*;

/// `Reference` over already canonicalized octets
pub(crate) fn reference(uri: String, transforms: &[&str], hash: HashAlg, c14n: &str) -> Result<Reference> {
    let digest = hash.hash(c14n.as_bytes())?;
    Ok(Reference {
        uri,
        transforms: Some(Transforms {
            transform: transforms.iter().map(|alg| Transform::new(alg)).collect(),
        }),
        digest_method: DigestMethod {
            algorithm: hash.uri().into(),
        },
        digest_value: BASE64.encode(digest),
    })
}

/// Builds `SignedInfo` for `references` and signs its canonical form.
///
/// Returns the `SignedInfo` ready to embed and the `SignatureValue` octets.
pub(crate) fn sign_references(
    identity: &SigningIdentity,
    crypto: &dyn CryptoBackend,
    references: Vec<Reference>,
) -> Result<(SignedInfo, Vec<u8>)> {
    let hash = identity.hash_algorithm();
    let mut signed_info = SignedInfo {
        xmlns: Some(ns::DS.into()),
        canon_method: Transform::new(algorithms::EXCLUSIVE_C14N),
        signature_method: SignatureMethod {
            algorithm: identity.key_algorithm().signature_uri(hash)?.into(),
        },
        references,
    };

    let signed_info_xml = xml_to_string("ds:SignedInfo", &signed_info)?;
    let signed_info_c14n = c14n::canonicalize(&signed_info_xml, None)?;
    let digest = hash.hash(signed_info_c14n.as_bytes())?;
    let mut signature = crypto.sign_digest(identity.key(), hash, &digest)?;

    // XML-DSig carries ECDSA signatures as r || s
    if identity.key_algorithm() == KeyAlgorithm::Ecdsa {
        let spki = identity.certificate().public_key_der()?;
        signature = ecdsa_der_to_raw(&spki, &signature)?;
    }

    // Namespace comes from the enclosing ds:Signature
    signed_info.xmlns = None;
    Ok((signed_info, signature))
}

fn timestamp_object(
    tsa: &dyn TimestampClient,
    hash: HashAlg,
    signature: &[u8],
    signature_id: &str,
) -> Result<DsObject> {
    let imprint = hash.hash(signature)?;
    let token = tsa.request_timestamp(hash, &imprint).map_err(|e| match e {
        Error::TimestampUnavailable(_) => e,
        other => Error::TimestampUnavailable(other.to_string()),
    })?;

    Ok(DsObject {
        qualifying_properties: QualifyingProperties {
            xmlns: Some(ns::XADES.into()),
            target: format!("#{signature_id}"),
            unsigned_properties: UnsignedProperties {
                unsigned_signature_properties: UnsignedSignatureProperties {
                    signature_timestamp: SignatureTimeStamp {
                        encapsulated: BASE64.encode(token),
                    },
                },
            },
        },
    })
}

/// Appends an enveloped `ds:Signature` over the whole document to its root.
pub(crate) fn sign_enveloped(
    xml: &str,
    identity: &SigningIdentity,
    crypto: &dyn CryptoBackend,
    tsa: Option<&dyn TimestampClient>,
) -> Result<String> {
    let root = utils::root_element(xml)?;
    let hash = identity.hash_algorithm();

    let document_c14n = c14n::canonicalize(xml, None)?;
    let reference = reference(
        String::new(),
        &[algorithms::ENVELOPED_SIGNATURE, algorithms::EXCLUSIVE_C14N],
        hash,
        &document_c14n,
    )?;
    let (signed_info, signature_value) = sign_references(identity, crypto, vec![reference])?;

    let signature_id = format!("signature-{}", uuid::Uuid::new_v4());
    let object = tsa
        .map(|tsa| timestamp_object(tsa, hash, &signature_value, &signature_id))
        .transpose()?;

    let signature = Signature {
        xmlns: Some(ns::DS.into()),
        id: Some(signature_id),
        signed_info,
        signature_value: BASE64.encode(&signature_value),
        key_info: Some(KeyInfo {
            x509_data: Some(X509Data {
                certificates: vec![identity.certificate().to_base64()],
            }),
            security_token_ref: None,
        }),
        object,
    };
    let signature_xml = xml_to_string("ds:Signature", &signature)?;

    info!(
        root = %root.name,
        alg = %hash,
        timestamped = tsa.is_some(),
        "XML document signed"
    );
    Ok(utils::append_child(xml, &root, &signature_xml))
}
