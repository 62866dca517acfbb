use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use quick_xml::events::BytesStart;
use quick_xml::se::to_string_with_root as xml_to_string;
use tracing::info;

use crate::crypto::CryptoBackend;
use crate::error::{Error, Result};
use crate::pki::keystore::SigningIdentity;
use crate::xmldsig::utils::ElementSpan;
use crate::xmldsig::*;

/// The SOAP namespace and envelope prefix of the document
pub(crate) fn soap_envelope(xml: &str) -> Result<(&'static str, String)> {
    let mut soap_ns = None;
    let root = utils::find_element(xml, |tag| {
        soap_ns = [ns::SOAP11, ns::SOAP12]
            .into_iter()
            .find(|candidate| tag.is(candidate, "Envelope"));
        true
    })?
    .ok_or_else(|| Error::MalformedXml("document has no root element".into()))?;

    let soap_ns = soap_ns.ok_or_else(|| {
        Error::InvalidInput(format!("root element {} is not a SOAP Envelope", root.name))
    })?;
    let prefix = root
        .name
        .split_once(':')
        .map(|(prefix, _)| prefix.to_owned())
        .unwrap_or_default();
    Ok((soap_ns, prefix))
}

fn body_with_id(start: &BytesStart<'_>, reference_id: &str) -> Result<BytesStart<'static>> {
    let name = std::str::from_utf8(start.name().as_ref())?.to_owned();
    let mut tag = BytesStart::new(name);
    for attr in start.attributes().with_checks(false) {
        let attr = attr?;
        let key = attr.key.as_ref();
        if key == b"xmlns:wsu" || matches!(attr.key.local_name().as_ref(), b"Id" | b"ID") {
            continue;
        }
        tag.push_attribute(attr);
    }
    tag.push_attribute(("xmlns:wsu", ns::WSU));
    tag.push_attribute(("wsu:Id", reference_id));
    Ok(tag.into_owned())
}

/// The Body that is a child of the Envelope
pub(crate) fn find_body(xml: &str, soap_ns: &str) -> Result<ElementSpan> {
    utils::find_element(xml, |tag| tag.depth == 1 && tag.is(soap_ns, "Body"))?
        .ok_or_else(|| Error::MalformedXml("SOAP envelope has no Body".into()))
}

/// Signs the SOAP Body and places a `wsse:Security` header in the envelope.
pub(crate) fn sign_envelope(
    xml: &str,
    reference_id: &str,
    identity: &SigningIdentity,
    crypto: &dyn CryptoBackend,
) -> Result<String> {
    if reference_id.is_empty() || reference_id.contains(char::is_whitespace) {
        return Err(Error::InvalidInput(format!(
            "'{reference_id}' is not a valid element identifier"
        )));
    }
    let (soap_ns, prefix) = soap_envelope(xml)?;

    let body = find_body(xml, soap_ns)?;
    let xml = utils::rewrite_start_tag(xml, &body, |start| body_with_id(start, reference_id))?;

    let body = find_body(&xml, soap_ns)?;
    let body_c14n = c14n::canonicalize(utils::subtree_with_ns(&xml, &body)?, None)?;
    let reference = signer::reference(
        format!("#{reference_id}"),
        &[algorithms::EXCLUSIVE_C14N],
        identity.hash_algorithm(),
        &body_c14n,
    )?;
    let (signed_info, signature_value) = signer::sign_references(identity, crypto, vec![reference])?;

    let token_id = format!("X509-{}", uuid::Uuid::new_v4());
    let security = Security {
        xmlns_wsse: ns::WSSE,
        xmlns_wsu: ns::WSU,
        token: BinarySecurityToken {
            encoding_type: algorithms::BASE64_BINARY,
            value_type: algorithms::X509V3,
            id: token_id.clone(),
            value: identity.certificate().to_base64(),
        },
        signature: Signature {
            xmlns: Some(ns::DS.into()),
            id: None,
            signed_info,
            signature_value: BASE64.encode(&signature_value),
            key_info: Some(KeyInfo {
                x509_data: None,
                security_token_ref: Some(SecurityTokenReference {
                    xmlns: None,
                    reference: Some(TokenReference {
                        uri: format!("#{token_id}"),
                        value_type: Some(algorithms::X509V3.into()),
                    }),
                }),
            }),
            object: None,
        },
    };
    let security_xml = xml_to_string("wsse:Security", &security)?;

    let header = utils::find_element(&xml, |tag| tag.depth == 1 && tag.is(soap_ns, "Header"))?;
    let signed = match header {
        Some(header) => utils::prepend_child(&xml, &header, &security_xml),
        None => {
            let header_name = if prefix.is_empty() {
                "Header".to_owned()
            } else {
                format!("{prefix}:Header")
            };
            let header_xml = format!("<{header_name}>{security_xml}</{header_name}>");
            utils::insert_before(&xml, &body, &header_xml)
        }
    };

    info!(reference_id, token_id, "SOAP envelope signed");
    Ok(signed)
}
