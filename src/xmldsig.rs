//! XML-DSig enveloped signatures and WS-Security headers.

mod c14n;
mod signer;
pub(crate) mod utils;
pub(crate) mod verifier;
mod wsse;

pub use c14n::canonicalize;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cms::{TimestampClient, TimestampInfo};
use crate::crypto::{CryptoBackend, HashAlg};
use crate::error::Result;
use crate::pki::certificate::Certificate;
use crate::pki::keystore::KeyStore;

pub mod algorithms {
    pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
    pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

    // WS-Security X.509 token profile
    pub const BASE64_BINARY: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";
    pub const X509V3: &str =
        "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3";
}

pub mod ns {
    pub const DS: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
    pub const XADES: &str = "http://uri.etsi.org/01903/v1.3.2#";
    pub const WSSE: &str =
        "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
    pub const WSU: &str =
        "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
    pub const SOAP11: &str = "http://schemas.xmlsoap.org/soap/envelope/";
    pub const SOAP12: &str = "http://www.w3.org/2003/05/soap-envelope";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "@xmlns:ds", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,

    #[serde(rename = "@Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename(serialize = "ds:SignedInfo", deserialize = "SignedInfo"))]
    pub signed_info: SignedInfo,

    #[serde(rename(serialize = "ds:SignatureValue", deserialize = "SignatureValue"))]
    pub signature_value: String,

    #[serde(rename(serialize = "ds:KeyInfo", deserialize = "KeyInfo"), default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_info: Option<KeyInfo>,

    #[serde(rename(serialize = "ds:Object", deserialize = "Object"), default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<DsObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedInfo {
    #[serde(rename = "@xmlns:ds", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,

    #[serde(rename(
        serialize = "ds:CanonicalizationMethod",
        deserialize = "CanonicalizationMethod"
    ))]
    pub canon_method: Transform,

    #[serde(rename(serialize = "ds:SignatureMethod", deserialize = "SignatureMethod"))]
    pub signature_method: SignatureMethod,

    #[serde(rename(serialize = "ds:Reference", deserialize = "Reference"), default)]
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMethod {
    #[serde(rename = "@Algorithm")]
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "@URI", default)]
    pub uri: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(rename(serialize = "ds:Transforms", deserialize = "Transforms"))]
    pub transforms: Option<Transforms>,

    #[serde(rename(serialize = "ds:DigestMethod", deserialize = "DigestMethod"))]
    pub digest_method: DigestMethod,

    #[serde(rename(serialize = "ds:DigestValue", deserialize = "DigestValue"))]
    pub digest_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transforms {
    #[serde(rename(serialize = "ds:Transform", deserialize = "Transform"), default)]
    pub transform: Vec<Transform>,
}

/// A `Transform`, also used for `CanonicalizationMethod`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    #[serde(rename = "@Algorithm")]
    pub algorithm: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(rename(serialize = "ec:InclusiveNamespaces", deserialize = "InclusiveNamespaces"))]
    pub inclusive_ns: Option<InclusiveNamespaces>,
}

impl Transform {
    pub fn new(algorithm: &str) -> Self {
        Self {
            algorithm: algorithm.into(),
            inclusive_ns: None,
        }
    }

    pub(crate) fn prefixes(&self) -> Option<Vec<&str>> {
        self.inclusive_ns
            .as_ref()
            .map(|ns| ns.prefix_list.split_whitespace().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InclusiveNamespaces {
    #[serde(rename = "@xmlns:ec", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,

    #[serde(rename = "@PrefixList", default)]
    pub prefix_list: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestMethod {
    #[serde(rename = "@Algorithm")]
    pub algorithm: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(rename(serialize = "ds:X509Data", deserialize = "X509Data"), default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x509_data: Option<X509Data>,

    #[serde(rename(serialize = "wsse:SecurityTokenReference"))]
    #[serde(rename(deserialize = "SecurityTokenReference"), default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token_ref: Option<SecurityTokenReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct X509Data {
    #[serde(rename(serialize = "ds:X509Certificate", deserialize = "X509Certificate"), default)]
    pub certificates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityTokenReference {
    #[serde(rename = "@xmlns:wsse", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,

    #[serde(rename(serialize = "wsse:Reference", deserialize = "Reference"), default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<TokenReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReference {
    #[serde(rename = "@URI")]
    pub uri: String,

    #[serde(rename = "@ValueType", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

/// `ds:Object` carrying XAdES unsigned properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsObject {
    #[serde(rename(
        serialize = "xades:QualifyingProperties",
        deserialize = "QualifyingProperties"
    ))]
    pub qualifying_properties: QualifyingProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifyingProperties {
    #[serde(rename = "@xmlns:xades", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,

    #[serde(rename = "@Target", default)]
    pub target: String,

    #[serde(rename(serialize = "xades:UnsignedProperties", deserialize = "UnsignedProperties"))]
    pub unsigned_properties: UnsignedProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedProperties {
    #[serde(rename(
        serialize = "xades:UnsignedSignatureProperties",
        deserialize = "UnsignedSignatureProperties"
    ))]
    pub unsigned_signature_properties: UnsignedSignatureProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedSignatureProperties {
    #[serde(rename(serialize = "xades:SignatureTimeStamp", deserialize = "SignatureTimeStamp"))]
    pub signature_timestamp: SignatureTimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureTimeStamp {
    #[serde(rename(
        serialize = "xades:EncapsulatedTimeStamp",
        deserialize = "EncapsulatedTimeStamp"
    ))]
    pub encapsulated: String,
}

/// `wsse:Security` header built when signing a SOAP envelope
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Security {
    #[serde(rename = "@xmlns:wsse")]
    pub xmlns_wsse: &'static str,

    #[serde(rename = "@xmlns:wsu")]
    pub xmlns_wsu: &'static str,

    #[serde(rename = "wsse:BinarySecurityToken")]
    pub token: BinarySecurityToken,

    #[serde(rename = "ds:Signature")]
    pub signature: Signature,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BinarySecurityToken {
    #[serde(rename = "@EncodingType")]
    pub encoding_type: &'static str,

    #[serde(rename = "@ValueType")]
    pub value_type: &'static str,

    #[serde(rename = "@wsu:Id")]
    pub id: String,

    #[serde(rename = "$text")]
    pub value: String,
}

/// Outcome of a successful XML verification
#[derive(Debug, Clone, Serialize)]
pub struct XmlVerifyReport {
    pub certificate: Certificate,
    /// `SignatureMethod/@Algorithm`
    pub signature_algorithm: String,
    pub hash_algorithm: HashAlg,
    /// URIs of the verified references
    pub references: Vec<String>,
    pub timestamp: Option<TimestampInfo>,
}

/// Signs and verifies XML documents.
pub struct XmlSignatureEngine {
    keystore: Arc<KeyStore>,
    crypto: Arc<dyn CryptoBackend>,
    tsa: Option<Arc<dyn TimestampClient>>,
}

impl XmlSignatureEngine {
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

    /// Signs the whole document with an enveloped signature appended to the root.
    #[instrument(skip_all, fields(len = xml.len(), with_timestamp))]
    pub fn sign_document(&self, xml: &str, with_timestamp: bool) -> Result<String> {
        let tsa = if with_timestamp {
            Some(self.tsa.as_deref().ok_or_else(|| {
                crate::error::Error::TimestampUnavailable(
                    "no timestamp authority configured".into(),
                )
            })?)
        } else {
            None
        };
        self.keystore.with_identity(|identity| {
            signer::sign_enveloped(xml, identity, self.crypto.as_ref(), tsa)
        })
    }

    /// Signs the SOAP Body into a `wsse:Security` header.
    #[instrument(skip(self, xml), fields(len = xml.len()))]
    pub fn sign_security_header(&self, xml: &str, reference_id: &str) -> Result<String> {
        self.keystore.with_identity(|identity| {
            wsse::sign_envelope(xml, reference_id, identity, self.crypto.as_ref())
        })
    }

    /// Verifies the first `ds:Signature` of the document.
    #[instrument(skip(self, xml), fields(len = xml.len()))]
    pub fn verify_document(&self, xml: &str, must_check_cert_time: bool) -> Result<XmlVerifyReport> {
        verifier::verify(xml, must_check_cert_time, self.crypto.as_ref())
    }

    /// `SignatureMethod/@Algorithm` of the first signature, without verifying it.
    pub fn extract_signature_algorithm(&self, xml: &str) -> Result<String> {
        verifier::signature_algorithm(xml)
    }
}
