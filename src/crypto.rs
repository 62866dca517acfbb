mod backend;
mod keys;

pub use backend::{CryptoBackend, OpensslBackend, ecdsa_der_to_raw, ecdsa_raw_to_der};
pub use keys::{KeyHandle, SecureBytes};

use crate::asn1::oid::{
    ECDSA_WITH_SHA256_OID, EC_PUBLIC_KEY_OID, GOST34310_KEY_OID, GOST34310_WITH_GOST34311_OID,
    GOST34311_95_OID, RSA_ENCRYPTION_OID, SHA256_OID, SHA256_WITH_RSA_OID, to_dotted,
};
use crate::error::{Error, Result};
use gost94::{Digest, Gost94CryptoPro};
use openssl::hash::{Hasher, MessageDigest};
use serde::Serialize;
use std::fmt;

/// XML-DSig identifiers for digests and signature methods
pub mod uri {
    pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
    pub const GOST34311: &str = "http://www.w3.org/2001/04/xmldsig-more#gost34311";

    pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
    pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
    pub const GOST34310_GOST34311: &str =
        "http://www.w3.org/2001/04/xmldsig-more#gost34310-gost34311";
}

/// Hash algorithms supported by the signing profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HashAlg {
    /// SHA-256
    Sha256,
    /// GOST 34.311-95
    Gost34311,
}

impl HashAlg {
    /// Hash the given data with this hash algorithm
    pub fn hash(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        match self {
            HashAlg::Sha256 => {
                let mut hasher = Hasher::new(MessageDigest::sha256())?;
                hasher.update(data.as_ref())?;
                Ok(hasher.finish()?.to_vec())
            }
            HashAlg::Gost34311 => Ok(Gost94CryptoPro::digest(data.as_ref()).to_vec()),
        }
    }

    /// Get the output size in bytes
    pub fn output_size(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Gost34311 => 32,
        }
    }

    pub fn oid(self) -> &'static [u32] {
        match self {
            HashAlg::Sha256 => SHA256_OID,
            HashAlg::Gost34311 => GOST34311_95_OID,
        }
    }

    pub fn from_oid(oid: &[u32]) -> Result<Self> {
        match oid {
            SHA256_OID => Ok(HashAlg::Sha256),
            GOST34311_95_OID => Ok(HashAlg::Gost34311),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "digest algorithm {}",
                to_dotted(other)
            ))),
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            HashAlg::Sha256 => uri::SHA256,
            HashAlg::Gost34311 => uri::GOST34311,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        match uri {
            uri::SHA256 => Ok(HashAlg::Sha256),
            uri::GOST34311 => Ok(HashAlg::Gost34311),
            other => Err(Error::UnsupportedAlgorithm(format!("digest method {other}"))),
        }
    }

    /// Accepts the names used on the command line and in configs.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlg::Sha256),
            "gost" | "gost95" | "gost34311" | "gost34.311-95" => Ok(HashAlg::Gost34311),
            other => Err(Error::UnsupportedAlgorithm(format!("hash {other}"))),
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlg::Sha256 => "SHA-256",
            HashAlg::Gost34311 => "GOST 34.311-95",
        };
        write!(f, "{name}")
    }
}

/// Public key family of a certificate or signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
    /// GOST 34.310-2004
    Gost34310,
}

impl KeyAlgorithm {
    pub fn from_spki_oid(oid: &[u32]) -> Result<Self> {
        match oid {
            RSA_ENCRYPTION_OID => Ok(KeyAlgorithm::Rsa),
            EC_PUBLIC_KEY_OID => Ok(KeyAlgorithm::Ecdsa),
            GOST34310_KEY_OID => Ok(KeyAlgorithm::Gost34310),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "public key algorithm {}",
                to_dotted(other)
            ))),
        }
    }

    /// The hash each key family is paired with in this profile
    pub fn default_hash(self) -> HashAlg {
        match self {
            KeyAlgorithm::Rsa | KeyAlgorithm::Ecdsa => HashAlg::Sha256,
            KeyAlgorithm::Gost34310 => HashAlg::Gost34311,
        }
    }

    pub fn signature_oid(self, hash: HashAlg) -> Result<&'static [u32]> {
        match (self, hash) {
            (KeyAlgorithm::Rsa, HashAlg::Sha256) => Ok(SHA256_WITH_RSA_OID),
            (KeyAlgorithm::Ecdsa, HashAlg::Sha256) => Ok(ECDSA_WITH_SHA256_OID),
            (KeyAlgorithm::Gost34310, HashAlg::Gost34311) => Ok(GOST34310_WITH_GOST34311_OID),
            (key, hash) => Err(Error::UnsupportedAlgorithm(format!("{key} with {hash}"))),
        }
    }

    pub fn signature_uri(self, hash: HashAlg) -> Result<&'static str> {
        match (self, hash) {
            (KeyAlgorithm::Rsa, HashAlg::Sha256) => Ok(uri::RSA_SHA256),
            (KeyAlgorithm::Ecdsa, HashAlg::Sha256) => Ok(uri::ECDSA_SHA256),
            (KeyAlgorithm::Gost34310, HashAlg::Gost34311) => Ok(uri::GOST34310_GOST34311),
            (key, hash) => Err(Error::UnsupportedAlgorithm(format!("{key} with {hash}"))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ecdsa => "ECDSA",
            KeyAlgorithm::Gost34310 => "GOST 34.310-2004",
        };
        write!(f, "{name}")
    }
}

/// Resolves an XML `SignatureMethod` URI into its key family and digest.
pub fn signature_method_from_uri(uri: &str) -> Result<(KeyAlgorithm, HashAlg)> {
    match uri {
        uri::RSA_SHA256 => Ok((KeyAlgorithm::Rsa, HashAlg::Sha256)),
        uri::ECDSA_SHA256 => Ok((KeyAlgorithm::Ecdsa, HashAlg::Sha256)),
        uri::GOST34310_GOST34311 => Ok((KeyAlgorithm::Gost34310, HashAlg::Gost34311)),
        other => Err(Error::UnsupportedAlgorithm(format!("signature method {other}"))),
    }
}

/// Digest implied by a CMS signature algorithm OID.
///
/// Bare key OIDs (`rsaEncryption`, `id-ecPublicKey`, ...) do not pin a digest
/// and yield `None`.
pub fn digest_of_signature_oid(oid: &[u32]) -> Result<Option<HashAlg>> {
    match oid {
        SHA256_WITH_RSA_OID | ECDSA_WITH_SHA256_OID => Ok(Some(HashAlg::Sha256)),
        GOST34310_WITH_GOST34311_OID => Ok(Some(HashAlg::Gost34311)),
        RSA_ENCRYPTION_OID | EC_PUBLIC_KEY_OID | GOST34310_KEY_OID => Ok(None),
        other => Err(Error::UnsupportedAlgorithm(format!(
            "signature algorithm {}",
            to_dotted(other)
        ))),
    }
}
