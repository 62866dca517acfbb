use crate::crypto::{HashAlg, KeyAlgorithm, KeyHandle};
use crate::error::{Error, Result};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::md::{Md, MdRef};
use openssl::pkey::{Id, PKey, PKeyRef};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use tracing::debug;

/// Primitive signing capability consumed by the signature engines.
///
/// Implementations sign and verify *digests*; message hashing and container
/// framing stay in the engines.
pub trait CryptoBackend: Send + Sync {
    /// Signs a precomputed digest with the given key.
    fn sign_digest(&self, key: &KeyHandle, alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>>;

    /// Verifies `signature` over `digest` with a DER `SubjectPublicKeyInfo`.
    ///
    /// Returns `Ok(false)` when the signature does not match.
    fn verify_digest(
        &self,
        spki_der: &[u8],
        alg: HashAlg,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool>;
}

/// RSA (PKCS#1 v1.5) and ECDSA through OpenSSL.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslBackend;

impl OpensslBackend {
    pub fn new() -> Self {
        Self
    }
}

fn signature_md(alg: HashAlg) -> Result<&'static MdRef> {
    match alg {
        HashAlg::Sha256 => Ok(Md::sha256()),
        HashAlg::Gost34311 => Err(Error::UnsupportedAlgorithm(
            "GOST 34.311-95 signatures are not available in the OpenSSL backend".into(),
        )),
    }
}

fn ensure_supported_key<T>(key: &PKeyRef<T>) -> Result<()> {
    let id = key.id();
    if id == Id::RSA || id == Id::EC {
        return Ok(());
    }
    Err(Error::UnsupportedAlgorithm(format!(
        "OpenSSL key type {}",
        id.as_raw()
    )))
}

impl CryptoBackend for OpensslBackend {
    fn sign_digest(&self, key: &KeyHandle, alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>> {
        if key.algorithm() == KeyAlgorithm::Gost34310 {
            return Err(Error::UnsupportedAlgorithm(
                "GOST 34.310 keys require a dedicated backend".into(),
            ));
        }
        let md = signature_md(alg)?;
        let pkey = PKey::private_key_from_der(key.pkcs8_der())?;
        ensure_supported_key(&pkey)?;

        let mut ctx = PkeyCtx::new(&pkey)?;
        ctx.sign_init()?;
        if pkey.id() == Id::RSA {
            ctx.set_rsa_padding(Padding::PKCS1)?;
        }
        ctx.set_signature_md(md)?;

        let mut signature = Vec::new();
        ctx.sign_to_vec(digest, &mut signature)?;
        debug!(alg = %alg, len = signature.len(), "digest signed");
        Ok(signature)
    }

    fn verify_digest(
        &self,
        spki_der: &[u8],
        alg: HashAlg,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let md = signature_md(alg)?;
        let pkey = PKey::public_key_from_der(spki_der)?;
        ensure_supported_key(&pkey)?;

        let mut ctx = PkeyCtx::new(&pkey)?;
        ctx.verify_init()?;
        if pkey.id() == Id::RSA {
            ctx.set_rsa_padding(Padding::PKCS1)?;
        }
        ctx.set_signature_md(md)?;

        // OpenSSL reports malformed signatures as errors rather than `false`
        Ok(ctx.verify(digest, signature).unwrap_or(false))
    }
}

fn ec_field_size(spki_der: &[u8]) -> Result<usize> {
    let pkey = PKey::public_key_from_der(spki_der)?;
    let ec = pkey
        .ec_key()
        .map_err(|_| Error::InvalidInput("public key is not an EC key".into()))?;
    Ok((ec.group().order_bits() as usize).div_ceil(8))
}

/// Converts a DER `ECDSA-Sig-Value` into the fixed-width `r || s` form XML-DSig uses.
pub fn ecdsa_der_to_raw(spki_der: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let size = ec_field_size(spki_der)?;
    let sig = EcdsaSig::from_der(signature)?;
    let mut raw = sig.r().to_vec_padded(size as i32)?;
    raw.extend(sig.s().to_vec_padded(size as i32)?);
    Ok(raw)
}

/// Converts an `r || s` signature back into DER.
pub fn ecdsa_raw_to_der(signature: &[u8]) -> Result<Vec<u8>> {
    if signature.is_empty() || signature.len() % 2 != 0 {
        return Err(Error::SignatureMismatch(
            "ECDSA signature value has an odd length".into(),
        ));
    }
    let (r, s) = signature.split_at(signature.len() / 2);
    let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(sig.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::rsa::Rsa;

    fn ec_key() -> (KeyHandle, Vec<u8>) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let pkey = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        (
            KeyHandle::new(KeyAlgorithm::Ecdsa, pkey.private_key_to_pkcs8().unwrap()),
            pkey.public_key_to_der().unwrap(),
        )
    }

    #[test]
    fn test_rsa_sign_verify_digest() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let key = KeyHandle::new(KeyAlgorithm::Rsa, pkey.private_key_to_pkcs8().unwrap());
        let spki = pkey.public_key_to_der().unwrap();
        let backend = OpensslBackend::new();

        let digest = HashAlg::Sha256.hash(b"payload").unwrap();
        let sig = backend.sign_digest(&key, HashAlg::Sha256, &digest).unwrap();
        assert_eq!(sig.len(), 256);
        assert!(
            backend
                .verify_digest(&spki, HashAlg::Sha256, &digest, &sig)
                .unwrap()
        );

        let other = HashAlg::Sha256.hash(b"other").unwrap();
        assert!(
            !backend
                .verify_digest(&spki, HashAlg::Sha256, &other, &sig)
                .unwrap()
        );
    }

    #[test]
    fn test_ecdsa_raw_conversion() {
        let (key, spki) = ec_key();
        let backend = OpensslBackend::new();
        let digest = HashAlg::Sha256.hash(b"payload").unwrap();

        let der = backend.sign_digest(&key, HashAlg::Sha256, &digest).unwrap();
        let raw = ecdsa_der_to_raw(&spki, &der).unwrap();
        assert_eq!(raw.len(), 64);

        let back = ecdsa_raw_to_der(&raw).unwrap();
        assert!(
            backend
                .verify_digest(&spki, HashAlg::Sha256, &digest, &back)
                .unwrap()
        );
    }

    #[test]
    fn test_gost_is_unsupported() {
        let (key, _) = ec_key();
        let digest = HashAlg::Gost34311.hash(b"payload").unwrap();
        let err = OpensslBackend::new()
            .sign_digest(&key, HashAlg::Gost34311, &digest)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }
}
