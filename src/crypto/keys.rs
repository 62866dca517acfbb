use crate::crypto::KeyAlgorithm;
use secrecy::{ExposeSecret, SecretSlice};
use std::fmt;

/// Secure wrapper for sensitive byte data that zeroizes on drop
#[derive(Clone, Default)]
pub struct SecureBytes(SecretSlice<u8>);

impl SecureBytes {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(SecretSlice::new(data.into().into()))
    }

    /// Expose the secret data
    pub fn expose_secret(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes([REDACTED; {}])", self.len())
    }
}

/// Opaque handle to an unlocked private key.
///
/// Holds the PKCS#8 DER encoding of the key. The bytes are only reachable
/// inside the crate, so callers can sign with a key but never export it.
pub struct KeyHandle {
    algorithm: KeyAlgorithm,
    pkcs8: SecureBytes,
}

impl KeyHandle {
    pub fn new(algorithm: KeyAlgorithm, pkcs8: impl Into<Vec<u8>>) -> Self {
        Self::from_secret(algorithm, SecureBytes::new(pkcs8))
    }

    pub fn from_secret(algorithm: KeyAlgorithm, pkcs8: SecureBytes) -> Self {
        Self { algorithm, pkcs8 }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn pkcs8_der(&self) -> &[u8] {
        self.pkcs8.expose_secret()
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("algorithm", &self.algorithm)
            .field("key_data", &"[REDACTED]")
            .finish()
    }
}
