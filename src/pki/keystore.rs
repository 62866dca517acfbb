use std::{fs, io, path::Path, sync::Mutex};

use openssl::pkcs12::Pkcs12;
use tracing::{debug, info, warn};

use crate::crypto::{HashAlg, KeyAlgorithm, KeyHandle, SecureBytes};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;

/// Key material handed back by a [`KeyStoreBackend`].
#[derive(Debug)]
pub struct UnlockedKey {
    /// PKCS#8 DER of the private key
    pub private_key: SecureBytes,
    /// DER of the matching certificate
    pub certificate: Vec<u8>,
    /// DER of any additional certificates in the container
    pub chain: Vec<Vec<u8>>,
}

/// Raw unlock of a password protected key container.
pub trait KeyStoreBackend: Send + Sync {
    fn unlock(&self, blob: &[u8], password: &str) -> Result<UnlockedKey>;
}

/// PKCS#12 containers via OpenSSL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pkcs12Backend;

impl KeyStoreBackend for Pkcs12Backend {
    fn unlock(&self, blob: &[u8], password: &str) -> Result<UnlockedKey> {
        let pkcs12 = Pkcs12::from_der(blob)
            .map_err(|e| Error::CorruptStore(format!("not a PKCS#12 container: {e}")))?;
        let parsed = pkcs12
            .parse2(password)
            .map_err(|_| Error::InvalidCredentials)?;

        let pkey = parsed
            .pkey
            .ok_or_else(|| Error::CorruptStore("container holds no private key".into()))?;
        let cert = parsed
            .cert
            .ok_or_else(|| Error::CorruptStore("container holds no certificate".into()))?;

        let mut chain = Vec::new();
        if let Some(ca) = parsed.ca {
            for c in ca.iter() {
                chain.push(c.to_der()?);
            }
        }

        Ok(UnlockedKey {
            private_key: SecureBytes::new(pkey.private_key_to_pkcs8()?),
            certificate: cert.to_der()?,
            chain,
        })
    }
}

/// The unlocked private key together with its certificate.
///
/// Only ever lives inside a [`KeyStore`].
#[derive(Debug)]
pub struct SigningIdentity {
    key: KeyHandle,
    certificate: Certificate,
    chain: Vec<Certificate>,
    hash: HashAlg,
}

impl SigningIdentity {
    pub(crate) fn key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key.algorithm()
    }

    /// Digest algorithm bound to the key family
    pub fn hash_algorithm(&self) -> HashAlg {
        self.hash
    }
}

/// Text encodings offered by [`KeyStore::export_certificate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEncoding {
    Pem,
    /// Base64 of the DER bytes, no armour
    Base64,
}

#[derive(Debug)]
enum State {
    Empty,
    Loaded(SigningIdentity),
    Closed,
}

/// Session holder for one signing identity.
///
/// All access goes through a mutex so signing calls on one store are
/// serialized.
pub struct KeyStore {
    backend: Box<dyn KeyStoreBackend>,
    state: Mutex<State>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    /// A store unlocking PKCS#12 containers
    pub fn new() -> Self {
        Self::with_backend(Pkcs12Backend)
    }

    pub fn with_backend(backend: impl KeyStoreBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            state: Mutex::new(State::Empty),
        }
    }

    /// Loads a key container from disk and returns its certificate.
    pub fn load(&self, path: impl AsRef<Path>, password: &str) -> Result<Certificate> {
        let path = path.as_ref();
        let blob = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::CorruptStore(format!("{}: {e}", path.display())),
        })?;
        debug!(path = %path.display(), "reading keystore");
        self.load_from_bytes(&blob, password)
    }

    /// Unlocks an in-memory key container and returns its certificate.
    ///
    /// A previously loaded identity is released first, even if the new
    /// container fails to unlock.
    pub fn load_from_bytes(&self, blob: &[u8], password: &str) -> Result<Certificate> {
        let mut state = self.lock();
        *state = State::Empty;

        let unlocked = self.backend.unlock(blob, password).inspect_err(|e| {
            warn!(error = %e, "keystore unlock failed");
        })?;
        let identity = build_identity(unlocked)?;
        let certificate = identity.certificate.clone();

        info!(
            subject = %certificate.subject,
            algorithm = %identity.key_algorithm(),
            "signing identity loaded"
        );
        *state = State::Loaded(identity);
        Ok(certificate)
    }

    /// The identity's certificate in the requested encoding.
    pub fn export_certificate(&self, encoding: CertEncoding) -> Result<String> {
        self.with_identity(|identity| {
            let cert = identity.certificate();
            Ok(match encoding {
                CertEncoding::Pem => cert.to_pem(),
                CertEncoding::Base64 => cert.to_base64(),
            })
        })
    }

    pub fn certificate(&self) -> Result<Certificate> {
        self.with_identity(|identity| Ok(identity.certificate.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock(), State::Loaded(_))
    }

    /// Releases the key. Calling it again is a no-op.
    pub fn close(&self) {
        let mut state = self.lock();
        if matches!(*state, State::Loaded(_)) {
            info!("signing identity released");
        }
        *state = State::Closed;
    }

    /// Runs `f` while holding the identity lock.
    pub(crate) fn with_identity<R>(
        &self,
        f: impl FnOnce(&SigningIdentity) -> Result<R>,
    ) -> Result<R> {
        match &*self.lock() {
            State::Loaded(identity) => f(identity),
            State::Empty => Err(Error::NotLoaded),
            State::Closed => Err(Error::Closed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic inside a signing closure does not leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_identity(unlocked: UnlockedKey) -> Result<SigningIdentity> {
    let certificate = Certificate::from_der(unlocked.certificate)
        .map_err(|e| Error::CorruptStore(e.to_string()))?;
    let algorithm = certificate.key_algorithm()?;
    let chain = unlocked
        .chain
        .into_iter()
        .map(Certificate::from_der)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::CorruptStore(e.to_string()))?;

    Ok(SigningIdentity {
        key: KeyHandle::from_secret(algorithm, unlocked.private_key),
        certificate,
        chain,
        hash: algorithm.default_hash(),
    })
}
