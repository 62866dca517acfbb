pub mod certificate;
pub mod crl;
pub mod extract;
pub mod keystore;
pub mod validation;

pub use certificate::{CertField, Certificate, TimeValidity};
pub use crl::{RevocationList, RevokedEntry};
pub use keystore::{CertEncoding, KeyStore, KeyStoreBackend, Pkcs12Backend, SigningIdentity};
pub use validation::{
    CertificateValidator, OcspStatus, RevocationSource, RevocationStatus, RevocationTransport,
    TransportError, ValidateCertInput, ValidationResult, ValidationStatus,
};
