use openssl::error::ErrorStack;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a public operation can report.
///
/// Each variant is one error kind; the payload is a human readable message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid keystore password")]
    InvalidCredentials,

    #[error("corrupt keystore: {0}")]
    CorruptStore(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no signing identity is loaded")]
    NotLoaded,

    #[error("keystore session is closed")]
    Closed,

    #[error("malformed signature container: {0}")]
    MalformedContainer(String),

    #[error("malformed XML document: {0}")]
    MalformedXml(String),

    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("reference digest mismatch: {0}")]
    ReferenceMismatch(String),

    #[error("certificate expired: {0}")]
    CertificateExpired(String),

    #[error("certificate not yet valid: {0}")]
    NotYetValid(String),

    #[error("certificate revoked: {0}")]
    Revoked(String),

    #[error("certificate not trusted: {0}")]
    Untrusted(String),

    #[error("no certificate present")]
    NoCertificatePresent,

    #[error("no signature present")]
    NoSignaturePresent,

    #[error("timestamp unavailable: {0}")]
    TimestampUnavailable(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("revocation status unknown: {0}")]
    RevocationUnknown(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cryptographic backend error: {0}")]
    Crypto(String),
}

impl From<ErrorStack> for Error {
    fn from(err: ErrorStack) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<rasn::error::DecodeError> for Error {
    fn from(err: rasn::error::DecodeError) -> Self {
        Error::MalformedContainer(err.to_string())
    }
}

impl From<rasn::error::EncodeError> for Error {
    fn from(err: rasn::error::EncodeError) -> Self {
        Error::Crypto(format!("DER encoding failed: {err}"))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<quick_xml::DeError> for Error {
    fn from(err: quick_xml::DeError) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<quick_xml::SeError> for Error {
    fn from(err: quick_xml::SeError) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::MalformedXml(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::MalformedXml(err.utf8_error().to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::InvalidInput(format!("invalid base64: {err}"))
    }
}

// quick-xml writers report through `std::io::Error`
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::MalformedXml(format!("cannot write XML: {err}"))
    }
}
