//! RFC 3161 time-stamp protocol structures.

use rasn::error::DecodeError;
use rasn::prelude::{ObjectIdentifier as Oid, *};
use rasn_cms::{AlgorithmIdentifier, ContentInfo};
use rasn_pkix::{Extensions, GeneralName};

/// MessageImprint ::= SEQUENCE {
///     hashAlgorithm AlgorithmIdentifier,
///     hashedMessage OCTET STRING
/// }
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifier,
    pub hashed_message: OctetString,
}

/// TimeStampReq ::= SEQUENCE {
///     version INTEGER { v1(1) },
///     messageImprint MessageImprint,
///     reqPolicy TSAPolicyId OPTIONAL,
///     nonce INTEGER OPTIONAL,
///     certReq BOOLEAN DEFAULT FALSE,
///     extensions [0] IMPLICIT Extensions OPTIONAL
/// }
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct TimeStampReq {
    pub version: Integer,
    pub message_imprint: MessageImprint,
    pub req_policy: Option<Oid>,
    pub nonce: Option<Integer>,
    #[rasn(default)]
    pub cert_req: bool,
    #[rasn(tag(0))]
    pub extensions: Option<Extensions>,
}

/// PKIStatusInfo ::= SEQUENCE {
///     status PKIStatus,
///     statusString PKIFreeText OPTIONAL,
///     failInfo PKIFailureInfo OPTIONAL
/// }
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct PkiStatusInfo {
    pub status: Integer,
    pub status_string: Option<SequenceOf<Utf8String>>,
    pub fail_info: Option<BitString>,
}

/// TimeStampResp ::= SEQUENCE {
///     status PKIStatusInfo,
///     timeStampToken TimeStampToken OPTIONAL
/// }
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,
    pub time_stamp_token: Option<ContentInfo>,
}

/// Accuracy ::= SEQUENCE {
///     seconds INTEGER OPTIONAL,
///     millis [0] INTEGER (1..999) OPTIONAL,
///     micros [1] INTEGER (1..999) OPTIONAL
/// }
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct Accuracy {
    pub seconds: Option<Integer>,
    #[rasn(tag(0))]
    pub millis: Option<Integer>,
    #[rasn(tag(1))]
    pub micros: Option<Integer>,
}

/// TSTInfo, the encapsulated content of a time-stamp token
#[derive(Debug, Clone, PartialEq, Eq, AsnType, Encode, Decode)]
pub struct TstInfo {
    pub version: Integer,
    pub policy: Oid,
    pub message_imprint: MessageImprint,
    pub serial_number: Integer,
    pub gen_time: GeneralizedTime,
    pub accuracy: Option<Accuracy>,
    #[rasn(default)]
    pub ordering: bool,
    pub nonce: Option<Integer>,
    #[rasn(tag(explicit(0)))]
    pub tsa: Option<GeneralName>,
    #[rasn(tag(1))]
    pub extensions: Option<Extensions>,
}

impl TstInfo {
    pub fn from_der(der: impl AsRef<[u8]>) -> Result<Self, DecodeError> {
        rasn::der::decode(der.as_ref())
    }
}

impl PkiStatusInfo {
    /// `granted(0)` or `grantedWithMods(1)`
    pub fn is_granted(&self) -> bool {
        self.status == Integer::from(0) || self.status == Integer::from(1)
    }

    pub fn text(&self) -> String {
        self.status_string
            .as_ref()
            .map(|texts| {
                texts
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default()
    }
}
