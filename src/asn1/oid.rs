//! Object identifiers used by the CMS, TSP and X.509 codecs.

// Digest algorithms
pub const SHA256_OID: &[u32] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
pub const GOST34311_95_OID: &[u32] = &[1, 2, 398, 3, 10, 1, 3, 1];

// Public key algorithms
pub const RSA_ENCRYPTION_OID: &[u32] = &[1, 2, 840, 113549, 1, 1, 1];
pub const EC_PUBLIC_KEY_OID: &[u32] = &[1, 2, 840, 10045, 2, 1];
pub const GOST34310_KEY_OID: &[u32] = &[1, 2, 398, 3, 10, 1, 1, 1, 1];

// Signature algorithms
pub const SHA256_WITH_RSA_OID: &[u32] = &[1, 2, 840, 113549, 1, 1, 11];
pub const ECDSA_WITH_SHA256_OID: &[u32] = &[1, 2, 840, 10045, 4, 3, 2];
pub const GOST34310_WITH_GOST34311_OID: &[u32] = &[1, 2, 398, 3, 10, 1, 1, 1, 2];

// CMS content types
pub const ID_DATA: &[u32] = &[1, 2, 840, 113549, 1, 7, 1];
pub const ID_SIGNED_DATA: &[u32] = &[1, 2, 840, 113549, 1, 7, 2];
pub const ID_CT_TST_INFO: &[u32] = &[1, 2, 840, 113549, 1, 9, 16, 1, 4];

// CMS attributes
pub const CONTENT_TYPE_OID: &[u32] = &[1, 2, 840, 113549, 1, 9, 3];
pub const MESSAGE_DIGEST_OID: &[u32] = &[1, 2, 840, 113549, 1, 9, 4];
pub const SIGNING_TIME_OID: &[u32] = &[1, 2, 840, 113549, 1, 9, 5];
pub const TIMESTAMP_TOKEN_OID: &[u32] = &[1, 2, 840, 113549, 1, 9, 16, 2, 14];

/// Dotted form of an arc slice, e.g. `1.2.840.113549.1.7.2`.
pub fn to_dotted(arcs: &[u32]) -> String {
    arcs.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}
