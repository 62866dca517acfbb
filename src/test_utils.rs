//! Generated identities shared by the unit tests.

use std::sync::Arc;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevocationReason, RevokedCertParams, SerialNumber, date_time_ymd,
};

use crate::pki::keystore::KeyStore;

pub(crate) const PASSWORD: &str = "Qwerty12";

pub(crate) struct TestIdentity {
    pub ca: Issuer<'static, KeyPair>,
    pub ca_der: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl TestIdentity {
    pub fn pkcs12(&self, password: &str) -> Vec<u8> {
        let pkey = PKey::private_key_from_der(&self.key_der).unwrap();
        let cert = X509::from_der(&self.cert_der).unwrap();
        let mut chain = Stack::new().unwrap();
        chain.push(X509::from_der(&self.ca_der).unwrap()).unwrap();

        Pkcs12::builder()
            .name("test")
            .pkey(&pkey)
            .cert(&cert)
            .ca(chain)
            .build2(password)
            .unwrap()
            .to_der()
            .unwrap()
    }

    pub fn keystore(&self) -> Arc<KeyStore> {
        let store = KeyStore::new();
        store
            .load_from_bytes(&self.pkcs12(PASSWORD), PASSWORD)
            .unwrap();
        Arc::new(store)
    }
}

pub(crate) fn ca() -> (Issuer<'static, KeyPair>, Vec<u8>) {
    let params = ca_params("Test Root CA");
    let key_pair = KeyPair::generate().unwrap();

    let cert = params.self_signed(&key_pair).unwrap();
    let der = cert.der().to_vec();
    (Issuer::new(params, key_pair), der)
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::CountryName, "KZ");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

/// Root, intermediate CA and an end-entity certificate issued by the intermediate
pub(crate) struct IntermediateChain {
    pub issuer: Issuer<'static, KeyPair>,
    pub issuer_der: Vec<u8>,
    pub cert_der: Vec<u8>,
}

impl IntermediateChain {
    /// The intermediate CA answering OCSP requests itself
    pub fn issuer_as_responder(&self) -> OcspResponder {
        OcspResponder {
            cert_der: self.issuer_der.clone(),
            key_der: self.issuer.key().serialize_der(),
        }
    }
}

pub(crate) fn intermediate_chain() -> IntermediateChain {
    let (root, _) = ca();

    let params = ca_params("Test Intermediate CA");
    let key_pair = KeyPair::generate().unwrap();
    let issuer_der = params.signed_by(&key_pair, &root).unwrap().der().to_vec();
    let issuer = Issuer::new(params, key_pair);

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "OCSP SUBJECT");
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&[0x31, 0x7c, 0x05]));
    let cert_der = params
        .signed_by(&KeyPair::generate().unwrap(), &issuer)
        .unwrap()
        .der()
        .to_vec();

    IntermediateChain {
        issuer,
        issuer_der,
        cert_der,
    }
}

pub(crate) fn identity() -> TestIdentity {
    let (ca, ca_der) = ca();
    let mut params = CertificateParams::default();
    let key_pair = KeyPair::generate().unwrap();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "TEST USER");
    dn.push(DnType::CustomDnType(vec![2, 5, 4, 5]), "IIN123456789012");
    dn.push(DnType::CountryName, "KZ");
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(SerialNumber::from_slice(&[0x0a, 0x1b, 0x2c]));

    let cert = params.signed_by(&key_pair, &ca).unwrap();
    TestIdentity {
        ca,
        ca_der,
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
    }
}

/// CRL issued by `ca` revoking `serials`, current since 2024-01-01
pub(crate) fn crl_der(
    ca: &Issuer<'static, KeyPair>,
    serials: &[&[u8]],
    next_update: (i32, u8, u8),
) -> Vec<u8> {
    let params = CertificateRevocationListParams {
        this_update: date_time_ymd(2024, 1, 1),
        next_update: date_time_ymd(next_update.0, next_update.1, next_update.2),
        crl_number: SerialNumber::from(1u64),
        issuing_distribution_point: None,
        revoked_certs: serials
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from_slice(serial),
                revocation_time: date_time_ymd(2024, 6, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    };
    params.signed_by(ca).unwrap().der().to_vec()
}

/// Timestamp authority answering from a generated certificate
pub(crate) struct FakeTsa {
    cert: crate::pki::certificate::Certificate,
    key: crate::crypto::KeyHandle,
}

impl FakeTsa {
    pub fn new() -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test TSA");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            cert: crate::pki::certificate::Certificate::from_der(cert.der().to_vec()).unwrap(),
            key: crate::crypto::KeyHandle::new(
                crate::crypto::KeyAlgorithm::Ecdsa,
                key_pair.serialize_der(),
            ),
        }
    }
}

impl crate::cms::TimestampClient for FakeTsa {
    fn request_timestamp(
        &self,
        alg: crate::crypto::HashAlg,
        digest: &[u8],
    ) -> crate::error::Result<Vec<u8>> {
        use crate::asn1::oid::ID_CT_TST_INFO;
        use crate::asn1::tsp::{MessageImprint, TstInfo};
        use crate::cms::builder;
        use crate::crypto::{CryptoBackend, OpensslBackend};
        use chrono::{SubsecRound, Utc};
        use rasn::types::{Integer, ObjectIdentifier, OctetString};

        let tst_info = TstInfo {
            version: Integer::from(1),
            policy: ObjectIdentifier::new_unchecked(vec![1, 2, 3, 4].into()),
            message_imprint: MessageImprint {
                hash_algorithm: builder::digest_algorithm(alg),
                hashed_message: OctetString::from(digest.to_vec()),
            },
            serial_number: Integer::from(7),
            gen_time: Utc::now().trunc_subsecs(0).fixed_offset(),
            accuracy: None,
            ordering: false,
            nonce: None,
            tsa: None,
            extensions: None,
        };
        let content = rasn::der::encode(&tst_info)?;

        let hash = self.key.algorithm().default_hash();
        let attrs =
            builder::signed_attributes(ID_CT_TST_INFO, &hash.hash(&content)?, Utc::now())?;
        let input = hash.hash(rasn::der::encode(&attrs)?)?;
        let signature = OpensslBackend.sign_digest(&self.key, hash, &input)?;

        builder::assemble(builder::SignerParts {
            content_type: ID_CT_TST_INFO,
            content: Some(&content),
            hash,
            key_algorithm: self.key.algorithm(),
            signed_attrs: attrs,
            signature,
            timestamp_token: None,
            certificates: std::slice::from_ref(&self.cert),
        })
    }
}

/// Certificate and PKCS#8 key that sign OCSP responses
pub(crate) struct OcspResponder {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl OcspResponder {
    /// Delegated responder carrying the OCSPSigning purpose
    pub fn issued_by(ca: &Issuer<'static, KeyPair>) -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test OCSP Responder");
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::OcspSigning];

        Self {
            cert_der: params.signed_by(&key_pair, ca).unwrap().der().to_vec(),
            key_der: key_pair.serialize_der(),
        }
    }
}

pub(crate) enum OcspAnswer {
    Good,
    /// Revoked on 2024-06-01 for key compromise
    Revoked,
}

/// RFC 6960 response structures, encode only
mod ocsp {
    use rasn::prelude::*;
    use rasn_pkix::{AlgorithmIdentifier, Certificate, CrlReason};

    #[derive(AsnType, Clone, Copy, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[rasn(enumerated)]
    pub enum ResponseStatus {
        Successful = 0,
    }

    #[derive(AsnType, Encode)]
    pub struct OcspResponse {
        pub response_status: ResponseStatus,
        #[rasn(tag(explicit(0)))]
        pub response_bytes: Option<ResponseBytes>,
    }

    #[derive(AsnType, Encode)]
    pub struct ResponseBytes {
        pub response_type: ObjectIdentifier,
        pub response: OctetString,
    }

    #[derive(AsnType, Encode)]
    pub struct BasicOcspResponse {
        pub tbs_response_data: ResponseData,
        pub signature_algorithm: AlgorithmIdentifier,
        pub signature: BitString,
        #[rasn(tag(explicit(0)))]
        pub certs: Option<Vec<Certificate>>,
    }

    #[derive(AsnType, Encode)]
    pub struct ResponseData {
        pub responder_id: ResponderId,
        pub produced_at: GeneralizedTime,
        pub responses: Vec<SingleResponse>,
    }

    #[derive(AsnType, Encode)]
    #[rasn(choice)]
    pub enum ResponderId {
        #[rasn(tag(explicit(2)))]
        ByKey(OctetString),
    }

    #[derive(AsnType, Encode)]
    pub struct SingleResponse {
        pub cert_id: CertId,
        pub cert_status: CertStatus,
        pub this_update: GeneralizedTime,
        #[rasn(tag(explicit(0)))]
        pub next_update: Option<GeneralizedTime>,
    }

    #[derive(AsnType, Encode)]
    pub struct CertId {
        pub hash_algorithm: AlgorithmIdentifier,
        pub issuer_name_hash: OctetString,
        pub issuer_key_hash: OctetString,
        pub serial_number: Integer,
    }

    #[derive(AsnType, Encode)]
    #[rasn(choice)]
    pub enum CertStatus {
        #[rasn(tag(0))]
        Good(()),
        #[rasn(tag(1))]
        Revoked(RevokedInfo),
    }

    #[derive(AsnType, Encode)]
    pub struct RevokedInfo {
        pub revocation_time: GeneralizedTime,
        #[rasn(tag(explicit(0)))]
        pub revocation_reason: Option<CrlReason>,
    }
}

fn key_hash(certificate: &rasn_pkix::Certificate) -> rasn::types::OctetString {
    let key = &certificate.tbs_certificate.subject_public_key_info.subject_public_key;
    openssl::sha::sha1(key.as_raw_slice()).to_vec().into()
}

const ID_PKIX_OCSP_BASIC: &[u32] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];
const ID_SHA1: &[u32] = &[1, 3, 14, 3, 2, 26];
const ECDSA_WITH_SHA256: &[u32] = &[1, 2, 840, 10045, 4, 3, 2];

fn algorithm(arcs: &'static [u32]) -> rasn_pkix::AlgorithmIdentifier {
    rasn_pkix::AlgorithmIdentifier {
        algorithm: rasn::types::ObjectIdentifier::new_unchecked(arcs.into()),
        parameters: None,
    }
}

/// A signed OCSP response about `cert_der`, issued by `issuer_der`
pub(crate) fn ocsp_response(
    cert_der: &[u8],
    issuer_der: &[u8],
    responder: &OcspResponder,
    answer: OcspAnswer,
) -> Vec<u8> {
    use chrono::{SubsecRound, TimeDelta, TimeZone, Utc};
    use openssl::hash::MessageDigest;
    use openssl::sign::Signer;
    use rasn_pkix::{Certificate, CrlReason};

    let cert: Certificate = rasn::der::decode(cert_der).unwrap();
    let issuer: Certificate = rasn::der::decode(issuer_der).unwrap();
    let responder_cert: Certificate = rasn::der::decode(&responder.cert_der).unwrap();

    let issuer_name = rasn::der::encode(&issuer.tbs_certificate.subject).unwrap();
    let cert_id = ocsp::CertId {
        hash_algorithm: algorithm(ID_SHA1),
        issuer_name_hash: openssl::sha::sha1(&issuer_name).to_vec().into(),
        issuer_key_hash: key_hash(&issuer),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    };
    let cert_status = match answer {
        OcspAnswer::Good => ocsp::CertStatus::Good(()),
        OcspAnswer::Revoked => ocsp::CertStatus::Revoked(ocsp::RevokedInfo {
            revocation_time: Utc
                .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
                .unwrap()
                .fixed_offset(),
            revocation_reason: Some(CrlReason::KeyCompromise),
        }),
    };

    let now = Utc::now().trunc_subsecs(0).fixed_offset();
    let tbs = ocsp::ResponseData {
        responder_id: ocsp::ResponderId::ByKey(key_hash(&responder_cert)),
        produced_at: now,
        responses: vec![ocsp::SingleResponse {
            cert_id,
            cert_status,
            this_update: now - TimeDelta::minutes(1),
            next_update: Some(now + TimeDelta::days(1)),
        }],
    };

    let key = PKey::private_key_from_der(&responder.key_der).unwrap();
    let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
    signer.update(&rasn::der::encode(&tbs).unwrap()).unwrap();
    let signature = signer.sign_to_vec().unwrap();

    let basic = ocsp::BasicOcspResponse {
        tbs_response_data: tbs,
        signature_algorithm: algorithm(ECDSA_WITH_SHA256),
        signature: rasn::types::BitString::from_vec(signature),
        certs: Some(vec![responder_cert]),
    };
    let response = ocsp::OcspResponse {
        response_status: ocsp::ResponseStatus::Successful,
        response_bytes: Some(ocsp::ResponseBytes {
            response_type: rasn::types::ObjectIdentifier::new_unchecked(ID_PKIX_OCSP_BASIC.into()),
            response: rasn::der::encode(&basic).unwrap().into(),
        }),
    };
    rasn::der::encode(&response).unwrap()
}
