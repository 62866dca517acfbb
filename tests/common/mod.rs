#![allow(dead_code)]

use std::sync::Arc;

use kz_signer::{crypto::OpensslBackend, pki::KeyStore};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::X509;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256,
    RevocationReason, RevokedCertParams, SerialNumber, date_time_ymd,
};
use tempfile::NamedTempFile;

pub const PASSWORD: &str = "Qwerty12";

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Ecdsa,
    Rsa,
}

/// A CA with one end-entity certificate and its PKCS#12 store
pub struct Fixture {
    pub ca: Issuer<'static, KeyPair>,
    pub ca_der: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub serial: Vec<u8>,
}

fn key_pair(kind: KeyKind) -> KeyPair {
    match kind {
        KeyKind::Ecdsa => KeyPair::generate().unwrap(),
        KeyKind::Rsa => {
            let rsa = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
            let pem = String::from_utf8(rsa.private_key_to_pem_pkcs8().unwrap()).unwrap();
            KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256).unwrap()
        }
    }
}

fn ca() -> (Issuer<'static, KeyPair>, Vec<u8>) {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "NCA TEST ROOT");
    dn.push(DnType::CountryName, "KZ");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let der = params.self_signed(&key_pair).unwrap().der().to_vec();
    (Issuer::new(params, key_pair), der)
}

/// `validity` as ((y, m, d), (y, m, d)), or rcgen's default window
pub fn fixture_with(kind: KeyKind, validity: Option<((i32, u8, u8), (i32, u8, u8))>) -> Fixture {
    let (ca, ca_der) = ca();
    let key_pair = key_pair(kind);
    let serial = vec![0x4f, 0x21, 0x7a, 0x01];

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "ИВАНОВ ИВАН");
    dn.push(DnType::CustomDnType(vec![2, 5, 4, 5]), "IIN880101300123");
    dn.push(DnType::CountryName, "KZ");
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    if let Some((from, to)) = validity {
        params.not_before = date_time_ymd(from.0, from.1, from.2);
        params.not_after = date_time_ymd(to.0, to.1, to.2);
    }

    let cert = params.signed_by(&key_pair, &ca).unwrap();
    Fixture {
        ca,
        ca_der,
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
        serial,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(KeyKind::Ecdsa, None)
}

impl Fixture {
    pub fn pkcs12(&self, password: &str) -> Vec<u8> {
        let pkey = PKey::private_key_from_der(&self.key_der).unwrap();
        let cert = X509::from_der(&self.cert_der).unwrap();
        let mut chain = Stack::new().unwrap();
        chain.push(X509::from_der(&self.ca_der).unwrap()).unwrap();
        Pkcs12::builder()
            .name("signer")
            .pkey(&pkey)
            .cert(&cert)
            .ca(chain)
            .build2(password)
            .unwrap()
            .to_der()
            .unwrap()
    }

    /// Writes the PKCS#12 store to a temporary file
    pub fn store_file(&self) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), self.pkcs12(PASSWORD)).unwrap();
        file
    }

    pub fn keystore(&self) -> Arc<KeyStore> {
        let file = self.store_file();
        let store = KeyStore::new();
        store.load(file.path(), PASSWORD).unwrap();
        Arc::new(store)
    }

    /// CRL signed by the fixture CA
    pub fn crl(&self, revoked: &[&[u8]], next_update: (i32, u8, u8)) -> Vec<u8> {
        CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(next_update.0, next_update.1, next_update.2),
            crl_number: SerialNumber::from(7u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(serial),
                    revocation_time: date_time_ymd(2024, 3, 1),
                    reason_code: Some(RevocationReason::Superseded),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&self.ca)
        .unwrap()
        .der()
        .to_vec()
    }
}

pub fn crypto() -> Arc<OpensslBackend> {
    Arc::new(OpensslBackend::new())
}
