//! Network collaborators: OCSP, CRL download and the RFC 3161 time-stamp authority.

use std::{fs, path::Path, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus,
};
use openssl::stack::Stack;
use openssl::x509::X509;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use rasn::types::{Integer, OctetString};
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::asn1::tsp::{MessageImprint, TimeStampReq, TimeStampResp};
use crate::cms::{TimestampClient, builder, decode_timestamp_token};
use crate::config::{RevocationConfig, TimestampConfig};
use crate::crypto::{HashAlg, OpensslBackend};
use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::pki::crl::reason_name;
use crate::pki::validation::{OcspStatus, RevocationTransport, TransportError};

const OCSP_REQUEST: &str = "application/ocsp-request";
const OCSP_RESPONSE: &str = "application/ocsp-response";
const TIMESTAMP_QUERY: &str = "application/timestamp-query";
const TIMESTAMP_REPLY: &str = "application/timestamp-reply";

/// Accepted clock skew for OCSP `thisUpdate`/`nextUpdate`, in seconds
const OCSP_VALIDITY_SKEW: u32 = 300;

/// Blocking HTTP client shared by revocation checks and time-stamping.
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
    proxy: Option<String>,
    tsa_url: Option<String>,
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("kz-signer/", env!("CARGO_PKG_VERSION")));
    builder = match proxy {
        Some(url) => builder.proxy(
            reqwest::Proxy::all(url)
                .map_err(|e| Error::InvalidInput(format!("invalid proxy '{url}': {e}")))?,
        ),
        None => builder.no_proxy(),
    };
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("cannot build HTTP client: {e}")))
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Protocol(err.to_string())
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

impl HttpTransport {
    pub fn new(config: &RevocationConfig) -> Result<Self> {
        let timeout = config.timeout();
        Ok(Self {
            client: build_client(timeout, config.proxy.as_deref())?,
            timeout,
            proxy: config.proxy.clone(),
            tsa_url: None,
        })
    }

    pub fn with_timestamp(mut self, config: &TimestampConfig) -> Self {
        self.tsa_url = config.url.clone();
        self
    }

    /// Routes every request through `proxy`, or connects directly with `None`
    pub fn set_proxy(&mut self, proxy: Option<String>) -> Result<()> {
        self.client = build_client(self.timeout, proxy.as_deref())?;
        info!(proxy = proxy.as_deref().unwrap_or("none"), "HTTP proxy changed");
        self.proxy = proxy;
        Ok(())
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    fn post(
        &self,
        url: &str,
        content_type: &str,
        accept: &str,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, accept)
            .body(body)
            .send()
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        Ok(response.bytes().map_err(transport_error)?.to_vec())
    }
}

fn protocol(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

/// OpenSSL prints ASN.1 times as `Jun  1 00:00:00 2024 GMT`
fn openssl_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%b %e %H:%M:%S %Y GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

fn ocsp_request(
    certificate: &X509,
    issuer: &X509,
) -> std::result::Result<Vec<u8>, TransportError> {
    let id = OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer).map_err(protocol)?;
    let mut request = OcspRequest::new().map_err(protocol)?;
    request.add_id(id).map_err(protocol)?;
    request.to_der().map_err(protocol)
}

/// Checks that the response is signed by `issuer` or by a responder it
/// delegated to, and reads the status of `certificate`.
fn ocsp_status(
    response: &[u8],
    certificate: &X509,
    issuer: &X509,
) -> std::result::Result<OcspStatus, TransportError> {
    let response = OcspResponse::from_der(response).map_err(protocol)?;
    if response.status() != OcspResponseStatus::SUCCESSFUL {
        return Err(TransportError::Protocol(format!(
            "responder answered with status {}",
            response.status().as_raw()
        )));
    }
    let basic = response.basic().map_err(protocol)?;

    // The issuer is usually an intermediate CA, trusted here without its root
    let mut store = X509StoreBuilder::new().map_err(protocol)?;
    store.add_cert(issuer.clone()).map_err(protocol)?;
    store
        .set_flags(X509VerifyFlags::PARTIAL_CHAIN)
        .map_err(protocol)?;
    let store = store.build();
    let mut certs = Stack::new().map_err(protocol)?;
    certs.push(issuer.clone()).map_err(protocol)?;
    basic
        .verify(&certs, &store, OcspFlag::empty())
        .map_err(|e| TransportError::Protocol(format!("response signature rejected: {e}")))?;

    let id = OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer).map_err(protocol)?;
    let status = basic
        .find_status(&id)
        .ok_or_else(|| TransportError::Protocol("response does not cover the certificate".into()))?;
    status
        .check_validity(OCSP_VALIDITY_SKEW, None)
        .map_err(|e| TransportError::Protocol(format!("stale OCSP response: {e}")))?;

    let result = if status.status == OcspCertStatus::GOOD {
        OcspStatus::Good
    } else if status.status == OcspCertStatus::REVOKED {
        OcspStatus::Revoked {
            revoked_at: status
                .revocation_time
                .and_then(|time| openssl_time(&time.to_string())),
            reason: u8::try_from(status.reason.as_raw())
                .ok()
                .map(|code| reason_name(code).to_owned()),
        }
    } else {
        OcspStatus::Unknown
    };
    Ok(result)
}

impl RevocationTransport for HttpTransport {
    fn fetch_ocsp(
        &self,
        url: &str,
        certificate: &Certificate,
        issuer: &Certificate,
    ) -> std::result::Result<OcspStatus, TransportError> {
        let certificate = X509::from_der(certificate.der()).map_err(protocol)?;
        let issuer = X509::from_der(issuer.der()).map_err(protocol)?;

        let request = ocsp_request(&certificate, &issuer)?;
        debug!(url, "sending OCSP request");
        let response = self.post(url, OCSP_REQUEST, OCSP_RESPONSE, request)?;
        let status = ocsp_status(&response, &certificate, &issuer)?;
        info!(url, ?status, "OCSP response received");
        Ok(status)
    }

    fn fetch_crl(&self, location: &str) -> std::result::Result<Vec<u8>, TransportError> {
        if !is_remote(location) {
            let path = Path::new(location.strip_prefix("file://").unwrap_or(location));
            debug!(path = %path.display(), "reading CRL from disk");
            return fs::read(path)
                .map_err(|e| TransportError::Unreachable(format!("{}: {e}", path.display())));
        }

        debug!(url = location, "downloading CRL");
        let response = self.client.get(location).send().map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "HTTP {} from {location}",
                response.status()
            )));
        }
        let body = response.bytes().map_err(transport_error)?;
        info!(url = location, bytes = body.len(), "CRL downloaded");
        Ok(body.to_vec())
    }
}

impl TimestampClient for HttpTransport {
    fn request_timestamp(&self, alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>> {
        let url = self
            .tsa_url
            .as_deref()
            .ok_or_else(|| Error::TimestampUnavailable("no time-stamp authority configured".into()))?;

        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        let nonce = Integer::from((high >> 1) as i64);
        let request = TimeStampReq {
            version: Integer::from(1),
            message_imprint: MessageImprint {
                hash_algorithm: builder::digest_algorithm(alg),
                hashed_message: OctetString::from(digest.to_vec()),
            },
            req_policy: None,
            nonce: Some(nonce.clone()),
            cert_req: true,
            extensions: None,
        };

        let body = self
            .post(url, TIMESTAMP_QUERY, TIMESTAMP_REPLY, rasn::der::encode(&request)?)
            .map_err(|e| Error::TimestampUnavailable(format!("{url}: {e}")))?;
        let response: TimeStampResp = rasn::der::decode(&body)
            .map_err(|e| Error::TimestampUnavailable(format!("malformed TimeStampResp: {e}")))?;
        if !response.status.is_granted() {
            return Err(Error::TimestampUnavailable(format!(
                "request rejected with status {:?}: {}",
                response.status.status,
                response.status.text()
            )));
        }
        let token = response
            .time_stamp_token
            .ok_or_else(|| Error::TimestampUnavailable("granted response carries no token".into()))?;
        let token = rasn::der::encode(&token)?;

        let (tst_info, _) = decode_timestamp_token(&token, &OpensslBackend)
            .map_err(|e| Error::TimestampUnavailable(format!("invalid token: {e}")))?;
        if tst_info.message_imprint.hashed_message.as_ref() != digest {
            return Err(Error::TimestampUnavailable(
                "token imprint does not match the request".into(),
            ));
        }
        if tst_info.nonce.as_ref() != Some(&nonce) {
            warn!(url, "time-stamp nonce mismatch");
            return Err(Error::TimestampUnavailable("token nonce does not match".into()));
        }

        info!(url, gen_time = %tst_info.gen_time, "timestamp token received");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, OcspAnswer, OcspResponder};
    use std::io::Write;

    fn config() -> RevocationConfig {
        RevocationConfig {
            timeout_secs: 2,
            proxy: None,
            ocsp_url: None,
            crl_location: None,
        }
    }

    #[test]
    fn test_crl_from_disk() {
        let transport = HttpTransport::new(&config()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"crl bytes").unwrap();

        let location = file.path().to_str().unwrap().to_owned();
        assert_eq!(transport.fetch_crl(&location).unwrap(), b"crl bytes");
        assert_eq!(
            transport.fetch_crl(&format!("file://{location}")).unwrap(),
            b"crl bytes"
        );
    }

    #[test]
    fn test_missing_crl_file() {
        let transport = HttpTransport::new(&config()).unwrap();
        assert!(matches!(
            transport.fetch_crl("/nonexistent/nca.crl"),
            Err(TransportError::Unreachable(_))
        ));
    }

    #[test]
    fn test_unreachable_endpoints() {
        let transport = HttpTransport::new(&config()).unwrap();
        assert!(matches!(
            transport.fetch_crl("http://127.0.0.1:9/nca.crl"),
            Err(TransportError::Unreachable(_) | TransportError::Timeout(_))
        ));

        let identity = crate::test_utils::identity();
        let cert = Certificate::from_der(identity.cert_der).unwrap();
        let ca = Certificate::from_der(identity.ca_der).unwrap();
        assert!(matches!(
            transport.fetch_ocsp("http://127.0.0.1:9/ocsp", &cert, &ca),
            Err(TransportError::Unreachable(_) | TransportError::Timeout(_))
        ));
    }

    #[test]
    fn test_garbage_ocsp_response() {
        let identity = crate::test_utils::identity();
        let cert = X509::from_der(&identity.cert_der).unwrap();
        let ca = X509::from_der(&identity.ca_der).unwrap();

        assert!(!ocsp_request(&cert, &ca).unwrap().is_empty());
        assert!(matches!(
            ocsp_status(b"\x30\x03\x0a\x01\x00", &cert, &ca),
            Err(TransportError::Protocol(_))
        ));
    }

    fn parse(der: &[u8]) -> X509 {
        X509::from_der(der).unwrap()
    }

    #[test]
    fn test_ocsp_good_signed_by_intermediate() {
        let chain = test_utils::intermediate_chain();
        let response = test_utils::ocsp_response(
            &chain.cert_der,
            &chain.issuer_der,
            &chain.issuer_as_responder(),
            OcspAnswer::Good,
        );

        let status = ocsp_status(&response, &parse(&chain.cert_der), &parse(&chain.issuer_der));
        assert_eq!(status.unwrap(), OcspStatus::Good);
    }

    #[test]
    fn test_ocsp_revoked_from_delegated_responder() {
        let chain = test_utils::intermediate_chain();
        let responder = OcspResponder::issued_by(&chain.issuer);
        let response = test_utils::ocsp_response(
            &chain.cert_der,
            &chain.issuer_der,
            &responder,
            OcspAnswer::Revoked,
        );

        let status = ocsp_status(&response, &parse(&chain.cert_der), &parse(&chain.issuer_der));
        let expected = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            status.unwrap(),
            OcspStatus::Revoked {
                revoked_at: Some(expected),
                reason: Some("keyCompromise".into()),
            }
        );
    }

    #[test]
    fn test_ocsp_responder_from_another_ca() {
        let chain = test_utils::intermediate_chain();
        let (stranger, _) = test_utils::ca();
        let responder = OcspResponder::issued_by(&stranger);
        let response = test_utils::ocsp_response(
            &chain.cert_der,
            &chain.issuer_der,
            &responder,
            OcspAnswer::Good,
        );

        assert!(matches!(
            ocsp_status(&response, &parse(&chain.cert_der), &parse(&chain.issuer_der)),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_ocsp_response_for_another_certificate() {
        let chain = test_utils::intermediate_chain();
        let other = test_utils::intermediate_chain();
        let response = test_utils::ocsp_response(
            &other.cert_der,
            &other.issuer_der,
            &other.issuer_as_responder(),
            OcspAnswer::Good,
        );

        // signed by a CA the check does not trust
        assert!(matches!(
            ocsp_status(&response, &parse(&chain.cert_der), &parse(&chain.issuer_der)),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_set_proxy() {
        let mut transport = HttpTransport::new(&config()).unwrap();
        assert_eq!(transport.proxy(), None);

        transport
            .set_proxy(Some("http://proxy.local:3128".into()))
            .unwrap();
        assert_eq!(transport.proxy(), Some("http://proxy.local:3128"));

        transport.set_proxy(None).unwrap();
        assert_eq!(transport.proxy(), None);
    }

    #[test]
    fn test_timestamp_without_authority() {
        let transport = HttpTransport::new(&config()).unwrap();
        assert!(matches!(
            transport.request_timestamp(HashAlg::Sha256, &[0u8; 32]),
            Err(Error::TimestampUnavailable(_))
        ));

        let transport = transport.with_timestamp(&TimestampConfig {
            url: Some("http://127.0.0.1:9/tsp".into()),
        });
        assert!(matches!(
            transport.request_timestamp(HashAlg::Sha256, &[0u8; 32]),
            Err(Error::TimestampUnavailable(_))
        ));
    }

    #[test]
    fn test_openssl_time() {
        let parsed = openssl_time("Jun  1 00:00:00 2024 GMT").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-06-01T00:00:00+00:00");
        assert!(openssl_time("yesterday").is_none());
    }
}
