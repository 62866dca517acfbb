//! Certificates carried inside signatures.

use tracing::debug;

use crate::error::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::xmldsig::ns;

/// Every certificate of a CMS container, in encoded order
pub fn from_container(container: &[u8]) -> Result<Vec<Certificate>> {
    let signed_data = crate::cms::parse_signed_data(container)?;
    let certificates: Vec<Certificate> = crate::cms::embedded_certificates(&signed_data)?
        .into_iter()
        .map(|(_, cert)| cert)
        .collect();
    if certificates.is_empty() {
        return Err(Error::NoCertificatePresent);
    }
    debug!(count = certificates.len(), "certificates extracted from container");
    Ok(certificates)
}

/// Every `ds:X509Certificate` and `wsse:BinarySecurityToken`, in document order
pub fn from_xml(xml: &str) -> Result<Vec<Certificate>> {
    use crate::xmldsig::utils::{element_text, find_elements};
    use crate::xmldsig::verifier::decode_base64;

    let spans = find_elements(xml, |tag| {
        tag.is(ns::DS, "X509Certificate") || tag.is(ns::WSSE, "BinarySecurityToken")
    })?;

    let mut certificates = Vec::with_capacity(spans.len());
    for span in &spans {
        let der = decode_base64(&element_text(xml, span)?, &span.name)?;
        certificates.push(Certificate::from_der(der)?);
    }
    if certificates.is_empty() {
        return Err(Error::NoCertificatePresent);
    }
    debug!(count = certificates.len(), "certificates extracted from XML");
    Ok(certificates)
}
