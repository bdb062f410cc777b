//! Certificate identity extraction.
//!
//! Parses DER-encoded X.509 certificates for two purposes: ordering the
//! certificates of a bundle so the leaf comes first, and summarizing the
//! identity a bundle carries for logs and the `inspect` command. Nothing here
//! rejects a certificate on expiry or trust grounds.

use serde::Serialize;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::DecodeError;

/// Human-readable fields of one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Hex serial number
    pub serial: String,
    /// Start of the validity window
    pub not_before: String,
    /// End of the validity window
    pub not_after: String,
}

impl CertSummary {
    /// Parse a DER certificate and summarize it.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Malformed` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self, DecodeError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| DecodeError::Malformed(format!("certificate: {e}")))?;

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: cert.validity().not_before.to_string(),
            not_after: cert.validity().not_after.to_string(),
        })
    }

    /// Summarize every certificate in a PEM chain, in order.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Malformed` if the PEM or any certificate is invalid.
    pub fn from_pem_chain(pem_chain: &[u8]) -> Result<Vec<Self>, DecodeError> {
        pem::parse_many(pem_chain)
            .map_err(|e| DecodeError::Malformed(format!("PEM: {e}")))?
            .iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| Self::from_der(block.contents()))
            .collect()
    }
}

/// Reorder a bundle's certificates so the leaf comes first.
///
/// The leaf is the first certificate that issued none of the others. The
/// remaining certificates keep their bundle order. If any certificate fails
/// to parse, the input order is returned untouched.
#[must_use]
pub fn leaf_first(mut certs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    if certs.len() < 2 {
        return certs;
    }

    let Some(names) = certs
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .ok()
                .map(|(_, c)| (c.subject().as_raw().to_vec(), c.issuer().as_raw().to_vec()))
        })
        .collect::<Option<Vec<_>>>()
    else {
        return certs;
    };

    let leaf = (0..names.len()).find(|&i| {
        let subject = &names[i].0;
        names
            .iter()
            .enumerate()
            .all(|(j, (_, issuer))| j == i || issuer != subject)
    });

    if let Some(idx) = leaf {
        let leaf_der = certs.remove(idx);
        certs.insert(0, leaf_der);
    }
    certs
}
