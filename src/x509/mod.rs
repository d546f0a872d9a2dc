// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! X.509 certificate and PKCS#10 request structures.

use pem_rfc7468::LineEnding;

use crate::{Error, Result};

/// Attribute types and values
pub mod attr;

/// X.509 certificates
pub mod certificate;

/// Certificate extensions
pub mod extensions;

/// Distinguished names
pub mod name;

/// PKCS#10 certification requests
pub mod request;

/// Validity times
pub mod time;

mod verify;

pub use verify::Verifier;

/// PEM label of a PKCS#10 request.
pub const CSR_PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// PEM label of an X.509 certificate.
pub const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

/// Wraps DER bytes in PEM armor.
pub fn to_pem(label: &str, der_bytes: &[u8]) -> Result<String> {
    pem_rfc7468::encode_string(label, LineEnding::LF, der_bytes).map_err(Error::InvalidPem)
}

/// Strips PEM armor, checking the label.
pub fn from_pem(expected_label: &str, pem: &[u8]) -> Result<Vec<u8>> {
    let (label, der_bytes) = pem_rfc7468::decode_vec(pem).map_err(Error::InvalidPem)?;
    if label != expected_label {
        return Err(Error::InvalidPem(pem_rfc7468::Error::Label));
    }
    Ok(der_bytes)
}

/// Accepts either PEM armored or raw DER input.
pub fn der_or_pem(expected_label: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(b"-----BEGIN") {
        from_pem(expected_label, bytes)
    } else {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_armor_round_trip() {
        let pem = to_pem(CERTIFICATE_PEM_LABEL, &[0x30, 0x03, 0x02, 0x01, 0x05]).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(
            der_or_pem(CERTIFICATE_PEM_LABEL, pem.as_bytes()).unwrap(),
            [0x30, 0x03, 0x02, 0x01, 0x05]
        );
    }

    #[test]
    fn pem_label_must_match() {
        let pem = to_pem(CSR_PEM_LABEL, &[0x30, 0x00]).unwrap();
        assert!(matches!(
            from_pem(CERTIFICATE_PEM_LABEL, pem.as_bytes()),
            Err(Error::InvalidPem(_))
        ));
    }

    #[test]
    fn raw_der_passes_through() {
        assert_eq!(der_or_pem(CSR_PEM_LABEL, &[0x30, 0x00]).unwrap(), [0x30, 0x00]);
    }
}
