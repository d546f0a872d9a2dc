// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Hybrid CSR codec.
//!
//! The auxiliary post-quantum public key travels in a vendor extension of an
//! otherwise classical Ed25519 PKCS#10 request. The extension payload is a
//! single DER OCTET STRING holding the raw key; `extnValue` adds the one
//! OCTET STRING layer X.509 mandates around it.

use const_oid::ObjectIdentifier;
use der::asn1::OctetStringRef;
use der::{Decode, Encode};
use ed25519_dalek::Keypair;

use crate::pqc::ACCEPTED_PUBLIC_KEY_LENS;
use crate::x509::extensions::{find, Extension, Extensions};
use crate::x509::name::common_name;
use crate::x509::request::CertReq;
use crate::{Error, Result};

/// Vendor extension carrying the auxiliary PQC public key.
pub const PQC_EXTENSION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.99999.1.1");

/// Wraps a raw PQC public key into an extension payload.
pub fn encode(pqc_public_key: &[u8]) -> Result<Vec<u8>> {
    OctetStringRef::new(pqc_public_key)
        .and_then(|os| os.to_vec())
        .map_err(Error::InvalidDer)
}

/// Unwraps an extension payload back into the raw PQC public key.
///
/// The payload must be exactly one OCTET STRING, and the key inside must
/// have an ML-KEM encapsulation key length.
pub fn decode(payload: &[u8]) -> Result<&[u8]> {
    let key = OctetStringRef::from_der(payload)
        .map_err(|e| Error::MalformedExtension(e.to_string()))?
        .as_bytes();

    if !ACCEPTED_PUBLIC_KEY_LENS.contains(&key.len()) {
        return Err(Error::MalformedExtension(format!(
            "unexpected key length {}",
            key.len()
        )));
    }

    Ok(key)
}

/// The non-critical vendor extension around `payload`.
pub fn extension(payload: &[u8]) -> Extension<'_> {
    Extension {
        extn_id: PQC_EXTENSION_OID,
        critical: false,
        extn_value: payload,
    }
}

/// Builds a self-signed hybrid CSR for `device_id`.
///
/// The subject is `CN=<device_id>` and the SPKI is the Ed25519 key of
/// `keypair`. When `pqc_public_key` is given, it is carried in the vendor
/// extension of the `extensionRequest` attribute.
pub fn build_csr(
    device_id: &str,
    keypair: &Keypair,
    pqc_public_key: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let payload = pqc_public_key.map(encode).transpose()?;

    let mut extensions = Extensions::new();
    if let Some(payload) = &payload {
        extensions.push(extension(payload));
    }

    CertReq::build(
        common_name(device_id)?,
        keypair.public.as_bytes(),
        extensions,
        keypair,
    )
}

/// Finds the vendor extension payload among the requested extensions.
pub fn extension_payload<'a>(csr: &CertReq<'a>) -> Result<Option<&'a [u8]>> {
    let extensions = csr.requested_extensions()?;
    Ok(find(&extensions, &PQC_EXTENSION_OID).map(|e| e.extn_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pqc::{ML_KEM_1024_PUBLIC_KEY_LEN, ML_KEM_512_PUBLIC_KEY_LEN, ML_KEM_768_PUBLIC_KEY_LEN};

    fn keypair() -> Keypair {
        crate::kdf::key_pair_from_seed(&[9u8; 32], b"device").unwrap()
    }

    #[test]
    fn payload_round_trips_every_ml_kem_size() {
        for len in [
            ML_KEM_512_PUBLIC_KEY_LEN,
            ML_KEM_768_PUBLIC_KEY_LEN,
            ML_KEM_1024_PUBLIC_KEY_LEN,
        ] {
            let key: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let payload = encode(&key).unwrap();
            assert_eq!(decode(&payload).unwrap(), key.as_slice());
        }
    }

    #[test]
    fn payload_is_wrapped_once() {
        let key = [0x5Au8; ML_KEM_512_PUBLIC_KEY_LEN];
        let payload = encode(&key).unwrap();

        // OCTET STRING, long form length 800 = 0x0320.
        assert_eq!(&payload[..4], &[0x04, 0x82, 0x03, 0x20]);
        assert_eq!(&payload[4..], &key[..]);
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        let key = [1u8; ML_KEM_512_PUBLIC_KEY_LEN];
        let payload = encode(&key).unwrap();

        let mut trailing = payload.clone();
        trailing.push(0);
        assert!(matches!(decode(&trailing), Err(Error::MalformedExtension(_))));

        assert!(matches!(
            decode(&payload[..payload.len() - 1]),
            Err(Error::MalformedExtension(_))
        ));

        let short = encode(&key[..799]).unwrap();
        assert!(matches!(decode(&short), Err(Error::MalformedExtension(_))));

        assert!(matches!(decode(&key), Err(Error::MalformedExtension(_))));
        assert!(matches!(decode(&[]), Err(Error::MalformedExtension(_))));

        // Double wrapped.
        let double = encode(&payload).unwrap();
        assert!(matches!(decode(&double), Err(Error::MalformedExtension(_))));
    }

    #[test]
    fn hybrid_csr_carries_the_key() {
        let keypair = keypair();
        let pqc = [7u8; ML_KEM_512_PUBLIC_KEY_LEN];
        let der = build_csr("dev-1", &keypair, Some(&pqc[..])).unwrap();

        let csr = CertReq::from_der(&der).unwrap();
        csr.verify().unwrap();
        assert_eq!(csr.common_name().as_deref(), Some("dev-1"));

        let requested = csr.requested_extensions().unwrap();
        let ext = find(&requested, &PQC_EXTENSION_OID).unwrap();
        assert!(!ext.critical);

        let payload = extension_payload(&csr).unwrap().unwrap();
        assert_eq!(decode(payload).unwrap(), &pqc[..]);
    }

    #[test]
    fn classical_csr_has_no_payload() {
        let der = build_csr("dev-2", &keypair(), None).unwrap();
        let csr = CertReq::from_der(&der).unwrap();

        csr.verify().unwrap();
        assert_eq!(extension_payload(&csr).unwrap(), None);
    }
}
