// Copyright (c) 2021 The RustCrypto Project Developers
// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use const_oid::AssociatedOid;
use der::asn1::{BitStringRef, UIntRef};
use der::{Decode, Encode, Enumerated, Sequence};
use ed25519_dalek::Signer;
use spki::{AlgorithmIdentifier, SubjectPublicKeyInfo};

use crate::{
    kdf::derive_key_id,
    x509::{
        extensions::{
            pkix::{BasicConstraints, KeyUsage, KeyUsageFlags},
            Extension, Extensions,
        },
        name::{find_common_name, Name},
        request::CertReq,
        time::Validity,
        verify::{check_algorithm, Verifier},
    },
    Error, Result,
};

/// Maximum supported size for a device certificate.
pub const MAX_CERT_SIZE: usize = 4096;

macro_rules! extension {
    ($extension_bytes:expr, $extension_id:expr, $critical:expr) => {{
        Extension {
            extn_id: $extension_id,
            critical: $critical,
            extn_value: $extension_bytes,
        }
    }};
}

macro_rules! basic_constraints_extension {
    ($extension_bytes:expr) => {{
        extension!($extension_bytes, BasicConstraints::OID, true)
    }};
}

macro_rules! key_usage_extension {
    ($extension_bytes:expr) => {{
        extension!($extension_bytes, KeyUsage::OID, true)
    }};
}

/// Certificate `Version` as defined in [RFC 5280 Section 4.1].
///
/// ```text
/// Version  ::=  INTEGER  {  v1(0), v2(1), v3(2)  }
/// ```
///
/// [RFC 5280 Section 4.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1
#[derive(Clone, Debug, Copy, PartialEq, Eq, Enumerated)]
#[asn1(type = "INTEGER")]
#[repr(u8)]
pub enum Version {
    /// Version 1 (default)
    V1 = 0,

    /// Version 2
    V2 = 1,

    /// Version 3
    V3 = 2,
}

impl Default for Version {
    fn default() -> Self {
        Self::V1
    }
}

/// X.509 `TbsCertificate` as defined in [RFC 5280 Section 4.1]
///
/// ```text
/// TBSCertificate  ::=  SEQUENCE  {
///     version         [0]  EXPLICIT Version DEFAULT v1,
///     serialNumber         CertificateSerialNumber,
///     signature            AlgorithmIdentifier,
///     issuer               Name,
///     validity             Validity,
///     subject              Name,
///     subjectPublicKeyInfo SubjectPublicKeyInfo,
///     issuerUniqueID  [1]  IMPLICIT UniqueIdentifier OPTIONAL,
///     subjectUniqueID [2]  IMPLICIT UniqueIdentifier OPTIONAL,
///     extensions      [3]  Extensions OPTIONAL
/// }
/// ```
///
/// [RFC 5280 Section 4.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct TbsCertificate<'a> {
    /// The certificate version
    ///
    /// Note that this value defaults to Version 1 per the RFC. However,
    /// fields such as `issuer_unique_id`, `subject_unique_id` and `extensions`
    /// require later versions.
    #[asn1(context_specific = "0", default = "Default::default")]
    pub version: Version,

    pub serial_number: UIntRef<'a>,
    pub signature: AlgorithmIdentifier<'a>,
    pub issuer: Name<'a>,
    pub validity: Validity,
    pub subject: Name<'a>,
    pub subject_public_key_info: SubjectPublicKeyInfo<'a>,

    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub issuer_unique_id: Option<BitStringRef<'a>>,

    #[asn1(context_specific = "2", tag_mode = "IMPLICIT", optional = "true")]
    pub subject_unique_id: Option<BitStringRef<'a>>,

    #[asn1(context_specific = "3", tag_mode = "EXPLICIT", optional = "true")]
    pub extensions: Option<Extensions<'a>>,
}

/// X.509 certificates are defined in [RFC 5280 Section 4.1].
///
/// ```text
/// Certificate  ::=  SEQUENCE  {
///     tbsCertificate       TBSCertificate,
///     signatureAlgorithm   AlgorithmIdentifier,
///     signature            BIT STRING
/// }
/// ```
///
/// [RFC 5280 Section 4.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct Certificate<'a> {
    pub tbs_certificate: TbsCertificate<'a>,
    pub signature_algorithm: AlgorithmIdentifier<'a>,
    pub signature: BitStringRef<'a>,
}

impl<'a> Certificate<'a> {
    /// Parses a DER certificate, refusing oversized input.
    pub fn parse(der_bytes: &'a [u8]) -> Result<Self> {
        if der_bytes.len() > MAX_CERT_SIZE {
            return Err(Error::InvalidDer(der::ErrorKind::Overlength.into()));
        }
        Self::from_der(der_bytes).map_err(Error::InvalidDer)
    }

    /// Build an end-entity certificate for a Certificate Signing Request (CSR)
    ///
    /// # Parameters
    ///
    /// @issuer: The issuing authority name.
    /// @csr: The certificate signing request. Its signature must already be verified.
    /// @validity: The certificate validity window.
    /// @signer: Authority key signing the certificate.
    pub fn from_csr<S: Signer<ed25519_dalek::Signature>>(
        issuer: Name<'_>,
        csr: &CertReq<'_>,
        validity: Validity,
        signer: &S,
    ) -> Result<Vec<u8>> {
        // The serial number is derived from the CSR public key.
        let serial_number = derive_key_id(csr.info.public_key.subject_public_key)?;

        Certificate::from_raw_parts(
            &serial_number,
            issuer,
            csr.info.subject.clone(),
            csr.info.public_key,
            validity,
            signer,
        )
    }

    /// Build a certificate from raw parts.
    ///
    /// # Parameters
    ///
    /// @serial_number_bytes: Certificate Serial Number.
    /// @issuer: Certificate Issuer.
    /// @subject: Certificate Subject.
    /// @subject_public_key_info: Subject Public Key Info.
    /// @validity: Certificate validity window.
    /// @signer: A `Signer` trait for signing the certificate.
    pub fn from_raw_parts<S: Signer<ed25519_dalek::Signature>>(
        serial_number_bytes: &[u8],
        issuer: Name<'_>,
        subject: Name<'_>,
        subject_public_key_info: SubjectPublicKeyInfo<'_>,
        validity: Validity,
        signer: &S,
    ) -> Result<Vec<u8>> {
        let serial_number = UIntRef::new(serial_number_bytes).map_err(Error::InvalidDer)?;

        // The subject key signs attestation challenges, nothing else.
        let key_usage_bytes = KeyUsage::new(KeyUsageFlags::DigitalSignature)
            .to_der()
            .map_err(Error::InvalidDer)?;

        // We are not a CA.
        let basic_constraints_bytes = BasicConstraints {
            ca: false,
            path_len_constraint: None,
        }
        .to_vec()
        .map_err(Error::InvalidDer)?;

        let extensions = vec![
            key_usage_extension!(&key_usage_bytes),
            basic_constraints_extension!(&basic_constraints_bytes),
        ];

        let tbs_certificate = TbsCertificate {
            version: Version::V3,
            serial_number,
            signature: ed25519::pkcs8::ALGORITHM_ID,
            issuer,
            validity,
            subject,
            subject_public_key_info,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(extensions),
        };

        // We can now sign the TBS with the authority private key
        // and generate the actual certificate.
        let tbs_bytes = tbs_certificate.to_vec().map_err(Error::InvalidDer)?;
        let signature = signer.sign(&tbs_bytes).to_bytes();

        Certificate {
            tbs_certificate,
            signature_algorithm: ed25519::pkcs8::ALGORITHM_ID,
            signature: BitStringRef::from_bytes(&signature).map_err(Error::InvalidDer)?,
        }
        .to_vec()
        .map_err(Error::InvalidDer)
    }

    /// Verifies the certificate signature against the issuer key.
    pub fn verify(&self, issuer: &Verifier) -> Result<()> {
        check_algorithm(&self.signature_algorithm)?;
        let tbs_bytes = self.tbs_certificate.to_vec().map_err(Error::InvalidDer)?;
        issuer.verify(&tbs_bytes, self.signature.raw_bytes())
    }

    /// Verifier for signatures made by this certificate's subject key.
    pub fn subject_verifier(&self) -> Result<Verifier> {
        Verifier::from_spki(&self.tbs_certificate.subject_public_key_info)
    }

    /// Raw subject public key bytes.
    pub fn subject_public_key(&self) -> &'a [u8] {
        self.tbs_certificate
            .subject_public_key_info
            .subject_public_key
    }

    /// Hex-encoded serial number.
    pub fn serial_hex(&self) -> String {
        hex::encode(self.tbs_certificate.serial_number.as_bytes())
    }

    /// The subject common name, if there is one.
    pub fn subject_common_name(&self) -> Option<String> {
        find_common_name(&self.tbs_certificate.subject)
    }

    /// Certificate extensions, empty for v1 certificates.
    pub fn extensions(&self) -> &[Extension<'a>] {
        self.tbs_certificate.extensions.as_deref().unwrap_or(&[])
    }
}
