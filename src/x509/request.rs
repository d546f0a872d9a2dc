// Copyright (c) 2021 The RustCrypto Project Developers
// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use const_oid::ObjectIdentifier;
use der::asn1::{BitStringRef, SetOfVec};
use der::{AnyRef, Decode, Encode, Enumerated, Sequence};
use ed25519_dalek::Signer;
use spki::{AlgorithmIdentifier, SubjectPublicKeyInfo};

use crate::x509::{
    attr::{Attribute, Attributes},
    extensions::{Extension, Extensions},
    name::{find_common_name, Name},
    verify::{check_algorithm, Verifier},
};
use crate::{Error, Result};

/// PKCS#9 `extensionRequest` attribute identifier (RFC 2985 Section 5.4.2).
pub const EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Version identifier for certification request information.
///
/// (RFC 2986 designates `0` as the only valid version)
#[derive(Clone, Debug, Copy, PartialEq, Eq, Enumerated)]
#[asn1(type = "INTEGER")]
#[repr(u8)]
pub enum Version {
    /// Denotes PKCS#8 v1
    V1 = 0,
}

/// PKCS#10 `CertificationRequestInfo` as defined in [RFC 2986 Section 4].
///
/// ```text
/// CertificationRequestInfo ::= SEQUENCE {
///     version       INTEGER { v1(0) } (v1,...),
///     subject       Name,
///     subjectPKInfo SubjectPublicKeyInfo{{ PKInfoAlgorithms }},
///     attributes    [0] Attributes{{ CRIAttributes }}
/// }
/// ```
///
/// [RFC 2986 Section 4]: https://datatracker.ietf.org/doc/html/rfc2986#section-4
#[derive(Clone, Debug, PartialEq, Eq, Sequence)]
pub struct CertReqInfo<'a> {
    /// Certification request version.
    pub version: Version,

    /// Subject name.
    pub subject: Name<'a>,

    /// Subject public key info.
    pub public_key: SubjectPublicKeyInfo<'a>,

    /// Request attributes.
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    pub attributes: Attributes<'a>,
}

impl<'a> TryFrom<&'a [u8]> for CertReqInfo<'a> {
    type Error = der::Error;

    fn try_from(bytes: &'a [u8]) -> core::result::Result<Self, Self::Error> {
        Self::from_der(bytes)
    }
}

/// PKCS#10 `CertificationRequest` as defined in [RFC 2986 Section 4].
///
/// ```text
/// CertificationRequest ::= SEQUENCE {
///     certificationRequestInfo CertificationRequestInfo,
///     signatureAlgorithm AlgorithmIdentifier{{ SignatureAlgorithms }},
///     signature          BIT STRING
/// }
/// ```
///
/// [RFC 2986 Section 4]: https://datatracker.ietf.org/doc/html/rfc2986#section-4
#[derive(Clone, Debug, PartialEq, Eq, Sequence)]
pub struct CertReq<'a> {
    /// Certification request information.
    pub info: CertReqInfo<'a>,

    /// Signature algorithm identifier.
    pub algorithm: AlgorithmIdentifier<'a>,

    /// Signature.
    pub signature: BitStringRef<'a>,
}

impl<'a> TryFrom<&'a [u8]> for CertReq<'a> {
    type Error = der::Error;

    fn try_from(bytes: &'a [u8]) -> core::result::Result<Self, Self::Error> {
        Self::from_der(bytes)
    }
}

impl<'a> CertReq<'a> {
    /// Build and sign a CSR, returning its DER encoding.
    ///
    /// # Parameters
    ///
    /// @subject: The requested subject name.
    /// @public_key: Raw Ed25519 public key of the signer.
    /// @extensions: Extensions to carry in the `extensionRequest` attribute.
    /// @signer: Signs the request info with the private half of `public_key`.
    pub fn build<S: Signer<ed25519_dalek::Signature>>(
        subject: Name<'_>,
        public_key: &[u8],
        extensions: Extensions<'_>,
        signer: &S,
    ) -> Result<Vec<u8>> {
        let extensions_der = if extensions.is_empty() {
            None
        } else {
            Some(Encode::to_vec(&extensions).map_err(Error::InvalidDer)?)
        };

        let mut attributes = Attributes::new();
        if let Some(extensions_der) = &extensions_der {
            let mut values = SetOfVec::new();
            values
                .add(AnyRef::from_der(extensions_der).map_err(Error::InvalidDer)?)
                .map_err(Error::InvalidDer)?;
            attributes
                .add(Attribute {
                    oid: EXTENSION_REQUEST,
                    values,
                })
                .map_err(Error::InvalidDer)?;
        }

        let info = CertReqInfo {
            version: Version::V1,
            subject,
            public_key: SubjectPublicKeyInfo {
                algorithm: ed25519::pkcs8::ALGORITHM_ID,
                subject_public_key: public_key,
            },
            attributes,
        };

        let info_bytes = info.to_vec().map_err(Error::InvalidDer)?;
        let signature = signer.sign(&info_bytes).to_bytes();

        CertReq {
            info,
            algorithm: ed25519::pkcs8::ALGORITHM_ID,
            signature: BitStringRef::from_bytes(&signature).map_err(Error::InvalidDer)?,
        }
        .to_vec()
        .map_err(Error::InvalidDer)
    }

    /// Verifies a CSR signature against its own subject public key.
    pub fn verify(&self) -> Result<()> {
        check_algorithm(&self.algorithm)?;
        let info_bytes = self.info.to_vec().map_err(Error::InvalidDer)?;
        Verifier::from_spki(&self.info.public_key)?.verify(&info_bytes, self.signature.raw_bytes())
    }

    /// All extensions requested through `extensionRequest` attributes.
    pub fn requested_extensions(&self) -> Result<Extensions<'a>> {
        let mut extensions = Extensions::new();
        for attribute in self.info.attributes.iter() {
            if attribute.oid != EXTENSION_REQUEST {
                continue;
            }
            for value in attribute.values.iter() {
                extensions.extend(
                    value
                        .decode_into::<Extensions<'a>>()
                        .map_err(Error::InvalidDer)?,
                );
            }
        }

        Ok(extensions)
    }

    /// The subject common name, if there is one.
    pub fn common_name(&self) -> Option<String> {
        find_common_name(&self.info.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::name::common_name;

    fn signer() -> ed25519_dalek::Keypair {
        crate::kdf::key_pair_from_seed(&[3u8; 32], b"test").unwrap()
    }

    #[test]
    fn self_signed_request_verifies() {
        let keypair = signer();
        let der = CertReq::build(
            common_name("dev-a").unwrap(),
            keypair.public.as_bytes(),
            Extensions::new(),
            &keypair,
        )
        .unwrap();

        let csr = CertReq::from_der(&der).unwrap();
        csr.verify().unwrap();
        assert_eq!(csr.common_name().as_deref(), Some("dev-a"));
        assert!(csr.requested_extensions().unwrap().is_empty());
    }

    #[test]
    fn request_signed_by_another_key_fails() {
        let keypair = signer();
        let other = crate::kdf::key_pair_from_seed(&[4u8; 32], b"test").unwrap();
        let der = CertReq::build(
            common_name("dev-a").unwrap(),
            keypair.public.as_bytes(),
            Extensions::new(),
            &other,
        )
        .unwrap();

        let csr = CertReq::from_der(&der).unwrap();
        assert!(matches!(csr.verify(), Err(Error::SignatureInvalid(_))));
    }

    #[test]
    fn extensions_travel_in_extension_request() {
        let keypair = signer();
        let oid = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.99999.7");
        let extensions = vec![Extension {
            extn_id: oid,
            critical: false,
            extn_value: &[0x04, 0x02, 0xAA, 0xBB],
        }];
        let der = CertReq::build(
            common_name("dev-b").unwrap(),
            keypair.public.as_bytes(),
            extensions,
            &keypair,
        )
        .unwrap();

        let csr = CertReq::from_der(&der).unwrap();
        let requested = csr.requested_extensions().unwrap();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].extn_id, oid);
        assert!(!requested[0].critical);
        assert_eq!(requested[0].extn_value, &[0x04, 0x02, 0xAA, 0xBB]);
    }
}
