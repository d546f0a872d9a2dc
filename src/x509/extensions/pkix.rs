// Copyright (c) 2021 The RustCrypto Project Developers
// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! PKIX certificate extensions used on issued device certificates.

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::{Decode, Encode, Sequence};
use flagset::{flags, FlagSet};

/// BasicConstraints as defined in [RFC 5280 Section 4.2.1.9].
///
/// ```text
/// BasicConstraints ::= SEQUENCE {
///     cA                      BOOLEAN DEFAULT FALSE,
///     pathLenConstraint       INTEGER (0..MAX) OPTIONAL
/// }
/// ```
///
/// [RFC 5280 Section 4.2.1.9]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.2.1.9
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct BasicConstraints {
    #[asn1(default = "bool::default")]
    pub ca: bool,
    pub path_len_constraint: Option<u8>,
}

impl AssociatedOid for BasicConstraints {
    const OID: ObjectIdentifier = const_oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS;
}

flags! {
    /// Key usage flags as defined in [RFC 5280 Section 4.2.1.3].
    ///
    /// ```text
    /// KeyUsage ::= BIT STRING {
    ///      digitalSignature        (0),
    ///      nonRepudiation          (1),  -- recent editions of X.509 have
    ///                                    -- renamed this bit to contentCommitment
    ///      keyEncipherment         (2),
    ///      dataEncipherment        (3),
    ///      keyAgreement            (4),
    ///      keyCertSign             (5),
    ///      cRLSign                 (6),
    ///      encipherOnly            (7),
    ///      decipherOnly            (8)
    /// }
    /// ```
    ///
    /// [RFC 5280 Section 4.2.1.3]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.2.1.3
    #[allow(missing_docs)]
    pub enum KeyUsageFlags: u16 {
        DigitalSignature = 1 << 0,
        NonRepudiation = 1 << 1,
        KeyEncipherment = 1 << 2,
        DataEncipherment = 1 << 3,
        KeyAgreement = 1 << 4,
        KeyCertSign = 1 << 5,
        CRLSign = 1 << 6,
        EncipherOnly = 1 << 7,
        DecipherOnly = 1 << 8,
    }
}

/// KeyUsage as defined in [RFC 5280 Section 4.2.1.3].
///
/// [RFC 5280 Section 4.2.1.3]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.2.1.3
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyUsage(pub FlagSet<KeyUsageFlags>);

impl KeyUsage {
    /// Key usage from a set of flags.
    pub fn new(flags: impl Into<FlagSet<KeyUsageFlags>>) -> Self {
        KeyUsage(flags.into())
    }

    /// DER encoding of the BIT STRING.
    pub fn to_der(&self) -> der::Result<Vec<u8>> {
        self.0.to_vec()
    }

    /// Parses a DER BIT STRING.
    pub fn from_der(bytes: &[u8]) -> der::Result<Self> {
        FlagSet::<KeyUsageFlags>::from_der(bytes).map(KeyUsage)
    }

    /// Whether the digitalSignature bit is set.
    pub fn digital_signature(&self) -> bool {
        self.0.contains(KeyUsageFlags::DigitalSignature)
    }
}

impl AssociatedOid for KeyUsage {
    const OID: ObjectIdentifier = const_oid::db::rfc5280::ID_CE_KEY_USAGE;
}
