// Copyright (c) 2021 The RustCrypto Project Developers
// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Name-related definitions as defined in X.501 (and updated by RFC 5280).

use der::asn1::{PrintableStringRef, SetOfVec, Utf8StringRef};
use der::AnyRef;

use crate::x509::attr::AttributeTypeAndValue;
use crate::{Error, Result};

/// X.501 Name as defined in [RFC 5280 Section 4.1.2.4]. X.501 Name has
/// only one possible CHOICE, the `RDNSequence`.
///
/// [RFC 5280 Section 4.1.2.4]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1.2.4
pub type Name<'a> = RdnSequence<'a>;

/// X.501 RDNSequence as defined in [RFC 5280 Section 4.1.2.4].
///
/// ```text
/// RDNSequence ::= SEQUENCE OF RelativeDistinguishedName
/// ```
///
/// [RFC 5280 Section 4.1.2.4]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1.2.4
pub type RdnSequence<'a> = Vec<RelativeDistinguishedName<'a>>;

/// RelativeDistinguishedName as defined in [RFC 5280 Section 4.1.2.4].
///
/// ```text
/// RelativeDistinguishedName ::= SET SIZE (1..MAX) OF AttributeTypeAndValue
/// ```
///
/// [RFC 5280 Section 4.1.2.4]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1.2.4
pub type RelativeDistinguishedName<'a> = SetOfVec<AttributeTypeAndValue<'a>>;

/// Builds a name holding one ATV for one RDN: `CN=<cn>`.
pub fn common_name(cn: &str) -> Result<Name<'_>> {
    let cn_atv = AttributeTypeAndValue {
        oid: const_oid::db::rfc4519::CN,
        value: AnyRef::from(Utf8StringRef::new(cn).map_err(Error::InvalidDer)?),
    };
    let mut rdn = RelativeDistinguishedName::new();
    rdn.add(cn_atv).map_err(Error::InvalidDer)?;

    Ok(vec![rdn])
}

/// Returns the first common name found in `name`, if any.
pub fn find_common_name(name: &Name<'_>) -> Option<String> {
    name.iter()
        .flat_map(|rdn| rdn.iter())
        .filter(|atv| atv.oid == const_oid::db::rfc4519::CN)
        .find_map(|atv| {
            if let Ok(s) = Utf8StringRef::try_from(atv.value) {
                return Some(s.as_str().to_owned());
            }
            PrintableStringRef::try_from(atv.value)
                .ok()
                .map(|s| s.as_str().to_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::{Decode, Encode};

    #[test]
    fn common_name_survives_der() {
        let name = common_name("sensor-7").unwrap();
        let der = name.to_vec().unwrap();
        let decoded = Name::from_der(&der).unwrap();

        assert_eq!(find_common_name(&decoded).as_deref(), Some("sensor-7"));
    }

    #[test]
    fn empty_name_has_no_common_name() {
        assert_eq!(find_common_name(&Name::new()), None);
    }
}
