// Copyright (c) 2021 The RustCrypto Project Developers
// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! X.501 time types as defined in RFC 5280

use core::time::Duration;
use der::asn1::{GeneralizedTime, UtcTime};
use der::{Choice, Sequence};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// X.501 `Time` as defined in [RFC 5280 Section 4.1.2.5].
///
/// ```text
/// Time ::= CHOICE {
///      utcTime        UTCTime,
///      generalTime    GeneralizedTime
/// }
/// ```
///
/// Dates through the year 2049 MUST be encoded as UTCTime, later ones as
/// GeneralizedTime.
///
/// [RFC 5280 Section 4.1.2.5]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1.2.5
#[derive(Choice, Copy, Clone, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Time {
    #[asn1(type = "UTCTime")]
    UtcTime(UtcTime),

    #[asn1(type = "GeneralizedTime")]
    GeneralTime(GeneralizedTime),
}

impl Time {
    /// Time from milliseconds since the Unix epoch, truncated to seconds.
    pub fn from_unix_millis(millis: u64) -> der::Result<Self> {
        let duration = Duration::from_secs(millis / 1000);
        UtcTime::from_unix_duration(duration)
            .map(Time::UtcTime)
            .or_else(|_| GeneralizedTime::from_unix_duration(duration).map(Time::GeneralTime))
    }

    /// Milliseconds since the Unix epoch.
    pub fn to_unix_millis(&self) -> u64 {
        let duration = match self {
            Time::UtcTime(t) => t.to_unix_duration(),
            Time::GeneralTime(t) => t.to_unix_duration(),
        };
        duration.as_secs() * 1000
    }
}

/// X.501 `Validity` as defined in [RFC 5280 Section 4.1.2.5]
///
/// ```text
/// Validity ::= SEQUENCE {
///     notBefore      Time,
///     notAfter       Time
/// }
/// ```
/// [RFC 5280 Section 4.1.2.5]: https://datatracker.ietf.org/doc/html/rfc5280#section-4.1.2.5
#[derive(Copy, Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Validity {
    /// notBefore value
    pub not_before: Time,

    /// notAfter value
    pub not_after: Time,
}

impl Validity {
    /// Validity window starting at `now_millis` and lasting `days`.
    pub fn from_now(now_millis: u64, days: u32) -> der::Result<Self> {
        Ok(Validity {
            not_before: Time::from_unix_millis(now_millis)?,
            not_after: Time::from_unix_millis(
                now_millis.saturating_add(u64::from(days) * MILLIS_PER_DAY),
            )?,
        })
    }

    /// Whether `millis` falls inside the window.
    pub fn contains(&self, millis: u64) -> bool {
        let millis = millis / 1000 * 1000;
        self.not_before.to_unix_millis() <= millis && millis <= self.not_after.to_unix_millis()
    }
}
