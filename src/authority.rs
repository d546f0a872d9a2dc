// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Certificate authority collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use der::Decode;
use ed25519_dalek::Keypair;
use spin::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::kdf::key_pair_from_seed;
use crate::registry::CertificateRef;
use crate::x509::certificate::Certificate;
use crate::x509::name::common_name;
use crate::x509::request::CertReq;
use crate::x509::time::Validity;
use crate::x509::Verifier;
use crate::{Error, Result};

/// Asynchronous certificate issuance backend.
pub trait CertificateAuthority: Send + Sync {
    /// Submits a DER CSR for issuance.
    ///
    /// Submitting again with the same `idempotency_token` returns the
    /// reference of the first submission and issues nothing new.
    fn issue(&self, csr_der: &[u8], idempotency_token: &str) -> Result<CertificateRef>;

    /// Fetches an issued DER certificate.
    ///
    /// Fails with [`Error::Pending`] while issuance is still in progress.
    fn certificate(&self, certificate_ref: &CertificateRef) -> Result<Vec<u8>>;
}

struct Issued {
    der: Vec<u8>,
    polls_left: u32,
}

#[derive(Default)]
struct Ledger {
    by_token: HashMap<String, CertificateRef>,
    issued: HashMap<CertificateRef, Issued>,
}

/// An in-process Ed25519 certificate authority.
///
/// The signing key is derived from a seed, so an authority rebuilt from the
/// same seed and name keeps verifying the certificates it issued before.
pub struct LocalAuthority {
    name: String,
    key_pair: Keypair,
    validity_days: u32,
    pending_polls: u32,
    clock: Arc<dyn Clock>,
    ledger: RwLock<Ledger>,
}

impl LocalAuthority {
    /// Authority constructor.
    ///
    /// # Parameters
    ///
    /// @seed: Secret the authority key pair is derived from.
    /// @name: Issuer common name.
    /// @validity_days: Lifetime of issued certificates.
    /// @clock: Source of the validity start time.
    pub fn new(seed: &[u8], name: &str, validity_days: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(LocalAuthority {
            name: name.to_owned(),
            key_pair: key_pair_from_seed(seed, b"Certificate_Authority")?,
            validity_days,
            pending_polls: 0,
            clock,
            ledger: RwLock::new(Ledger::default()),
        })
    }

    /// Makes every certificate answer `Pending` for its first `polls` fetches.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Issuer common name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Verifier for certificates issued by this authority.
    pub fn verifier(&self) -> Verifier {
        Verifier::from_public_key(self.key_pair.public)
    }

    /// Number of distinct certificates issued so far.
    pub fn issued_count(&self) -> usize {
        self.ledger.read().issued.len()
    }

    fn sign_csr(&self, csr_der: &[u8]) -> Result<Vec<u8>> {
        let csr = CertReq::from_der(csr_der).map_err(|e| Error::Rejected(e.to_string()))?;
        csr.verify()
            .map_err(|e| Error::Rejected(format!("CSR signature: {e}")))?;

        let validity = Validity::from_now(self.clock.now_millis(), self.validity_days)
            .map_err(Error::InvalidDer)?;

        Certificate::from_csr(common_name(&self.name)?, &csr, validity, &self.key_pair)
    }
}

impl CertificateAuthority for LocalAuthority {
    fn issue(&self, csr_der: &[u8], idempotency_token: &str) -> Result<CertificateRef> {
        if let Some(existing) = self.ledger.read().by_token.get(idempotency_token) {
            debug!(token = idempotency_token, certificate_ref = %existing, "replayed issuance");
            return Ok(existing.clone());
        }

        let der = self.sign_csr(csr_der)?;
        let serial = Certificate::parse(&der)?.serial_hex();

        let mut ledger = self.ledger.write();
        // Lost a race against the same token.
        if let Some(existing) = ledger.by_token.get(idempotency_token) {
            return Ok(existing.clone());
        }

        let certificate_ref =
            CertificateRef(format!("{}/{:06}/{}", self.name, ledger.issued.len() + 1, serial));
        ledger
            .by_token
            .insert(idempotency_token.to_owned(), certificate_ref.clone());
        ledger.issued.insert(
            certificate_ref.clone(),
            Issued {
                der,
                polls_left: self.pending_polls,
            },
        );
        info!(token = idempotency_token, certificate_ref = %certificate_ref, "certificate issued");

        Ok(certificate_ref)
    }

    fn certificate(&self, certificate_ref: &CertificateRef) -> Result<Vec<u8>> {
        let mut ledger = self.ledger.write();
        let issued = ledger
            .issued
            .get_mut(certificate_ref)
            .ok_or_else(|| Error::Rejected(format!("unknown certificate {certificate_ref}")))?;

        if issued.polls_left > 0 {
            issued.polls_left -= 1;
            return Err(Error::Pending);
        }

        Ok(issued.der.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec;

    const JAN_2024: u64 = 1_704_067_200_000;

    fn authority() -> LocalAuthority {
        LocalAuthority::new(&[5u8; 32], "Test Issuing CA", 365, Arc::new(ManualClock::new(JAN_2024)))
            .unwrap()
    }

    fn csr(device_id: &str, seed: u8) -> (Keypair, Vec<u8>) {
        let keypair = key_pair_from_seed(&[seed; 32], b"device").unwrap();
        let der = codec::build_csr(device_id, &keypair, None).unwrap();
        (keypair, der)
    }

    #[test]
    fn issued_certificate_binds_the_device_key() {
        let ca = authority();
        let (keypair, der) = csr("dev-1", 1);

        let certificate_ref = ca.issue(&der, "dev-1").unwrap();
        let cert_der = ca.certificate(&certificate_ref).unwrap();
        let cert = Certificate::parse(&cert_der).unwrap();

        cert.verify(&ca.verifier()).unwrap();
        assert_eq!(cert.subject_public_key(), keypair.public.as_bytes());
        assert_eq!(cert.subject_common_name().as_deref(), Some("dev-1"));
        assert!(cert.tbs_certificate.validity.contains(JAN_2024 + 1));
    }

    #[test]
    fn idempotency_token_returns_the_same_reference() {
        let ca = authority();
        let (_, der) = csr("dev-1", 1);

        let first = ca.issue(&der, "dev-1").unwrap();
        let second = ca.issue(&der, "dev-1").unwrap();

        assert_eq!(first, second);
        assert_eq!(ca.issued_count(), 1);
    }

    #[test]
    fn pending_polls_are_served_first() {
        let ca = authority().with_pending_polls(2);
        let (_, der) = csr("dev-1", 1);
        let certificate_ref = ca.issue(&der, "dev-1").unwrap();

        assert!(matches!(ca.certificate(&certificate_ref), Err(Error::Pending)));
        assert!(matches!(ca.certificate(&certificate_ref), Err(Error::Pending)));
        assert!(ca.certificate(&certificate_ref).is_ok());
    }

    #[test]
    fn forged_request_is_rejected() {
        let ca = authority();
        let (_, mut der) = csr("dev-1", 1);
        let last = der.len() - 1;
        der[last] ^= 0xFF;

        assert!(matches!(ca.issue(&der, "dev-1"), Err(Error::Rejected(_))));
        assert!(matches!(
            ca.certificate(&CertificateRef("nope".into())),
            Err(Error::Rejected(_))
        ));
    }

    #[test]
    fn same_seed_same_authority() {
        let a = authority();
        let b = authority();

        assert_eq!(
            a.verifier().public_key().as_bytes(),
            b.verifier().public_key().as_bytes()
        );
    }
}
