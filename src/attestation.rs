// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Challenge/response attestation.
//!
//! A challenge is bound to one device and one issue time. It is consumed by
//! the first verification attempt, whatever the outcome, and remembered for
//! the replay window afterwards. Only devices that proved possession of the
//! certified key *and* enrolled with PQC key material are marked verified.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spin::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::authority::CertificateAuthority;
use crate::clock::{duration_ms, Clock};
use crate::kdf::{kdf, HmacSha256};
use crate::registry::{ComplianceState, Registry};
use crate::x509::certificate::Certificate;
use crate::{Error, Result};

/// Length of the derived challenge, before hex encoding.
pub const CHALLENGE_LEN: usize = 32;

const SALT_LEN: usize = 32;

/// Challenge lifetimes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChallengePolicy {
    /// How long an issued challenge may be answered.
    pub ttl: Duration,
    /// How long a challenge is remembered after issue or use.
    pub replay_window: Duration,
    /// Outstanding challenges per device. Issuing past the limit drops that
    /// device's oldest one.
    pub max_pending_per_device: usize,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        ChallengePolicy {
            ttl: Duration::from_secs(120),
            replay_window: Duration::from_secs(600),
            max_pending_per_device: 8,
        }
    }
}

/// A successful attestation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResult {
    /// Attested device.
    pub device_id: String,
    /// Its compliance state, always `pqc_ok` here.
    pub compliance_state: ComplianceState,
    /// New `last_attested` value, Unix milliseconds.
    pub last_attested: u64,
}

struct Pending {
    device_id: String,
    issued_at: u64,
    seq: u64,
}

// Outstanding and recently used challenges.
#[derive(Default)]
struct ChallengeBook {
    pending: HashMap<String, Pending>,
    consumed: HashMap<String, u64>,
    next_seq: u64,
}

impl ChallengeBook {
    fn prune(&mut self, now: u64, replay_window: u64) {
        // Expired entries stay pending for the replay window so that late
        // answers are reported as expired rather than unknown.
        self.pending
            .retain(|_, p| now < p.issued_at.saturating_add(replay_window));
        self.consumed
            .retain(|_, at| now < at.saturating_add(replay_window));
    }

    // Adds a challenge, evicting the device's oldest ones beyond `limit`.
    fn issue(&mut self, challenge: String, device_id: &str, issued_at: u64, limit: usize) {
        let mut held: Vec<(u64, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.device_id == device_id)
            .map(|(c, p)| (p.seq, c.clone()))
            .collect();
        held.sort_unstable();

        let excess = (held.len() + 1).saturating_sub(limit.max(1));
        for (_, evicted) in held.into_iter().take(excess) {
            self.pending.remove(&evicted);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            challenge,
            Pending {
                device_id: device_id.to_owned(),
                issued_at,
                seq,
            },
        );
    }

    fn consume(&mut self, device_id: &str, challenge: &str, now: u64, ttl: u64) -> Result<()> {
        if self.consumed.contains_key(challenge) {
            return Err(Error::ChallengeReplayed);
        }

        match self.pending.get(challenge) {
            Some(p) if p.device_id == device_id => {}
            _ => return Err(Error::UnknownChallenge),
        }

        let issued_at = self
            .pending
            .remove(challenge)
            .map(|p| p.issued_at)
            .unwrap_or_default();
        self.consumed.insert(challenge.to_owned(), now);

        if now >= issued_at.saturating_add(ttl) {
            return Err(Error::ChallengeExpired);
        }
        Ok(())
    }
}

/// Attestation workflow.
pub struct Attestation<R, C> {
    registry: Arc<R>,
    authority: Arc<C>,
    clock: Arc<dyn Clock>,
    policy: ChallengePolicy,
    secret: Zeroizing<[u8; 32]>,
    book: RwLock<ChallengeBook>,
}

impl<R, C> Attestation<R, C>
where
    R: Registry,
    C: CertificateAuthority,
{
    /// Attestation constructor with a fresh random challenge secret.
    pub fn new(
        registry: Arc<R>,
        authority: Arc<C>,
        clock: Arc<dyn Clock>,
        policy: ChallengePolicy,
    ) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), secret.as_mut_slice());

        Attestation {
            registry,
            authority,
            clock,
            policy,
            secret,
            book: RwLock::new(ChallengeBook::default()),
        }
    }

    /// Issues a single-use challenge to a registered device.
    pub fn request_challenge(&self, device_id: &str) -> Result<String> {
        if self.registry.get(device_id)?.is_none() {
            return Err(Error::UnknownDevice(device_id.to_owned()));
        }

        let issued_at = self.clock.now_millis();
        let mut salt = [0u8; SALT_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);

        let mut okm = [0u8; CHALLENGE_LEN];
        kdf::<sha2::Sha256, HmacSha256>(
            self.secret.as_slice(),
            &salt,
            &[device_id.as_bytes(), &issued_at.to_be_bytes()],
            &mut okm,
        )?;
        let challenge = hex::encode(okm);

        let mut book = self.book.write();
        book.prune(issued_at, self.replay_window_ms());
        book.issue(
            challenge.clone(),
            device_id,
            issued_at,
            self.policy.max_pending_per_device,
        );
        debug!(device_id, "challenge issued");

        Ok(challenge)
    }

    /// Verifies a signed challenge and, for compliant devices, records the
    /// attestation.
    pub fn verify(
        &self,
        device_id: &str,
        challenge: &str,
        signature: &[u8],
    ) -> Result<AttestationResult> {
        let record = self
            .registry
            .get(device_id)?
            .ok_or_else(|| Error::UnknownDevice(device_id.to_owned()))?;

        let now = self.clock.now_millis();
        {
            let mut book = self.book.write();
            book.prune(now, self.replay_window_ms());
            book.consume(device_id, challenge, now, duration_ms(self.policy.ttl))?;
        }

        let certificate_ref = record
            .certificate_ref
            .as_ref()
            .ok_or_else(|| Error::CertificateMissing(device_id.to_owned()))?;
        let cert_der = self.authority.certificate(certificate_ref)?;
        let certificate = Certificate::parse(&cert_der)?;

        if !certificate.tbs_certificate.validity.contains(now) {
            return Err(Error::SignatureInvalid(format!(
                "certificate {certificate_ref} is not valid at this time"
            )));
        }
        if let Err(e) = certificate
            .subject_verifier()?
            .verify(challenge.as_bytes(), signature)
        {
            warn!(device_id, error = %e, "challenge signature rejected");
            return Err(e);
        }

        match record.compliance_state {
            Some(ComplianceState::PqcOk) => {}
            other => {
                let compliance_state = other.unwrap_or(ComplianceState::Legacy);
                warn!(device_id, %compliance_state, "attestation refused for non-compliant device");
                return Err(Error::NonCompliantDevice {
                    device_id: device_id.to_owned(),
                    compliance_state,
                });
            }
        }

        let updated = self.registry.record_attestation(device_id, now)?;
        info!(device_id, "device attested");

        Ok(AttestationResult {
            device_id: device_id.to_owned(),
            compliance_state: ComplianceState::PqcOk,
            last_attested: updated.last_attested.unwrap_or(now),
        })
    }

    /// Challenges issued and not yet consumed or forgotten.
    pub fn pending_challenges(&self) -> usize {
        self.book.read().pending.len()
    }

    fn replay_window_ms(&self) -> u64 {
        duration_ms(self.policy.replay_window.max(self.policy.ttl))
    }
}
