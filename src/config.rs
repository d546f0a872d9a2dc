// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration and files only need to name what they change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attestation::ChallengePolicy;
use crate::clock::duration_ms;
use crate::retry::Backoff;
use crate::{Error, Result};

/// Poll policy, in serializable form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// First delay.
    pub initial_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Delay growth factor.
    pub multiplier: u32,
    /// Overall deadline, none when absent.
    pub deadline_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::from(&Backoff::default())
    }
}

impl From<&Backoff> for RetryConfig {
    fn from(backoff: &Backoff) -> Self {
        RetryConfig {
            max_attempts: backoff.max_attempts,
            initial_delay_ms: duration_ms(backoff.initial_delay),
            max_delay_ms: duration_ms(backoff.max_delay),
            multiplier: backoff.multiplier,
            deadline_ms: backoff.deadline.map(duration_ms),
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            deadline: config.deadline_ms.map(Duration::from_millis),
        }
    }
}

/// Issuance pipeline settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Poll policy while the CA is issuing.
    pub issuance_poll: RetryConfig,
}

/// In-process certificate authority settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Issuer common name.
    pub name: String,
    /// Hex seed the authority key is derived from. Random when absent.
    pub seed_hex: Option<String>,
    /// Certificate lifetime.
    pub validity_days: u32,
    /// Simulated number of `Pending` answers per certificate.
    pub pending_polls: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig {
            name: "pqattest Issuing CA".into(),
            seed_hex: None,
            validity_days: 365,
            pending_polls: 0,
        }
    }
}

impl AuthorityConfig {
    /// The configured seed, or 32 fresh random bytes.
    pub fn seed(&self) -> Result<Vec<u8>> {
        match &self.seed_hex {
            Some(seed) => {
                hex::decode(seed).map_err(|e| Error::InvalidConfig(format!("authority seed: {e}")))
            }
            None => {
                let mut seed = vec![0u8; 32];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
                Ok(seed)
            }
        }
    }
}

/// Challenge lifetimes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// How long a challenge may be answered.
    pub challenge_ttl_ms: u64,
    /// How long a used challenge is remembered.
    pub replay_window_ms: u64,
    /// Outstanding challenges a single device may hold.
    pub max_pending_challenges: usize,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        AttestationConfig::from(&ChallengePolicy::default())
    }
}

impl From<&ChallengePolicy> for AttestationConfig {
    fn from(policy: &ChallengePolicy) -> Self {
        AttestationConfig {
            challenge_ttl_ms: duration_ms(policy.ttl),
            replay_window_ms: duration_ms(policy.replay_window),
            max_pending_challenges: policy.max_pending_per_device,
        }
    }
}

impl From<&AttestationConfig> for ChallengePolicy {
    fn from(config: &AttestationConfig) -> Self {
        ChallengePolicy {
            ttl: Duration::from_millis(config.challenge_ttl_ms),
            replay_window: Duration::from_millis(config.replay_window_ms),
            max_pending_per_device: config.max_pending_challenges,
        }
    }
}

/// Device agent settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Where the device keeps its keys and certificate.
    pub key_dir: PathBuf,
    /// Poll policy while waiting for the certificate.
    pub certificate_poll: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            key_dir: PathBuf::from("device_keys"),
            certificate_poll: RetryConfig::default(),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Issuance pipeline.
    pub enrollment: EnrollmentConfig,
    /// Certificate authority.
    pub authority: AuthorityConfig,
    /// Attestation workflow.
    pub attestation: AttestationConfig,
    /// Device agent.
    pub agent: AgentConfig,
}

impl Config {
    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<()> {
        for (name, retry) in [
            ("enrollment.issuance_poll", &self.enrollment.issuance_poll),
            ("agent.certificate_poll", &self.agent.certificate_poll),
        ] {
            if retry.max_attempts == 0 {
                return Err(Error::InvalidConfig(format!("{name}.max_attempts must be positive")));
            }
        }
        if self.attestation.challenge_ttl_ms == 0 {
            return Err(Error::InvalidConfig("attestation.challenge_ttl_ms must be positive".into()));
        }
        if self.attestation.max_pending_challenges == 0 {
            return Err(Error::InvalidConfig(
                "attestation.max_pending_challenges must be positive".into(),
            ));
        }
        if self.attestation.replay_window_ms < self.attestation.challenge_ttl_ms {
            return Err(Error::InvalidConfig(
                "attestation.replay_window_ms must not be shorter than the challenge TTL".into(),
            ));
        }
        Ok(())
    }
}
