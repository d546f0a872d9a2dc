// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-device identity records.
//!
//! Each field group has exactly one writer. Enrollment sets the issuance
//! fields once through [`Registry::complete_issuance`], and attestation bumps
//! the attestation fields through [`Registry::record_attestation`]. Backends
//! must make both operations atomic per record.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use spin::RwLock;

use crate::{Error, Result};

/// Opaque reference to a certificate held by the CA.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateRef(pub String);

impl fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a device enrolled with post-quantum key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    /// Classical key only.
    Legacy,
    /// Auxiliary post-quantum key presented at enrollment.
    PqcOk,
}

impl ComplianceState {
    /// Derives the state from the presence of a PQC key.
    pub fn from_has_pqc(has_pqc: bool) -> Self {
        if has_pqc {
            ComplianceState::PqcOk
        } else {
            ComplianceState::Legacy
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceState::Legacy => "legacy",
            ComplianceState::PqcOk => "pqc_ok",
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent attestation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationStatus {
    /// Never attested successfully.
    #[default]
    Unverified,
    /// At least one successful attestation.
    Verified,
}

/// A registered device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Unique device identifier.
    pub device_id: String,
    /// Registration time, Unix milliseconds.
    pub registered_at: u64,
    /// Issued certificate, once enrollment completes.
    pub certificate_ref: Option<CertificateRef>,
    /// Whether the CSR carried an auxiliary PQC key.
    pub has_pqc: bool,
    /// Derived from `has_pqc` at issuance.
    pub compliance_state: Option<ComplianceState>,
    /// Last successful attestation, Unix milliseconds.
    pub last_attested: Option<u64>,
    /// Attestation outcome.
    pub attestation_status: AttestationStatus,
}

impl DeviceRecord {
    /// A freshly registered device.
    pub fn new(device_id: impl Into<String>, registered_at: u64) -> Self {
        DeviceRecord {
            device_id: device_id.into(),
            registered_at,
            certificate_ref: None,
            has_pqc: false,
            compliance_state: None,
            last_attested: None,
            attestation_status: AttestationStatus::Unverified,
        }
    }

    /// Whether enrollment has completed.
    pub fn is_issued(&self) -> bool {
        self.certificate_ref.is_some()
    }
}

/// Issuance fields written together, exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issuance {
    /// The issued certificate.
    pub certificate_ref: CertificateRef,
    /// Whether the CSR carried an auxiliary PQC key.
    pub has_pqc: bool,
}

impl Issuance {
    /// The compliance state implied by this issuance.
    pub fn compliance_state(&self) -> ComplianceState {
        ComplianceState::from_has_pqc(self.has_pqc)
    }
}

/// Result of a conditional issuance write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuanceOutcome {
    /// The fields were empty and are now set.
    Applied(DeviceRecord),
    /// The same certificate was already recorded; nothing changed.
    AlreadyApplied(DeviceRecord),
}

impl IssuanceOutcome {
    /// The record after the write.
    pub fn record(&self) -> &DeviceRecord {
        match self {
            IssuanceOutcome::Applied(r) | IssuanceOutcome::AlreadyApplied(r) => r,
        }
    }
}

/// Device registry backend.
pub trait Registry: Send + Sync {
    /// Inserts a new record, failing with `AlreadyRegistered` if one exists.
    fn create(&self, record: DeviceRecord) -> Result<()>;

    /// Fetches a record.
    fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Sets the issuance fields only if they are still empty.
    ///
    /// Repeating the write with the same certificate is a no-op, a different
    /// certificate fails with `IssuanceConflict`.
    fn complete_issuance(&self, device_id: &str, issuance: &Issuance) -> Result<IssuanceOutcome>;

    /// Marks the device verified and moves `last_attested` forward to `at`.
    fn record_attestation(&self, device_id: &str, at: u64) -> Result<DeviceRecord>;
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All records as JSON, keyed by device id.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&*self.records.read())?)
    }
}

impl Registry for MemoryRegistry {
    fn create(&self, record: DeviceRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.device_id) {
            return Err(Error::AlreadyRegistered(record.device_id));
        }
        records.insert(record.device_id.clone(), record);

        Ok(())
    }

    fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.records.read().get(device_id).cloned())
    }

    fn complete_issuance(&self, device_id: &str, issuance: &Issuance) -> Result<IssuanceOutcome> {
        let mut records = self.records.write();
        let record = records
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_owned()))?;

        match &record.certificate_ref {
            None => {
                record.certificate_ref = Some(issuance.certificate_ref.clone());
                record.has_pqc = issuance.has_pqc;
                record.compliance_state = Some(issuance.compliance_state());
                Ok(IssuanceOutcome::Applied(record.clone()))
            }
            Some(existing) if existing == &issuance.certificate_ref => {
                Ok(IssuanceOutcome::AlreadyApplied(record.clone()))
            }
            Some(_) => Err(Error::IssuanceConflict(device_id.to_owned())),
        }
    }

    fn record_attestation(&self, device_id: &str, at: u64) -> Result<DeviceRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_owned()))?;

        record.attestation_status = AttestationStatus::Verified;
        record.last_attested = Some(record.last_attested.map_or(at, |last| last.max(at)));

        Ok(record.clone())
    }
}
