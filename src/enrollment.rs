// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Device registration and asynchronous certificate issuance.
//!
//! A device registers, then uploads a hybrid CSR. The upload lands in the
//! object store and the storage event drives [`Enrollment::process_upload`]:
//! the CSR goes to the CA, the pipeline polls until the certificate exists,
//! writes it back next to the CSR and records the issuance in the registry.

use std::sync::Arc;

use der::Decode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec;
use crate::registry::{
    CertificateRef, ComplianceState, DeviceRecord, Issuance, IssuanceOutcome, Registry,
};
use crate::retry::Backoff;
use crate::store::{self, ObjectStore};
use crate::x509::certificate::Certificate;
use crate::x509::request::CertReq;
use crate::x509::{self, CERTIFICATE_PEM_LABEL, CSR_PEM_LABEL};
use crate::{authority::CertificateAuthority, Error, Result};

/// Longest accepted device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Checks that `device_id` is usable as an object store key component.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let valid = !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidDeviceId(device_id.to_owned()))
    }
}

/// Acknowledges a new registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAck {
    /// Registered device.
    pub device_id: String,
    /// Registration time, Unix milliseconds.
    pub registered_at: u64,
}

/// Issuance metadata written next to the certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceMetadata {
    /// CA reference of the issued certificate.
    pub certificate_ref: CertificateRef,
    /// Object key of the CSR this certificate was issued for.
    pub csr_key: String,
    /// Whether a valid PQC key was found in the CSR.
    pub has_pqc: bool,
    /// Length of that key, 0 without one.
    pub pqc_public_key_length: usize,
    /// Resulting compliance state.
    pub compliance_state: ComplianceState,
    /// Issuance time, Unix seconds.
    pub timestamp: u64,
}

/// Summary of one pass of the issuance pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuanceReport {
    /// Enrolled device.
    pub device_id: String,
    /// Issued certificate.
    pub certificate_ref: CertificateRef,
    /// Recorded compliance state.
    pub compliance_state: ComplianceState,
    /// False when this pass repeated an issuance already recorded.
    pub newly_applied: bool,
}

/// Enrollment workflow.
pub struct Enrollment<R, S, C> {
    registry: Arc<R>,
    store: Arc<S>,
    authority: Arc<C>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
}

impl<R, S, C> Enrollment<R, S, C>
where
    R: Registry,
    S: ObjectStore,
    C: CertificateAuthority,
{
    /// Enrollment constructor.
    ///
    /// # Parameters
    ///
    /// @registry: Device records.
    /// @store: Object exchange with devices.
    /// @authority: Certificate issuance backend.
    /// @clock: Time source for records and metadata.
    /// @backoff: Poll policy while the CA is issuing.
    pub fn new(
        registry: Arc<R>,
        store: Arc<S>,
        authority: Arc<C>,
        clock: Arc<dyn Clock>,
        backoff: Backoff,
    ) -> Self {
        Enrollment {
            registry,
            store,
            authority,
            clock,
            backoff,
        }
    }

    /// Creates the record for a new device.
    pub fn register(&self, device_id: &str) -> Result<RegistrationAck> {
        validate_device_id(device_id)?;

        let registered_at = self.clock.now_millis();
        self.registry
            .create(DeviceRecord::new(device_id, registered_at))?;
        info!(device_id, "device registered");

        Ok(RegistrationAck {
            device_id: device_id.to_owned(),
            registered_at,
        })
    }

    /// Accepts a CSR (PEM or DER) and hands it to the issuance pipeline.
    ///
    /// Returns the object key the CSR was stored under.
    pub fn submit_csr(&self, device_id: &str, csr_bytes: &[u8]) -> Result<String> {
        validate_device_id(device_id)?;
        let der = x509::der_or_pem(CSR_PEM_LABEL, csr_bytes)
            .map_err(|e| Error::InvalidCsr(e.to_string()))?;
        self.check_csr(device_id, &der)?;

        let key = store::csr_key(device_id);
        self.store
            .put(&key, x509::to_pem(CSR_PEM_LABEL, &der)?.as_bytes())?;
        debug!(device_id, key = %key, "CSR accepted");

        Ok(key)
    }

    /// Storage event handler for an uploaded CSR.
    pub fn process_upload(&self, object_key: &str) -> Result<IssuanceReport> {
        let device_id = store::device_id_from_csr_key(object_key)
            .ok_or_else(|| Error::InvalidRequest(format!("not a CSR slot: {object_key}")))?;
        let uploaded = self
            .store
            .get(object_key)?
            .ok_or_else(|| Error::InvalidRequest(format!("no object at {object_key}")))?;

        // Devices may write the slot directly, so nothing upstream is trusted.
        let der = x509::der_or_pem(CSR_PEM_LABEL, &uploaded)
            .map_err(|e| Error::InvalidCsr(e.to_string()))?;
        let csr = self.check_csr(device_id, &der)?;
        let payload = match codec::extension_payload(&csr) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device_id, error = %e, "unreadable extension request");
                None
            }
        };

        info!(device_id, "submitting CSR for issuance");
        let certificate_ref = self.authority.issue(&der, device_id)?;
        let cert_der = self.backoff.poll(
            "certificate issuance",
            || self.authority.certificate(&certificate_ref).map(Some),
            |attempts| Error::IssuanceTimeout {
                device_id: device_id.to_owned(),
                attempts,
            },
        )?;

        let certificate = Certificate::parse(&cert_der)?;
        if certificate.subject_public_key() != csr.info.public_key.subject_public_key {
            return Err(Error::Rejected(format!(
                "certificate {certificate_ref} does not carry the requested key"
            )));
        }

        let pqc_key_len = pqc_key_length(device_id, payload);
        let compliance_state = ComplianceState::from_has_pqc(pqc_key_len.is_some());
        let metadata = IssuanceMetadata {
            certificate_ref: certificate_ref.clone(),
            csr_key: object_key.to_owned(),
            has_pqc: pqc_key_len.is_some(),
            pqc_public_key_length: pqc_key_len.unwrap_or(0),
            compliance_state,
            timestamp: self.clock.now_millis() / 1000,
        };

        let outcome = self.on_issuance_complete(device_id, &certificate_ref, payload)?;

        // Objects are published only once the registry holds the issuance. A
        // repeated event fills in what an interrupted pass left out and leaves
        // the rest alone.
        let newly_applied = matches!(outcome, IssuanceOutcome::Applied(_));
        let cert_key = store::certificate_key(device_id);
        if newly_applied || self.store.get(&cert_key)?.is_none() {
            self.store.put(
                &cert_key,
                x509::to_pem(CERTIFICATE_PEM_LABEL, &cert_der)?.as_bytes(),
            )?;
        }
        let metadata_key = store::metadata_key(device_id);
        if newly_applied || self.store.get(&metadata_key)?.is_none() {
            self.store
                .put(&metadata_key, &serde_json::to_vec(&metadata)?)?;
        }

        Ok(IssuanceReport {
            device_id: device_id.to_owned(),
            certificate_ref,
            compliance_state: outcome
                .record()
                .compliance_state
                .unwrap_or(compliance_state),
            newly_applied,
        })
    }

    // Parses `der` and checks that it is a self-signed request from the
    // registered device `device_id`.
    fn check_csr<'a>(&self, device_id: &str, der: &'a [u8]) -> Result<CertReq<'a>> {
        if self.registry.get(device_id)?.is_none() {
            return Err(Error::UnknownDevice(device_id.to_owned()));
        }

        let csr = CertReq::from_der(der).map_err(|e| Error::InvalidCsr(e.to_string()))?;
        csr.verify()
            .map_err(|e| Error::InvalidCsr(format!("self-signature: {e}")))?;

        match csr.common_name() {
            Some(cn) if cn == device_id => Ok(csr),
            other => Err(Error::InvalidCsr(format!(
                "subject {:?} does not match device {device_id}",
                other.unwrap_or_default()
            ))),
        }
    }

    /// Records a completed issuance.
    ///
    /// The device is `pqc_ok` iff `extension_payload` decodes to a key.
    /// Repeating the call for the same certificate changes nothing.
    pub fn on_issuance_complete(
        &self,
        device_id: &str,
        certificate_ref: &CertificateRef,
        extension_payload: Option<&[u8]>,
    ) -> Result<IssuanceOutcome> {
        let issuance = Issuance {
            certificate_ref: certificate_ref.clone(),
            has_pqc: pqc_key_length(device_id, extension_payload).is_some(),
        };

        let outcome = self.registry.complete_issuance(device_id, &issuance)?;
        match &outcome {
            IssuanceOutcome::Applied(_) => info!(
                device_id,
                certificate_ref = %certificate_ref,
                compliance_state = %issuance.compliance_state(),
                "issuance recorded"
            ),
            IssuanceOutcome::AlreadyApplied(_) => {
                debug!(device_id, certificate_ref = %certificate_ref, "issuance already recorded")
            }
        }

        Ok(outcome)
    }
}

// Length of the PQC key in `payload`, if it holds a valid one.
fn pqc_key_length(device_id: &str, payload: Option<&[u8]>) -> Option<usize> {
    match codec::decode(payload?) {
        Ok(key) if !key.is_empty() => Some(key.len()),
        Ok(_) => None,
        Err(e) => {
            warn!(device_id, error = %e, "ignoring malformed PQC extension");
            None
        }
    }
}
