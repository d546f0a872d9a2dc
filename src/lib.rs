// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Hybrid post-quantum device enrollment and attestation.
//!
//! Devices enroll with a classical Ed25519 certificate signing request that
//! carries an auxiliary ML-KEM public key in a vendor extension. The issuance
//! pipeline records whether that key was present, and the attestation
//! workflow only accepts challenge responses from devices that enrolled with
//! one.

use const_oid::ObjectIdentifier;
use thiserror::Error;

use crate::registry::ComplianceState;

/// Broad error classes, used to pick a response status and a retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request input. Rejected without any state change.
    ClientInput,
    /// Unknown, duplicate or incomplete device identity.
    Identity,
    /// A signature, CSR, extension or challenge did not check out.
    Crypto,
    /// The device proved key possession but is not PQC compliant.
    Compliance,
    /// A collaborator (CA, object store, remote endpoint) failed or timed out.
    Upstream,
    /// Local I/O or encoding failure.
    Internal,
}

/// Attestation errors
#[derive(Debug, Error)]
pub enum Error {
    /// Request body could not be understood
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Device identifier is empty or malformed
    #[error("invalid device id {0:?}")]
    InvalidDeviceId(String),

    /// A record already exists for this device
    #[error("device {0} is already registered")]
    AlreadyRegistered(String),

    /// No record exists for this device
    #[error("device {0} is not registered")]
    UnknownDevice(String),

    /// Enrollment never completed for this device
    #[error("no certificate has been issued to device {0}")]
    CertificateMissing(String),

    /// Issuance fields are already set to a different certificate
    #[error("device {0} already holds a different certificate")]
    IssuanceConflict(String),

    /// The CSR does not parse or does not verify
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// The vendor extension payload does not hold a plausible key
    #[error("malformed PQC extension: {0}")]
    MalformedExtension(String),

    /// Signature over the challenge did not verify
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Valid signature from a device without PQC key material
    #[error("device {device_id} is not PQC compliant ({compliance_state})")]
    NonCompliantDevice {
        /// Device that attempted attestation
        device_id: String,
        /// Its recorded compliance state
        compliance_state: ComplianceState,
    },

    /// Challenge was never issued, or was issued to another device
    #[error("unknown challenge")]
    UnknownChallenge,

    /// Challenge has already been consumed
    #[error("challenge has already been used")]
    ChallengeReplayed,

    /// Challenge outlived its validity window
    #[error("challenge has expired")]
    ChallengeExpired,

    /// Key or signature algorithm we cannot verify
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),

    /// Invalid DER encoding
    #[error("invalid DER: {0}")]
    InvalidDer(der::Error),

    /// Invalid PEM armor
    #[error("invalid PEM: {0}")]
    InvalidPem(pem_rfc7468::Error),

    /// Invalid Key bytes
    #[error("invalid key: {0}")]
    InvalidKey(ed25519_dalek::SignatureError),

    /// ML-KEM key material failed to load or round-trip
    #[error("ML-KEM failure: {0}")]
    Kem(String),

    /// Failed to expand the extracted key
    #[error("key expansion failed: {0}")]
    InvalidExpansion(hkdf::InvalidLength),

    /// Collaborator is still working on the request
    #[error("operation still in progress")]
    Pending,

    /// Collaborator is temporarily unreachable
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// Collaborator refused the request for good
    #[error("collaborator rejected request: {0}")]
    Rejected(String),

    /// The CA did not produce a certificate within the poll budget
    #[error("certificate issuance for {device_id} timed out after {attempts} attempts")]
    IssuanceTimeout {
        /// Device being enrolled
        device_id: String,
        /// Poll attempts made
        attempts: u32,
    },

    /// The agent never saw its certificate appear
    #[error("enrollment of {device_id} timed out after {attempts} attempts")]
    EnrollmentTimeout {
        /// Device being enrolled
        device_id: String,
        /// Poll attempts made
        attempts: u32,
    },

    /// Error response from a remote endpoint
    #[error("endpoint returned {status}: {message}")]
    Api {
        /// Response status
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// Configuration could not be loaded
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local storage failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) | Error::InvalidDeviceId(_) => ErrorKind::ClientInput,
            Error::AlreadyRegistered(_)
            | Error::UnknownDevice(_)
            | Error::CertificateMissing(_)
            | Error::IssuanceConflict(_) => ErrorKind::Identity,
            Error::InvalidCsr(_)
            | Error::MalformedExtension(_)
            | Error::SignatureInvalid(_)
            | Error::UnknownChallenge
            | Error::ChallengeReplayed
            | Error::ChallengeExpired
            | Error::UnsupportedAlgorithm(_)
            | Error::InvalidDer(_)
            | Error::InvalidKey(_)
            | Error::Kem(_) => ErrorKind::Crypto,
            Error::NonCompliantDevice { .. } => ErrorKind::Compliance,
            Error::Pending
            | Error::Unavailable(_)
            | Error::Rejected(_)
            | Error::IssuanceTimeout { .. }
            | Error::EnrollmentTimeout { .. }
            | Error::Api { .. } => ErrorKind::Upstream,
            Error::InvalidPem(_)
            | Error::InvalidExpansion(_)
            | Error::InvalidConfig(_)
            | Error::Json(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a poll loop should try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Pending | Error::Unavailable(_))
    }
}

/// Crate result.
pub type Result<T> = core::result::Result<T, Error>;

/// Device side of the protocol
pub mod agent;

/// Transport-agnostic request handlers
pub mod api;

/// Challenge/response attestation
pub mod attestation;

/// Certificate authority collaborator
pub mod authority;

/// Wall clock abstraction
pub mod clock;

/// Hybrid CSR extension codec
pub mod codec;

/// Runtime configuration
pub mod config;

/// Device registration and certificate issuance
pub mod enrollment;

/// Post-quantum key material
pub mod pqc;

/// Device registry
pub mod registry;

/// Bounded polling
pub mod retry;

/// Object exchange collaborator
pub mod store;

/// X.509 and PKCS#10 structures
pub mod x509;

// Key Derivation Function module
mod kdf;
