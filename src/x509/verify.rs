// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use ed25519_dalek::{PublicKey, Signature, Verifier as _};
use spki::{AlgorithmIdentifier, SubjectPublicKeyInfo};

use crate::{Error, Result};

/// Ed25519 signature verifier bound to one public key.
#[derive(Debug)]
pub struct Verifier {
    key: PublicKey,
}

impl Verifier {
    /// Builds a verifier from a subject public key info.
    ///
    /// Only Ed25519 keys are supported.
    pub fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self> {
        check_algorithm(&spki.algorithm)?;
        Ok(Verifier {
            key: PublicKey::from_bytes(spki.subject_public_key).map_err(Error::InvalidKey)?,
        })
    }

    /// Verifier for a raw Ed25519 public key.
    pub fn from_public_key(key: PublicKey) -> Self {
        Verifier { key }
    }

    /// Checks `signature` over `msg`.
    ///
    /// Failures carry the underlying verifier message and never key bytes.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))?;
        self.key
            .verify(msg, &signature)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }

    /// The public key this verifier checks against.
    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }
}

/// Rejects any algorithm other than Ed25519.
pub(crate) fn check_algorithm(algorithm: &AlgorithmIdentifier<'_>) -> Result<()> {
    if algorithm.oid == ed25519::pkcs8::ALGORITHM_ID.oid {
        Ok(())
    } else {
        Err(Error::UnsupportedAlgorithm(algorithm.oid))
    }
}
