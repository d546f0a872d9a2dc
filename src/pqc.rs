// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! ML-KEM (FIPS 203) key material carried as the auxiliary device key.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

type DecapsulationKey = <MlKem512 as KemCore>::DecapsulationKey;
type EncapsulationKey = <MlKem512 as KemCore>::EncapsulationKey;

/// ML-KEM-512 encapsulation key length.
pub const ML_KEM_512_PUBLIC_KEY_LEN: usize = 800;

/// ML-KEM-512 decapsulation key length.
pub const ML_KEM_512_SECRET_KEY_LEN: usize = 1632;

/// ML-KEM-768 encapsulation key length.
pub const ML_KEM_768_PUBLIC_KEY_LEN: usize = 1184;

/// ML-KEM-1024 encapsulation key length.
pub const ML_KEM_1024_PUBLIC_KEY_LEN: usize = 1568;

/// Encapsulation key lengths accepted as auxiliary device keys.
pub const ACCEPTED_PUBLIC_KEY_LENS: [usize; 3] = [
    ML_KEM_512_PUBLIC_KEY_LEN,
    ML_KEM_768_PUBLIC_KEY_LEN,
    ML_KEM_1024_PUBLIC_KEY_LEN,
];

/// An ML-KEM-512 key pair, kept in encoded form.
pub struct PqcKeyPair {
    secret: Vec<u8>,
    public: Vec<u8>,
}

impl Zeroize for PqcKeyPair {
    fn zeroize(&mut self) {
        self.secret.zeroize();
    }
}

impl Drop for PqcKeyPair {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for PqcKeyPair {}

impl PqcKeyPair {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        let (dk, ek) = MlKem512::generate(&mut rand::thread_rng());
        PqcKeyPair {
            secret: dk.as_bytes().to_vec(),
            public: ek.as_bytes().to_vec(),
        }
    }

    /// Rebuilds a key pair from its encoded halves and checks that they
    /// belong together.
    pub fn from_bytes(secret: &[u8], public: &[u8]) -> Result<Self> {
        if secret.len() != ML_KEM_512_SECRET_KEY_LEN || public.len() != ML_KEM_512_PUBLIC_KEY_LEN {
            return Err(Error::Kem(format!(
                "unexpected key lengths {}/{}",
                secret.len(),
                public.len()
            )));
        }
        let key_pair = PqcKeyPair {
            secret: secret.to_vec(),
            public: public.to_vec(),
        };
        key_pair.self_check()?;

        Ok(key_pair)
    }

    /// The encoded encapsulation key.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// The encoded decapsulation key.
    pub fn secret_key(&self) -> &[u8] {
        &self.secret
    }

    /// Runs one encapsulate/decapsulate round and compares shared secrets.
    pub fn self_check(&self) -> Result<()> {
        let ek = EncapsulationKey::from_bytes(
            &Encoded::<EncapsulationKey>::try_from(self.public.as_slice())
                .map_err(|_| Error::Kem("bad encapsulation key".into()))?,
        );
        let dk = DecapsulationKey::from_bytes(
            &Encoded::<DecapsulationKey>::try_from(self.secret.as_slice())
                .map_err(|_| Error::Kem("bad decapsulation key".into()))?,
        );

        let (ciphertext, sent) = ek
            .encapsulate(&mut rand::thread_rng())
            .map_err(|_| Error::Kem("encapsulation failed".into()))?;
        let received = dk
            .decapsulate(&ciphertext)
            .map_err(|_| Error::Kem("decapsulation failed".into()))?;

        if sent != received {
            return Err(Error::Kem("key pair halves do not match".into()));
        }
        Ok(())
    }
}

impl core::fmt::Debug for PqcKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PqcKeyPair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}
