// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use digest::Digest;
use ed25519_dalek::{Keypair, SecretKey, SECRET_KEY_LENGTH};
use hkdf::{Hkdf, HmacImpl};

use crate::{Error, Result};

pub(crate) type HmacSha256 = hmac::Hmac<sha2::Sha256>;

/// Length of the identifiers derived from public keys.
pub(crate) const KEY_ID_LEN: usize = 16;

// From the OpenDice implementation.
pub(crate) const ID_SALT: [u8; 64] = [
    0xDB, 0xDB, 0xAE, 0xBC, 0x80, 0x20, 0xDA, 0x9F, 0xF0, 0xDD, 0x5A, 0x24, 0xC8, 0x3A, 0xA5, 0xA5,
    0x42, 0x86, 0xDF, 0xC2, 0x63, 0x03, 0x1E, 0x32, 0x9B, 0x4D, 0xA1, 0x48, 0x43, 0x06, 0x59, 0xFE,
    0x62, 0xCD, 0xB5, 0xB7, 0xE1, 0xE0, 0x0F, 0xC6, 0x80, 0x30, 0x67, 0x11, 0xEB, 0x44, 0x4A, 0xF7,
    0x72, 0x09, 0x35, 0x94, 0x96, 0xFC, 0xFF, 0x1D, 0xB9, 0x52, 0x0B, 0xA5, 0x1C, 0x7B, 0x29, 0xEA,
];

// From the OpenDice implementation
pub(crate) const ASYM_SALT: [u8; 64] = [
    0x63, 0xB6, 0xA0, 0x4D, 0x2C, 0x07, 0x7F, 0xC1, 0x0F, 0x63, 0x9F, 0x21, 0xDA, 0x79, 0x38, 0x44,
    0x35, 0x6C, 0xC2, 0xB0, 0xB4, 0x41, 0xB3, 0xA7, 0x71, 0x24, 0x03, 0x5C, 0x03, 0xF8, 0xE1, 0xBE,
    0x60, 0x35, 0xD3, 0x1F, 0x28, 0x28, 0x21, 0xA7, 0x45, 0x0A, 0x02, 0x22, 0x2A, 0xB1, 0xB3, 0xCF,
    0xF1, 0x67, 0x9B, 0x05, 0xAB, 0x1C, 0xA5, 0xD1, 0xAF, 0xFB, 0x78, 0x9C, 0xCD, 0x2B, 0x0B, 0x3B,
];

// Generic HKDF-based derivation function
pub(crate) fn kdf<D: Digest, H: HmacImpl<D>>(
    input_key_material: &[u8],
    salt: &[u8],
    info: &[&[u8]],
    output_key_material: &mut [u8],
) -> Result<()> {
    // First extract a pseudorandom key from the IKM.
    let kdf = Hkdf::<D, H>::new(Some(salt), input_key_material);

    // Now expand the pseudorandom key into the OKM.
    kdf.expand_multi_info(info, output_key_material)
        .map_err(Error::InvalidExpansion)
}

// Extract and expand a key identifier from a public key.
// Used as the certificate serial number and as the authority key identifier.
pub(crate) fn derive_key_id(public_key: &[u8]) -> Result<[u8; KEY_ID_LEN]> {
    let mut key_id = [0u8; KEY_ID_LEN];
    kdf::<sha2::Sha256, HmacSha256>(public_key, &ID_SALT, &[b"KEY_ID"], &mut key_id)?;
    Ok(key_id)
}

/// Extract and expand an Ed25519 key pair from a seed.
pub(crate) fn key_pair_from_seed(seed: &[u8], label: &[u8]) -> Result<Keypair> {
    let mut private_key_bytes = [0u8; SECRET_KEY_LENGTH];
    kdf::<sha2::Sha256, HmacSha256>(seed, &ASYM_SALT, &[b"Key_Pair", label], &mut private_key_bytes)?;
    let secret = SecretKey::from_bytes(&private_key_bytes).map_err(Error::InvalidKey);
    zeroize::Zeroize::zeroize(&mut private_key_bytes);
    let secret = secret?;
    Ok(Keypair {
        public: (&secret).into(),
        secret,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_invalid_okm() {
        let ikm = [0u8; 64];
        let mut okm = [0u8; 16384];

        assert!(kdf::<sha2::Sha256, HmacSha256>(&ikm, &ID_SALT, &[], &mut okm).is_err());
    }

    #[test]
    fn key_pair_is_stable_per_seed_and_label() {
        let seed = [7u8; 32];
        let a = key_pair_from_seed(&seed, b"device").unwrap();
        let b = key_pair_from_seed(&seed, b"device").unwrap();
        let c = key_pair_from_seed(&seed, b"authority").unwrap();

        assert_eq!(a.public.as_bytes(), b.public.as_bytes());
        assert_ne!(a.public.as_bytes(), c.public.as_bytes());
    }

    #[test]
    fn key_id_depends_on_key() {
        assert_ne!(derive_key_id(&[1u8; 32]).unwrap(), derive_key_id(&[2u8; 32]).unwrap());
    }
}
