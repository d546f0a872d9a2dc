// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Device side of the protocol.
//!
//! The agent owns a long-lived identity on local storage: an Ed25519 signing
//! key and an ML-KEM key pair. It enrolls once, keeps the issued certificate
//! next to its keys, and attests on every run.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Keypair, SecretKey, Signer, SECRET_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::api::Gateway;
use crate::codec;
use crate::pqc::PqcKeyPair;
use crate::registry::ComplianceState;
use crate::retry::Backoff;
use crate::store::{self, ObjectStore};
use crate::x509::certificate::Certificate;
use crate::x509::{self, CERTIFICATE_PEM_LABEL, CSR_PEM_LABEL};
use crate::{Error, Result};

const SIGNING_KEY_FILE: &str = "device_ed25519.key";
const PQC_SECRET_FILE: &str = "device_mlkem512.dk";
const PQC_PUBLIC_FILE: &str = "device_mlkem512.ek";
const CERTIFICATE_FILE: &str = "device.crt";

/// Durable file storage for device key material.
#[derive(Clone, Debug)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Opens (and creates if needed) the key directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(KeyStore { dir })
    }

    /// The key directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads a file, `None` if it does not exist.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a file so that it is either fully present or absent.
    ///
    /// The bytes go to a temporary file that is synced and renamed into
    /// place. Secret files are only readable by the owner.
    pub fn write(&self, name: &str, bytes: &[u8], secret: bool) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if secret {
                options.mode(0o600);
            }
        }
        #[cfg(not(unix))]
        let _ = secret;

        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        #[cfg(unix)]
        {
            File::open(&self.dir)?.sync_all()?;
        }

        Ok(())
    }
}

/// The device's long-lived identity.
pub struct DeviceIdentity {
    device_id: String,
    keypair: Keypair,
    pqc: PqcKeyPair,
}

impl DeviceIdentity {
    /// Loads the identity from `keys`, generating and persisting whatever
    /// part is missing. The flag is true when anything was generated.
    pub fn load_or_create(keys: &KeyStore, device_id: &str) -> Result<(Self, bool)> {
        let mut created = false;

        let keypair = match keys.read(SIGNING_KEY_FILE)? {
            Some(mut bytes) => {
                let secret = SecretKey::from_bytes(&bytes).map_err(Error::InvalidKey);
                bytes.zeroize();
                keypair_from_secret(secret?)
            }
            None => {
                let mut bytes = [0u8; SECRET_KEY_LENGTH];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
                let written = keys.write(SIGNING_KEY_FILE, &bytes, true);
                let secret = SecretKey::from_bytes(&bytes).map_err(Error::InvalidKey);
                bytes.zeroize();
                written?;
                created = true;
                keypair_from_secret(secret?)
            }
        };

        let pqc = match (keys.read(PQC_SECRET_FILE)?, keys.read(PQC_PUBLIC_FILE)?) {
            (Some(mut secret), Some(public)) => {
                let pqc = PqcKeyPair::from_bytes(&secret, &public);
                secret.zeroize();
                pqc?
            }
            _ => {
                let pqc = PqcKeyPair::generate();
                keys.write(PQC_SECRET_FILE, pqc.secret_key(), true)?;
                keys.write(PQC_PUBLIC_FILE, pqc.public_key(), false)?;
                created = true;
                pqc
            }
        };

        if created {
            info!(device_id, dir = %keys.dir().display(), "device identity created");
        } else {
            debug!(device_id, "device identity loaded");
        }

        Ok((
            DeviceIdentity {
                device_id: device_id.to_owned(),
                keypair,
                pqc,
            },
            created,
        ))
    }

    /// Device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw Ed25519 public key.
    pub fn public_key(&self) -> &[u8] {
        self.keypair.public.as_bytes()
    }

    /// Encoded ML-KEM encapsulation key.
    pub fn pqc_public_key(&self) -> &[u8] {
        self.pqc.public_key()
    }

    /// PEM hybrid CSR for this identity.
    pub fn csr_pem(&self) -> Result<String> {
        let der = codec::build_csr(&self.device_id, &self.keypair, Some(self.pqc.public_key()))?;
        x509::to_pem(CSR_PEM_LABEL, &der)
    }

    /// Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).to_bytes().to_vec()
    }

    /// Serial of the PEM certificate, if it certifies this identity's key.
    pub fn certified_serial(&self, certificate_pem: &[u8]) -> Result<Option<String>> {
        let der = x509::from_pem(CERTIFICATE_PEM_LABEL, certificate_pem)?;
        let certificate = Certificate::parse(&der)?;

        if certificate.subject_public_key() == self.public_key() {
            Ok(Some(certificate.serial_hex()))
        } else {
            Ok(None)
        }
    }
}

impl core::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

fn keypair_from_secret(secret: SecretKey) -> Keypair {
    Keypair {
        public: (&secret).into(),
        secret,
    }
}

/// Outcome of one agent run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationReport {
    /// Attested device.
    pub device_id: String,
    /// Serial of the certificate used.
    pub certificate_serial: String,
    /// Compliance state reported by the endpoint.
    pub compliance_state: ComplianceState,
    /// Attestation time, Unix milliseconds.
    pub last_attested: Option<u64>,
    /// Whether new key material was generated on this run.
    pub identity_created: bool,
    /// Whether a CSR was submitted on this run.
    pub enrolled: bool,
}

/// Reference device client.
pub struct Agent<G, S> {
    device_id: String,
    keys: KeyStore,
    gateway: Arc<G>,
    store: Arc<S>,
    certificate_poll: Backoff,
}

impl<G, S> Agent<G, S>
where
    G: Gateway,
    S: ObjectStore,
{
    /// Agent constructor.
    ///
    /// # Parameters
    ///
    /// @device_id: Identity to enroll and attest as.
    /// @keys: Local storage for the identity and its certificate.
    /// @gateway: Enrollment and attestation endpoints.
    /// @store: Object store the issued certificate appears in.
    /// @certificate_poll: Poll policy while waiting for the certificate.
    pub fn new(
        device_id: &str,
        keys: KeyStore,
        gateway: Arc<G>,
        store: Arc<S>,
        certificate_poll: Backoff,
    ) -> Self {
        Agent {
            device_id: device_id.to_owned(),
            keys,
            gateway,
            store,
            certificate_poll,
        }
    }

    /// Enrolls if needed, then attests.
    pub fn run(&self) -> Result<AttestationReport> {
        let device_id = self.device_id.as_str();
        let (identity, identity_created) = DeviceIdentity::load_or_create(&self.keys, device_id)?;

        let stored_serial = match self.keys.read(CERTIFICATE_FILE)? {
            Some(pem) => identity.certified_serial(&pem)?,
            None => None,
        };

        let (mut certificate_serial, mut enrolled) = match stored_serial {
            Some(serial) => {
                debug!(device_id, serial = %serial, "reusing stored certificate");
                (serial, false)
            }
            None => (self.enroll(&identity)?, true),
        };

        let challenge = match self.gateway.request_challenge(device_id) {
            Err(Error::UnknownDevice(_)) if !enrolled => {
                warn!(device_id, "service has no record of this device, enrolling again");
                certificate_serial = self.enroll(&identity)?;
                enrolled = true;
                self.gateway.request_challenge(device_id)?
            }
            other => other?,
        };
        let response = self
            .gateway
            .attest(device_id, &challenge, &identity.sign(challenge.as_bytes()))?;
        info!(device_id, compliance_state = %response.compliance_state, "attestation accepted");

        Ok(AttestationReport {
            device_id: device_id.to_owned(),
            certificate_serial,
            compliance_state: response.compliance_state,
            last_attested: response.last_attested,
            identity_created,
            enrolled,
        })
    }

    // Registers, submits the CSR, and waits for the certificate. Returns the
    // certificate serial.
    fn enroll(&self, identity: &DeviceIdentity) -> Result<String> {
        let device_id = identity.device_id();
        let csr_pem = identity.csr_pem()?;

        match self.gateway.register(device_id) {
            Ok(_) => info!(device_id, "registered"),
            Err(Error::AlreadyRegistered(_)) => debug!(device_id, "already registered"),
            Err(e) => return Err(e),
        }

        self.gateway.submit_csr(device_id, &csr_pem)?;
        info!(device_id, "CSR submitted, waiting for certificate");

        let key = store::certificate_key(device_id);
        let certificate_pem = self.certificate_poll.poll(
            "certificate availability",
            || self.store.get(&key),
            |attempts| Error::EnrollmentTimeout {
                device_id: device_id.to_owned(),
                attempts,
            },
        )?;

        let serial = identity.certified_serial(&certificate_pem)?.ok_or_else(|| {
            Error::Rejected(format!("certificate at {key} does not certify this device key"))
        })?;
        self.keys.write(CERTIFICATE_FILE, &certificate_pem, false)?;
        info!(device_id, serial = %serial, "certificate stored");

        Ok(serial)
    }
}
