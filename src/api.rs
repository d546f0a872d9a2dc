// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Transport-agnostic endpoint handlers.
//!
//! Handlers take a JSON body and always produce a [`Response`]; errors are
//! mapped to a status code and an `{"error": ...}` body. The [`Gateway`]
//! trait is the device-side view of the same endpoints, and [`Service`]
//! implements it in-process by round-tripping JSON through its handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::attestation::Attestation;
use crate::authority::CertificateAuthority;
use crate::clock::Clock;
use crate::config::Config;
use crate::enrollment::{Enrollment, IssuanceReport};
use crate::registry::{ComplianceState, Registry};
use crate::retry::Backoff;
use crate::store::ObjectStore;
use crate::{Error, ErrorKind, Result};

/// Status and JSON body of a handled request.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// HTTP-style status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl Response {
    fn new(status: u16, body: Value) -> Self {
        Response { status, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Response::new(status, json!({ "error": message }))
    }

    fn invalid_body() -> Self {
        Response::error(400, "invalid request body")
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Maps a workflow error to its response.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::InvalidRequest(_) => Response::invalid_body(),
            Error::InvalidDeviceId(_) => Response::error(400, "device_id missing"),
            Error::AlreadyRegistered(_) => Response::error(409, "already registered"),
            Error::UnknownDevice(_) => Response::error(404, "Device not registered"),
            Error::IssuanceConflict(_) => Response::error(409, &error.to_string()),
            Error::SignatureInvalid(_) => Response::error(400, "Signature verification failed"),
            Error::NonCompliantDevice {
                compliance_state, ..
            } => Response::new(
                400,
                json!({
                    "error": "Device is NOT PQC compliant",
                    "compliance_state": compliance_state,
                }),
            ),
            Error::IssuanceTimeout { .. } | Error::EnrollmentTimeout { .. } => {
                Response::error(504, &error.to_string())
            }
            _ => match error.kind() {
                ErrorKind::ClientInput
                | ErrorKind::Identity
                | ErrorKind::Crypto
                | ErrorKind::Compliance => Response::error(400, &error.to_string()),
                ErrorKind::Upstream => Response::error(503, &error.to_string()),
                ErrorKind::Internal => Response::error(500, "internal error"),
            },
        }
    }

    /// Rebuilds the domain result a response stands for.
    pub fn into_result<T: DeserializeOwned>(self, device_id: &str) -> Result<T> {
        if self.is_success() {
            return Ok(serde_json::from_value(self.body)?);
        }

        let message = self.body["error"].as_str().unwrap_or_default().to_owned();
        if let Some(state) = self.body.get("compliance_state") {
            return Err(Error::NonCompliantDevice {
                device_id: device_id.to_owned(),
                compliance_state: serde_json::from_value(state.clone())?,
            });
        }

        Err(match self.status {
            409 if message == "already registered" => Error::AlreadyRegistered(device_id.to_owned()),
            404 => Error::UnknownDevice(device_id.to_owned()),
            400 if message == "Signature verification failed" => Error::SignatureInvalid(message),
            status => Error::Api { status, message },
        })
    }
}

/// `register` request body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Device to register.
    pub device_id: Option<String>,
}

/// `register` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Registered device.
    pub device_id: String,
}

/// `csr` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CsrRequest {
    /// Requesting device.
    pub device_id: String,
    /// PEM encoded CSR.
    pub csr: String,
}

/// `csr` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrResponse {
    /// Requesting device.
    pub device_id: String,
    /// Object key the CSR was stored under.
    pub csr_key: String,
}

/// `attest` request body, either a challenge request or a signed challenge.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttestRequest {
    /// Attesting device.
    pub device_id: Option<String>,
    /// `"challenge"` to ask for a new challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Challenge being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    /// Hex Ed25519 signature over the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Challenge issued to a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// The challenge to sign.
    pub challenge: String,
}

/// Successful attestation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestResponse {
    /// Human readable outcome.
    pub message: String,
    /// Attested device.
    pub device: String,
    /// Its compliance state.
    pub compliance_state: ComplianceState,
    /// Attestation time, Unix milliseconds.
    #[serde(default)]
    pub last_attested: Option<u64>,
}

/// Device-side view of the endpoints.
pub trait Gateway {
    /// Registers the device.
    fn register(&self, device_id: &str) -> Result<RegisterResponse>;

    /// Uploads a PEM CSR.
    fn submit_csr(&self, device_id: &str, csr_pem: &str) -> Result<CsrResponse>;

    /// Asks for a fresh challenge.
    fn request_challenge(&self, device_id: &str) -> Result<String>;

    /// Answers a challenge.
    fn attest(&self, device_id: &str, challenge: &str, signature: &[u8]) -> Result<AttestResponse>;
}

/// Enrollment and attestation behind one set of handlers.
pub struct Service<R, S, C> {
    enrollment: Enrollment<R, S, C>,
    attestation: Attestation<R, C>,
}

impl<R, S, C> Service<R, S, C>
where
    R: Registry,
    S: ObjectStore,
    C: CertificateAuthority,
{
    /// Wires both workflows to the same collaborators.
    pub fn new(
        registry: Arc<R>,
        store: Arc<S>,
        authority: Arc<C>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Service {
            enrollment: Enrollment::new(
                registry.clone(),
                store,
                authority.clone(),
                clock.clone(),
                Backoff::from(&config.enrollment.issuance_poll),
            ),
            attestation: Attestation::new(
                registry,
                authority,
                clock,
                (&config.attestation).into(),
            ),
        }
    }

    /// The enrollment workflow.
    pub fn enrollment(&self) -> &Enrollment<R, S, C> {
        &self.enrollment
    }

    /// The attestation workflow.
    pub fn attestation(&self) -> &Attestation<R, C> {
        &self.attestation
    }

    /// Dispatches on the endpoint path.
    pub fn handle(&self, path: &str, body: &[u8]) -> Response {
        match path.trim_end_matches('/') {
            "/register" => self.handle_register(body),
            "/csr" => self.handle_csr(body),
            "/attest" => self.handle_attest(body),
            _ => Response::error(404, "not found"),
        }
    }

    /// `POST /register`
    pub fn handle_register(&self, body: &[u8]) -> Response {
        let Ok(request) = serde_json::from_slice::<RegisterRequest>(body) else {
            return Response::invalid_body();
        };
        let Some(device_id) = request.device_id else {
            return Response::error(400, "device_id missing");
        };

        match self.enrollment.register(&device_id) {
            Ok(ack) => Response::new(200, json!({ "device_id": ack.device_id })),
            Err(e) => respond_with(&device_id, "register", &e),
        }
    }

    /// `POST /csr`
    pub fn handle_csr(&self, body: &[u8]) -> Response {
        let Ok(request) = serde_json::from_slice::<CsrRequest>(body) else {
            return Response::invalid_body();
        };

        match self
            .enrollment
            .submit_csr(&request.device_id, request.csr.as_bytes())
        {
            Ok(csr_key) => Response::new(
                202,
                json!({ "device_id": request.device_id, "csr_key": csr_key }),
            ),
            Err(e) => respond_with(&request.device_id, "csr", &e),
        }
    }

    /// `POST /attest`
    pub fn handle_attest(&self, body: &[u8]) -> Response {
        let Ok(request) = serde_json::from_slice::<AttestRequest>(body) else {
            return Response::invalid_body();
        };
        let Some(device_id) = request.device_id else {
            return Response::error(400, "device_id missing");
        };

        if request.request.as_deref() == Some("challenge") {
            return match self.attestation.request_challenge(&device_id) {
                Ok(challenge) => Response::new(200, json!({ "challenge": challenge })),
                Err(e) => respond_with(&device_id, "challenge", &e),
            };
        }

        let (Some(challenge), Some(signature)) = (request.challenge, request.signature) else {
            return Response::invalid_body();
        };
        let Ok(signature) = hex::decode(signature) else {
            return Response::invalid_body();
        };

        match self.attestation.verify(&device_id, &challenge, &signature) {
            Ok(result) => Response::new(
                200,
                json!({
                    "message": "Attestation successful",
                    "device": result.device_id,
                    "compliance_state": result.compliance_state,
                    "last_attested": result.last_attested,
                }),
            ),
            Err(e) => respond_with(&device_id, "attest", &e),
        }
    }

    /// Storage event: an object was written under `key`.
    pub fn handle_object_created(&self, key: &str) -> Result<IssuanceReport> {
        self.enrollment.process_upload(key)
    }

    fn call<T: Serialize>(&self, path: &str, request: &T) -> Result<Response> {
        Ok(self.handle(path, &serde_json::to_vec(request)?))
    }
}

fn respond_with(device_id: &str, endpoint: &str, error: &Error) -> Response {
    let response = Response::from_error(error);
    if response.status >= 500 {
        warn!(device_id, endpoint, status = response.status, error = %error, "request failed");
    } else {
        debug!(device_id, endpoint, status = response.status, error = %error, "request refused");
    }
    response
}

impl<R, S, C> Gateway for Service<R, S, C>
where
    R: Registry,
    S: ObjectStore,
    C: CertificateAuthority,
{
    fn register(&self, device_id: &str) -> Result<RegisterResponse> {
        self.call(
            "/register",
            &RegisterRequest {
                device_id: Some(device_id.to_owned()),
            },
        )?
        .into_result(device_id)
    }

    fn submit_csr(&self, device_id: &str, csr_pem: &str) -> Result<CsrResponse> {
        let accepted: CsrResponse = self
            .call(
                "/csr",
                &CsrRequest {
                    device_id: device_id.to_owned(),
                    csr: csr_pem.to_owned(),
                },
            )?
            .into_result(device_id)?;

        // The upload is the storage event. Pipeline failures are not the
        // uploader's to see; the device notices when no certificate shows up.
        if let Err(e) = self.handle_object_created(&accepted.csr_key) {
            warn!(device_id, key = %accepted.csr_key, error = %e, "issuance pipeline failed");
        }

        Ok(accepted)
    }

    fn request_challenge(&self, device_id: &str) -> Result<String> {
        let response: ChallengeResponse = self
            .call(
                "/attest",
                &AttestRequest {
                    device_id: Some(device_id.to_owned()),
                    request: Some("challenge".into()),
                    ..Default::default()
                },
            )?
            .into_result(device_id)?;

        Ok(response.challenge)
    }

    fn attest(&self, device_id: &str, challenge: &str, signature: &[u8]) -> Result<AttestResponse> {
        self.call(
            "/attest",
            &AttestRequest {
                device_id: Some(device_id.to_owned()),
                challenge: Some(challenge.to_owned()),
                signature: Some(hex::encode(signature)),
                ..Default::default()
            },
        )?
        .into_result(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;
    use crate::clock::ManualClock;
    use crate::codec;
    use crate::kdf::key_pair_from_seed;
    use crate::registry::MemoryRegistry;
    use crate::store::MemoryStore;
    use crate::x509::{self, CSR_PEM_LABEL};
    use ed25519_dalek::{Keypair, Signer};

    type TestService = Service<MemoryRegistry, MemoryStore, LocalAuthority>;

    fn service() -> (TestService, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_704_067_200_000));
        let store = Arc::new(MemoryStore::new());
        let authority =
            Arc::new(LocalAuthority::new(&[1u8; 32], "Test CA", 30, clock.clone()).unwrap());
        let service = Service::new(
            Arc::new(MemoryRegistry::new()),
            store.clone(),
            authority,
            clock,
            &Config::default(),
        );
        (service, store)
    }

    fn csr_pem(keypair: &Keypair, device_id: &str, pqc: bool) -> String {
        let key = [6u8; 800];
        let der = codec::build_csr(device_id, keypair, pqc.then_some(&key[..])).unwrap();
        x509::to_pem(CSR_PEM_LABEL, &der).unwrap()
    }

    fn post(service: &TestService, path: &str, body: Value) -> Response {
        service.handle(path, body.to_string().as_bytes())
    }

    #[test]
    fn register_statuses() {
        let (service, _) = service();

        let ok = post(&service, "/register", json!({ "device_id": "dev-1" }));
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["device_id"], "dev-1");

        let again = post(&service, "/register", json!({ "device_id": "dev-1" }));
        assert_eq!(again.status, 409);
        assert_eq!(again.body["error"], "already registered");

        let missing = post(&service, "/register", json!({}));
        assert_eq!(missing, Response::error(400, "device_id missing"));

        let malformed = post(&service, "/register", json!({ "device_id": "a/b" }));
        assert_eq!(malformed.status, 400);

        assert_eq!(service.handle("/register", b"{"), Response::invalid_body());
        assert_eq!(service.handle("/nope", b"{}").status, 404);
    }

    #[test]
    fn csr_statuses() {
        let (service, store) = service();
        let keypair = key_pair_from_seed(&[2u8; 32], b"device").unwrap();
        let pem = csr_pem(&keypair, "dev-1", true);

        let unknown = post(&service, "/csr", json!({ "device_id": "dev-1", "csr": pem }));
        assert_eq!(unknown.status, 404);

        post(&service, "/register", json!({ "device_id": "dev-1" }));
        let bad = post(&service, "/csr", json!({ "device_id": "dev-1", "csr": "garbage" }));
        assert_eq!(bad.status, 400);

        let accepted = post(&service, "/csr", json!({ "device_id": "dev-1", "csr": pem }));
        assert_eq!(accepted.status, 202);
        assert_eq!(accepted.body["csr_key"], "csr/dev-1.csr");
        assert!(store.get("csr/dev-1.csr").unwrap().is_some());
    }

    #[test]
    fn attest_statuses() {
        let (service, _) = service();
        let keypair = key_pair_from_seed(&[2u8; 32], b"device").unwrap();

        let unknown = post(
            &service,
            "/attest",
            json!({ "device_id": "dev-1", "request": "challenge" }),
        );
        assert_eq!(unknown, Response::error(404, "Device not registered"));

        service.register("dev-1").unwrap();
        service
            .submit_csr("dev-1", &csr_pem(&keypair, "dev-1", false))
            .unwrap();

        let challenge = service.request_challenge("dev-1").unwrap();
        let refused = post(
            &service,
            "/attest",
            json!({
                "device_id": "dev-1",
                "challenge": challenge,
                "signature": hex::encode(keypair.sign(challenge.as_bytes()).to_bytes()),
            }),
        );
        assert_eq!(refused.status, 400);
        assert_eq!(refused.body["error"], "Device is NOT PQC compliant");
        assert_eq!(refused.body["compliance_state"], "legacy");

        let incomplete = post(&service, "/attest", json!({ "device_id": "dev-1" }));
        assert_eq!(incomplete, Response::invalid_body());
    }

    #[test]
    fn gateway_rebuilds_domain_errors() {
        let (service, _) = service();
        let keypair = key_pair_from_seed(&[2u8; 32], b"device").unwrap();

        assert!(matches!(
            service.request_challenge("dev-1"),
            Err(Error::UnknownDevice(_))
        ));
        service.register("dev-1").unwrap();
        assert!(matches!(
            service.register("dev-1"),
            Err(Error::AlreadyRegistered(_))
        ));

        service
            .submit_csr("dev-1", &csr_pem(&keypair, "dev-1", false))
            .unwrap();
        let challenge = service.request_challenge("dev-1").unwrap();
        let signature = keypair.sign(challenge.as_bytes()).to_bytes();
        assert!(matches!(
            service.attest("dev-1", &challenge, &signature),
            Err(Error::NonCompliantDevice {
                compliance_state: ComplianceState::Legacy,
                ..
            })
        ));

        let challenge = service.request_challenge("dev-1").unwrap();
        assert!(matches!(
            service.attest("dev-1", &challenge, &[0u8; 64]),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn gateway_attests_compliant_device() {
        let (service, _) = service();
        let keypair = key_pair_from_seed(&[2u8; 32], b"device").unwrap();

        service.register("dev-1").unwrap();
        service
            .submit_csr("dev-1", &csr_pem(&keypair, "dev-1", true))
            .unwrap();

        let challenge = service.request_challenge("dev-1").unwrap();
        let signature = keypair.sign(challenge.as_bytes()).to_bytes();
        let response = service.attest("dev-1", &challenge, &signature).unwrap();

        assert_eq!(response.device, "dev-1");
        assert_eq!(response.compliance_state, ComplianceState::PqcOk);
        assert_eq!(response.message, "Attestation successful");
    }

    #[test]
    fn error_statuses() {
        let timeout = Error::IssuanceTimeout {
            device_id: "dev-1".into(),
            attempts: 3,
        };
        assert_eq!(Response::from_error(&timeout).status, 504);
        assert_eq!(Response::from_error(&Error::Pending).status, 503);
        assert_eq!(Response::from_error(&Error::ChallengeExpired).status, 400);
        assert_eq!(
            Response::from_error(&Error::CertificateMissing("dev-1".into())).status,
            400
        );
    }
}
