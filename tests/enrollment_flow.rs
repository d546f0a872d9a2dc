// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ed25519_dalek::{Keypair, SecretKey, Signer};
use pqattest::agent::{Agent, KeyStore};
use pqattest::api::Service;
use pqattest::authority::LocalAuthority;
use pqattest::clock::{Clock, ManualClock};
use pqattest::codec;
use pqattest::config::Config;
use pqattest::enrollment::IssuanceMetadata;
use pqattest::pqc::PqcKeyPair;
use pqattest::registry::{AttestationStatus, ComplianceState, MemoryRegistry, Registry};
use pqattest::retry::Backoff;
use pqattest::store::{MemoryStore, ObjectStore};
use pqattest::x509::{self, CSR_PEM_LABEL};
use serde_json::json;

const NOW: u64 = 1_704_067_200_000;

struct World {
    clock: Arc<ManualClock>,
    registry: Arc<MemoryRegistry>,
    store: Arc<MemoryStore>,
    service: Arc<Service<MemoryRegistry, MemoryStore, LocalAuthority>>,
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(NOW));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let registry = Arc::new(MemoryRegistry::new());
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(
        LocalAuthority::new(&[42u8; 32], "Integration CA", 365, dyn_clock.clone())
            .unwrap()
            .with_pending_polls(2),
    );

    let mut config = Config::default();
    config.enrollment.issuance_poll.initial_delay_ms = 0;
    config.enrollment.issuance_poll.max_delay_ms = 0;

    let service = Arc::new(Service::new(
        registry.clone(),
        store.clone(),
        authority,
        dyn_clock,
        &config,
    ));

    World {
        clock,
        registry,
        store,
        service,
    }
}

fn device_keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).unwrap();
    Keypair {
        public: (&secret).into(),
        secret,
    }
}

fn enroll(world: &World, device_id: &str, keypair: &Keypair, pqc: Option<&[u8]>) -> ComplianceState {
    let registered = world
        .service
        .handle("/register", json!({ "device_id": device_id }).to_string().as_bytes());
    assert_eq!(registered.status, 200);

    let der = codec::build_csr(device_id, keypair, pqc).unwrap();
    let pem = x509::to_pem(CSR_PEM_LABEL, &der).unwrap();
    let accepted = world.service.handle(
        "/csr",
        json!({ "device_id": device_id, "csr": pem }).to_string().as_bytes(),
    );
    assert_eq!(accepted.status, 202);

    let key = accepted.body["csr_key"].as_str().unwrap().to_owned();
    world
        .service
        .handle_object_created(&key)
        .unwrap()
        .compliance_state
}

fn challenge(world: &World, device_id: &str) -> String {
    let response = world.service.handle(
        "/attest",
        json!({ "device_id": device_id, "request": "challenge" })
            .to_string()
            .as_bytes(),
    );
    assert_eq!(response.status, 200);
    response.body["challenge"].as_str().unwrap().to_owned()
}

fn answer(world: &World, device_id: &str, challenge: &str, keypair: &Keypair) -> pqattest::api::Response {
    let signature = hex::encode(keypair.sign(challenge.as_bytes()).to_bytes());
    world.service.handle(
        "/attest",
        json!({ "device_id": device_id, "challenge": challenge, "signature": signature })
            .to_string()
            .as_bytes(),
    )
}

#[test]
fn hybrid_device_enrolls_and_attests() {
    let world = world();
    let keypair = device_keypair(1);
    let pqc = PqcKeyPair::generate();
    assert_eq!(pqc.public_key().len(), 800);

    let state = enroll(&world, "dev-1", &keypair, Some(pqc.public_key()));
    assert_eq!(state, ComplianceState::PqcOk);

    let metadata: IssuanceMetadata =
        serde_json::from_slice(&world.store.get("csr/dev-1.json").unwrap().unwrap()).unwrap();
    assert!(metadata.has_pqc);
    assert_eq!(metadata.pqc_public_key_length, 800);
    assert!(world.store.get("csr/dev-1.crt").unwrap().is_some());

    let first = challenge(&world, "dev-1");
    let second = challenge(&world, "dev-1");
    assert_ne!(first, second);

    world.clock.advance(5_000);
    let response = answer(&world, "dev-1", &first, &keypair);
    assert_eq!(response.status, 200);
    assert_eq!(response.body["device"], "dev-1");
    assert_eq!(response.body["compliance_state"], "pqc_ok");

    let record = world.registry.get("dev-1").unwrap().unwrap();
    assert_eq!(record.attestation_status, AttestationStatus::Verified);
    assert_eq!(record.last_attested, Some(NOW + 5_000));

    // Replay of the consumed challenge.
    assert_eq!(answer(&world, "dev-1", &first, &keypair).status, 400);
    // The other one is still good.
    assert_eq!(answer(&world, "dev-1", &second, &keypair).status, 200);
}

#[test]
fn classical_device_fails_the_compliance_gate() {
    let world = world();
    let keypair = device_keypair(2);

    assert_eq!(enroll(&world, "dev-2", &keypair, None), ComplianceState::Legacy);
    let before = world.registry.get("dev-2").unwrap().unwrap();

    let challenge = challenge(&world, "dev-2");
    let response = answer(&world, "dev-2", &challenge, &keypair);
    assert_eq!(response.status, 400);
    assert_eq!(response.body["error"], "Device is NOT PQC compliant");
    assert_eq!(response.body["compliance_state"], "legacy");

    assert_eq!(world.registry.get("dev-2").unwrap().unwrap(), before);
}

#[test]
fn impostor_signature_is_refused() {
    let world = world();
    let keypair = device_keypair(3);
    enroll(&world, "dev-3", &keypair, Some(&[9u8; 800][..]));
    let before = world.registry.get("dev-3").unwrap().unwrap();

    let challenge = challenge(&world, "dev-3");
    let response = answer(&world, "dev-3", &challenge, &device_keypair(4));
    assert_eq!(response.status, 400);
    assert_eq!(response.body["error"], "Signature verification failed");
    assert_eq!(world.registry.get("dev-3").unwrap().unwrap(), before);
}

#[test]
fn agent_enrolls_once_and_attests_every_run() {
    let world = world();
    let dir = tempfile::tempdir().unwrap();
    let keys = KeyStore::open(dir.path()).unwrap();

    let agent = Agent::new(
        "dev-1",
        keys,
        world.service.clone(),
        world.store.clone(),
        Backoff::immediate(5),
    );

    let first = agent.run().unwrap();
    assert!(first.enrolled);
    assert_eq!(first.compliance_state, ComplianceState::PqcOk);

    world.clock.advance(60_000);
    let second = agent.run().unwrap();
    assert!(!second.enrolled);
    assert_eq!(second.certificate_serial, first.certificate_serial);
    assert_eq!(second.last_attested, Some(NOW + 60_000));

    let record = world.registry.get("dev-1").unwrap().unwrap();
    assert!(record.has_pqc);
    assert_eq!(record.last_attested, Some(NOW + 60_000));
}
