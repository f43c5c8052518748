//! Bootstrap stories
//!
//! A fresh agent only holds the root authority and its installation
//! certificate. It learns the issuing authority from the server's TLS chain,
//! exchanges a CSR for a long-term certificate, and from then on connects
//! with that certificate.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use keystone_agent::{
    assemble, AgentInfo, FixedBinaryHash, HandshakeDriver, HandshakeState, HandshakeTimeouts,
    HardeningError,
};
use keystone_common::protocol::{ChallengeRequest, ConnectionStart, HandshakeMessage};
use keystone_common::transport::pipe;
use keystone_infra::challenge::Challenger;
use keystone_infra::{CertificateAuthority, ServerMtlsConfig};
use tokio_util::sync::CancellationToken;

use super::helpers::*;

#[tokio::test]
async fn agent_bootstraps_over_tls_then_connects_with_long_term_identity() {
    let authority = Authority::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let trust = Arc::new(authority.trust());
    let hardening = assemble(
        agent_id(),
        Arc::clone(&trust),
        dir.path(),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
    )
    .await
    .expect("assemble");
    assert_eq!(hardening.machine.state(), HandshakeState::Uninitialized);

    // Chapter 1: the bootstrap TLS handshake captures the issuing authority.
    let phase = hardening
        .tls
        .config_for_bootstrap()
        .expect("bootstrap config");
    tls_handshake(phase.client, phase.server_name, authority.server_config())
        .expect("bootstrap TLS handshake should succeed");

    // Chapter 2: the CSR is exchanged for a long-term certificate.
    let machine = Arc::new(hardening.machine);
    let driver = HandshakeDriver::new(
        Arc::clone(&machine),
        HandshakeTimeouts::default(),
        CancellationToken::new(),
    );
    let (agent_end, server_end) = pipe(8);
    let (mut agent_rx, mut agent_tx) = agent_end.split();
    let (mut server_rx, mut server_tx) = server_end.split();
    let token = authority.token(b"deployment-1", now() + 3600);

    let server = async {
        let request = recv(&mut server_rx).await;
        let HandshakeMessage::BootstrapRequest(inner) = &request else {
            panic!("expected bootstrap_request");
        };
        assert_eq!(inner.abh, ABH.to_vec());
        assert_eq!(inner.agent_id, agent_id());
        let response = authority
            .issue(&request, token.clone())
            .expect("issuance should succeed");
        send(&mut server_tx, &response).await;
    };
    let info = AgentInfo::current();
    let (result, ()) = tokio::join!(
        driver.bootstrap(&mut agent_rx, &mut agent_tx, &info),
        server
    );
    result.expect("bootstrap should succeed");
    assert_eq!(machine.state(), HandshakeState::Provisioned);

    let bundle = hardening.store.get().await.expect("identity stored");
    assert_eq!(
        bundle.sca_der,
        authority.issuing.ca_cert_der().expect("issuing der")
    );

    // Chapter 3: steady-state TLS authenticates with LTAC + issuing authority.
    let phase = hardening
        .tls
        .config_for_connection()
        .await
        .expect("connection config");
    tls_handshake(phase.client, phase.server_name, authority.server_config())
        .expect("connection TLS handshake should succeed");

    // Chapter 4: challenge-response and connection start.
    let challenger = Challenger::new([ABH.to_vec()]);
    let negotiator = RecordingNegotiator::default();
    let server = async {
        let challenge = challenger.issue(&agent_id()).expect("challenge");
        send(
            &mut server_tx,
            &HandshakeMessage::ChallengeRequest(ChallengeRequest {
                nonce: challenge.nonce().to_vec(),
            }),
        )
        .await;

        let HandshakeMessage::ChallengeResponse(response) = recv(&mut server_rx).await else {
            panic!("expected challenge_response");
        };
        challenger
            .verify(&challenge, &response.ciphertext)
            .expect("challenge response should verify");

        send(
            &mut server_tx,
            &HandshakeMessage::ConnectionStart(ConnectionStart {
                revocation_token: token.clone(),
                tunnel: tunnel(),
            }),
        )
        .await;
        assert!(matches!(
            recv(&mut server_rx).await,
            HandshakeMessage::ConnectionStartAck(_)
        ));
    };
    let (result, ()) = tokio::join!(
        driver.connect(&mut agent_rx, &mut agent_tx, &negotiator),
        server
    );
    result.expect("connection should succeed");

    assert_eq!(machine.state(), HandshakeState::Authenticated);
    assert_eq!(
        *negotiator.seen.lock().expect("lock"),
        vec![tunnel()]
    );
}

#[tokio::test]
async fn second_capture_before_consumption_fails_the_handshake() {
    let authority = Authority::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let hardening = assemble(
        agent_id(),
        Arc::new(authority.trust()),
        dir.path(),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
    )
    .await
    .expect("assemble");
    let server = authority.server_config();

    let phase = hardening.tls.config_for_bootstrap().expect("config");
    tls_handshake(Arc::clone(&phase.client), server_name(), Arc::clone(&server))
        .expect("first capture succeeds");
    tls_handshake(phase.client, server_name(), server)
        .expect_err("second capture must fail while the first is pending");

    // The first capture is still there for the bootstrap that owns it.
    let request = hardening
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("request");
    let response = authority
        .issue(&request, authority.token(b"deployment-1", now() + 3600))
        .expect("issuance");
    hardening
        .machine
        .process_bootstrap_response(response)
        .await
        .expect("bootstrap should use the first capture");
}

#[tokio::test]
async fn retry_after_server_rejects_installation_certificate_succeeds() {
    let authority = Authority::new();
    let foreign = CertificateAuthority::new("Foreign Root").expect("foreign root");
    let dir = tempfile::tempdir().expect("temp dir");
    let hardening = assemble(
        agent_id(),
        Arc::new(authority.trust()),
        dir.path(),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
    )
    .await
    .expect("assemble");

    // The server chain is valid, but client certificates must chain to
    // another root, so the handshake fails after the capture was taken.
    let (leaf_pem, key_pem) = authority
        .issuing
        .generate_server_cert(&[keystone_common::DEFAULT_SERVER_NAME])
        .expect("server cert");
    let rejecting = Arc::new(
        ServerMtlsConfig::new(
            format!("{}{}", leaf_pem, authority.issuing.ca_cert_pem()),
            key_pem,
            foreign.ca_cert_pem().to_string(),
        )
        .to_server_config()
        .expect("server config"),
    );
    let phase = hardening.tls.config_for_bootstrap().expect("config");
    tls_handshake(phase.client, phase.server_name, rejecting)
        .expect_err("installation certificate must be rejected");

    let phase = hardening.tls.config_for_bootstrap().expect("retry config");
    tls_handshake(phase.client, phase.server_name, authority.server_config())
        .expect("retry handshake should capture again");

    let request = hardening
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("request");
    let response = authority
        .issue(&request, authority.token(b"deployment-1", now() + 3600))
        .expect("issuance");
    hardening
        .machine
        .process_bootstrap_response(response)
        .await
        .expect("bootstrap should succeed after the retry");
    assert!(hardening.store.is_provisioned().await);
}

#[tokio::test]
async fn reconnect_with_reused_bootstrap_config_captures_again() {
    let authority = Authority::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let hardening = assemble(
        agent_id(),
        Arc::new(authority.trust()),
        dir.path(),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
    )
    .await
    .expect("assemble");
    let server = authority.server_config();
    let phase = hardening.tls.config_for_bootstrap().expect("config");

    tls_handshake(Arc::clone(&phase.client), server_name(), Arc::clone(&server))
        .expect("first handshake");
    hardening.machine.reset_bootstrap().await;

    // Same client config against the same server: no session is resumed,
    // so the verifier runs and the issuing authority is captured again.
    tls_handshake(phase.client, server_name(), server).expect("reconnect handshake");

    let request = hardening
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("request");
    let response = authority
        .issue(&request, authority.token(b"deployment-1", now() + 3600))
        .expect("issuance");
    hardening
        .machine
        .process_bootstrap_response(response)
        .await
        .expect("bootstrap should use the reconnect capture");
    assert_eq!(hardening.machine.state(), HandshakeState::Provisioned);
}

#[tokio::test]
async fn server_chain_signed_by_root_directly_is_rejected() {
    let authority = Authority::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let hardening = assemble(
        agent_id(),
        Arc::new(authority.trust()),
        dir.path(),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
    )
    .await
    .expect("assemble");

    // Leaf issued by the root: only one raw certificate, no issuing authority.
    let (leaf_pem, key_pem) = authority
        .root
        .generate_server_cert(&[keystone_common::DEFAULT_SERVER_NAME])
        .expect("server cert");
    let server = Arc::new(
        keystone_infra::ServerMtlsConfig::new(
            leaf_pem,
            key_pem,
            authority.root.ca_cert_pem().to_string(),
        )
        .to_server_config()
        .expect("server config"),
    );

    let phase = hardening.tls.config_for_bootstrap().expect("config");
    tls_handshake(phase.client, phase.server_name, server)
        .expect_err("chain without issuing authority must be rejected");

    hardening
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("request");
    let err = hardening
        .machine
        .process_bootstrap_response(HandshakeMessage::AuthFailure(
            keystone_common::protocol::AuthFailure {
                reason: keystone_common::protocol::FailureReason::Internal,
                message: None,
            },
        ))
        .await
        .expect_err("nothing to provision");
    assert!(matches!(err, HardeningError::AuthenticationFailed { .. }));
    assert!(!hardening.store.is_provisioned().await);
}

#[tokio::test]
async fn forged_csr_is_rejected_and_bootstrap_stays_in_flight_until_reset() {
    let authority = Authority::new();
    let agent = agent(&authority).await;

    let request = agent
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("request");
    let forged = forge_csr_signature(request);

    // The issuing side refuses the request, so no response is ever processed.
    assert!(authority
        .issue(&forged, authority.token(b"deployment-1", now() + 3600))
        .is_err());
    assert_eq!(agent.machine.state(), HandshakeState::BootstrapInFlight);

    let err = agent
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect_err("second bootstrap must be refused while one is in flight");
    assert!(matches!(err, HardeningError::InternalState { .. }));

    agent.machine.reset().await.expect("reset");
    assert_eq!(agent.machine.state(), HandshakeState::Uninitialized);
    agent
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("fresh bootstrap after reset");
}

#[tokio::test]
async fn response_without_request_mutates_nothing() {
    let authority = Authority::new();
    let agent = agent(&authority).await;
    authority.offer_issuing(&agent.capture);

    let ltac_pem = authority
        .issuing
        .generate_server_cert(&["unrelated.example"])
        .expect("cert")
        .0;
    let err = agent
        .machine
        .process_bootstrap_response(HandshakeMessage::BootstrapResponse(
            keystone_common::protocol::BootstrapResponse {
                ltac_pem,
                revocation_token: authority.token(b"deployment-1", now() + 3600),
                config: None,
            },
        ))
        .await
        .expect_err("must fail");

    assert!(matches!(err, HardeningError::MissingState { .. }));
    assert!(!agent.store.is_provisioned().await);
    assert_eq!(agent.machine.state(), HandshakeState::Uninitialized);
}

/// Flip one byte of the CSR signature
fn forge_csr_signature(request: HandshakeMessage) -> HandshakeMessage {
    let HandshakeMessage::BootstrapRequest(mut request) = request else {
        panic!("expected bootstrap_request");
    };
    let body: String = request
        .csr_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let mut der = STANDARD.decode(body).expect("csr base64");
    let last = der.len() - 1;
    der[last] ^= 0x01;

    let encoded = STANDARD.encode(&der);
    let wrapped: Vec<&str> = encoded
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).expect("base64 is ascii"))
        .collect();
    request.csr_pem = format!(
        "-----BEGIN CERTIFICATE REQUEST-----\n{}\n-----END CERTIFICATE REQUEST-----\n",
        wrapped.join("\n")
    );
    HandshakeMessage::BootstrapRequest(request)
}
