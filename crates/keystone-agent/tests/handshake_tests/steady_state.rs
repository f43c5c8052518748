//! Steady-state stories
//!
//! A provisioned agent reconnects: it answers the binary challenge and then
//! checks the revocation token the server presents against the one bound at
//! bootstrap. Token changes and integrity failures erase the identity;
//! everything else leaves it in place.

use std::sync::Arc;

use keystone_agent::{
    HandshakeDriver, HandshakeState, HandshakeTimeouts, HardeningError, StoreError,
};
use keystone_common::protocol::{
    AuthFailure, ChallengeRequest, ConnectionStart, FailureReason, HandshakeMessage,
};
use keystone_common::transport::pipe;
use keystone_common::Disposition;
use keystone_infra::challenge::Challenger;
use keystone_infra::crypto::sha256;
use keystone_infra::RevocationError;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

fn start(token: String) -> HandshakeMessage {
    HandshakeMessage::ConnectionStart(ConnectionStart {
        revocation_token: token,
        tunnel: tunnel(),
    })
}

fn answer_challenge(agent: &Agent) {
    agent
        .machine
        .prepare_challenge_response(&ChallengeRequest {
            nonce: vec![0xab; 32],
        })
        .expect("challenge response");
}

/// Change one character of the claims segment to another base64url character
fn alter_one_byte(token: &str) -> String {
    let claims_start = token.find('.').expect("header separator") + 1;
    let index = claims_start + 5;
    let mut bytes = token.as_bytes().to_vec();
    bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
    String::from_utf8(bytes).expect("ascii token")
}

#[tokio::test]
async fn bound_token_is_accepted() {
    let authority = Authority::new();
    let (agent, token) = provisioned(&authority).await;
    answer_challenge(&agent);

    let negotiator = RecordingNegotiator::default();
    agent
        .machine
        .process_connection_request(start(token), &negotiator)
        .await
        .expect("connection should succeed");
    assert_eq!(agent.machine.state(), HandshakeState::Authenticated);
}

#[tokio::test]
async fn token_differing_by_one_byte_resets_identity() {
    let authority = Authority::new();
    let (agent, token) = provisioned(&authority).await;
    answer_challenge(&agent);

    let err = agent
        .machine
        .process_connection_request(start(alter_one_byte(&token)), &RecordingNegotiator::default())
        .await
        .expect_err("altered token must be rejected");

    assert!(matches!(
        err,
        HardeningError::RevocationRejected { reset: true, .. }
    ));
    assert_eq!(err.disposition(), Disposition::Reprovision);
    assert!(matches!(
        agent.store.get().await,
        Err(StoreError::NotProvisioned)
    ));
}

#[tokio::test]
async fn reissued_token_with_other_nonce_resets_identity() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;
    answer_challenge(&agent);

    let other = authority.token(b"deployment-2", now() + 3600);
    let err = agent
        .machine
        .process_connection_request(start(other), &RecordingNegotiator::default())
        .await
        .expect_err("token for another deployment must be rejected");

    assert!(matches!(
        err,
        HardeningError::RevocationRejected {
            source: RevocationError::Mismatch,
            reset: true,
            ..
        }
    ));
    assert!(!agent.store.is_provisioned().await);
}

#[tokio::test]
async fn expired_token_is_rejected_despite_valid_signature() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;
    answer_challenge(&agent);

    let expired = authority.token(b"deployment-1", now() - 60);
    let err = agent
        .machine
        .process_connection_request(start(expired), &RecordingNegotiator::default())
        .await
        .expect_err("expired token must be rejected");

    assert!(matches!(
        err,
        HardeningError::RevocationRejected {
            source: RevocationError::Expired { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn token_from_foreign_root_is_rejected() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;
    answer_challenge(&agent);

    let foreign = Authority::new().token(b"deployment-1", now() + 3600);
    let err = agent
        .machine
        .process_connection_request(start(foreign), &RecordingNegotiator::default())
        .await
        .expect_err("foreign token must be rejected");

    assert!(matches!(
        err,
        HardeningError::RevocationRejected {
            source: RevocationError::BadSignature,
            ..
        }
    ));
}

#[tokio::test]
async fn modified_binary_fails_challenge_but_keeps_identity() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;
    let driver = HandshakeDriver::new(
        Arc::clone(&agent.machine),
        HandshakeTimeouts::default(),
        CancellationToken::new(),
    );
    let (agent_end, server_end) = pipe(8);
    let (mut agent_rx, mut agent_tx) = agent_end.split();
    let (mut server_rx, mut server_tx) = server_end.split();

    // The server only knows a different build.
    let challenger = Challenger::new([sha256(b"another build").to_vec()]);
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
        assert!(challenger.verify(&challenge, &response.ciphertext).is_err());
        send(
            &mut server_tx,
            &HandshakeMessage::AuthFailure(AuthFailure {
                reason: FailureReason::ChallengeFailed,
                message: Some("unknown binary".to_string()),
            }),
        )
        .await;
    };

    let negotiator = RecordingNegotiator::default();
    let (result, ()) = tokio::join!(
        driver.connect(&mut agent_rx, &mut agent_tx, &negotiator),
        server
    );
    let err = result.expect_err("connection must be refused");

    assert!(matches!(
        err,
        HardeningError::AuthenticationFailed {
            reason: FailureReason::ChallengeFailed,
            reset: false,
            ..
        }
    ));
    assert!(err.disposition().is_retryable());
    assert!(agent.store.is_provisioned().await);
    assert_eq!(agent.machine.state(), HandshakeState::Provisioned);
}

#[tokio::test]
async fn tunnel_integrity_failure_resets_identity() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;
    answer_challenge(&agent);

    let err = agent
        .machine
        .process_connection_request(
            HandshakeMessage::AuthFailure(AuthFailure {
                reason: FailureReason::TunnelIntegrity,
                message: None,
            }),
            &RecordingNegotiator::default(),
        )
        .await
        .expect_err("must fail");

    assert!(err.identity_reset());
    assert!(!agent.store.is_provisioned().await);
    assert_eq!(agent.machine.state(), HandshakeState::Uninitialized);
}

#[tokio::test]
async fn reset_then_reconnect_reports_not_provisioned() {
    let authority = Authority::new();
    let (agent, _) = provisioned(&authority).await;

    agent.machine.reset().await.expect("reset");
    agent.machine.reset().await.expect("reset is idempotent");

    let err = agent
        .machine
        .prepare_challenge_response(&ChallengeRequest { nonce: vec![1] })
        .expect_err("no identity");
    assert!(matches!(
        err,
        HardeningError::UnexpectedState {
            state: HandshakeState::Uninitialized,
            ..
        }
    ));
}
