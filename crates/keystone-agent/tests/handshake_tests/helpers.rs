//! Server-side simulation shared by the handshake stories

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use keystone_agent::{
    AgentInfo, FixedBinaryHash, HardeningStateMachine, IdentityStore, TrustMaterial,
    TunnelNegotiator,
};
use keystone_common::protocol::{BootstrapResponse, HandshakeMessage, TunnelConfig};
use keystone_common::{AgentId, Frame, FrameReader, FrameWriter, DEFAULT_SERVER_NAME};
use keystone_infra::mtls::{self, sca_handoff, ScaSender};
use keystone_infra::pki::PkiError;
use keystone_infra::{CertificateAuthority, RevocationSigner, ServerMtlsConfig};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

pub const AGENT: &str = "5f1e0c2b9a8d7e6f5a4b3c2d1e0f9a8b";
pub const ABH: [u8; 32] = [0x42; 32];

pub fn agent_id() -> AgentId {
    AgentId::parse(AGENT).expect("valid agent id")
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs()
}

/// Root authority, issuing authority and revocation token signer
pub struct Authority {
    pub root: CertificateAuthority,
    pub issuing: CertificateAuthority,
    pub signer: RevocationSigner,
}

impl Authority {
    pub fn new() -> Self {
        let root = CertificateAuthority::new("Keystone Root").expect("root creation");
        let issuing = root
            .issue_intermediate("Keystone Issuing")
            .expect("issuing authority creation");
        let signer = RevocationSigner::from_pkcs8(&root.ca_key_pkcs8().expect("root pkcs8"))
            .expect("signer");
        Self {
            root,
            issuing,
            signer,
        }
    }

    pub fn trust(&self) -> TrustMaterial {
        let (iac_pem, iac_key) = self
            .root
            .generate_installation_cert("integration")
            .expect("installation certificate");
        TrustMaterial::from_pem(self.root.ca_cert_pem(), &iac_pem, &iac_key, DEFAULT_SERVER_NAME)
            .expect("trust material")
    }

    /// Server presenting leaf + issuing authority, requiring client certs
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let (leaf_pem, key_pem) = self
            .issuing
            .generate_server_cert(&[DEFAULT_SERVER_NAME])
            .expect("server certificate");
        let chain = format!("{}{}", leaf_pem, self.issuing.ca_cert_pem());
        Arc::new(
            ServerMtlsConfig::new(chain, key_pem, self.root.ca_cert_pem().to_string())
                .to_server_config()
                .expect("server config"),
        )
    }

    pub fn token(&self, nonce: &[u8], expires_at: u64) -> String {
        self.signer.sign(nonce, expires_at).expect("token signing")
    }

    /// Sign the CSR of a bootstrap request
    pub fn issue(
        &self,
        request: &HandshakeMessage,
        revocation_token: String,
    ) -> Result<HandshakeMessage, PkiError> {
        let HandshakeMessage::BootstrapRequest(request) = request else {
            panic!("expected bootstrap_request, got {}", request.kind());
        };
        let ltac_pem = self.issuing.sign_csr(&request.csr_pem, &request.agent_id)?;
        Ok(HandshakeMessage::BootstrapResponse(BootstrapResponse {
            ltac_pem,
            revocation_token,
            config: None,
        }))
    }

    pub fn offer_issuing(&self, capture: &ScaSender) {
        capture
            .offer(CertificateDer::from(
                self.issuing.ca_cert_der().expect("issuing der"),
            ))
            .expect("capture should succeed");
    }
}

/// A state machine with its own issuing-authority handoff
pub struct Agent {
    pub machine: Arc<HardeningStateMachine>,
    pub store: Arc<IdentityStore>,
    pub capture: ScaSender,
    pub _dir: tempfile::TempDir,
}

pub async fn agent(authority: &Authority) -> Agent {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(IdentityStore::new(dir.path(), agent_id()));
    let (capture, sca_rx) = sca_handoff();
    let machine = HardeningStateMachine::new(
        agent_id(),
        &authority.trust(),
        Arc::clone(&store),
        Arc::new(FixedBinaryHash(ABH.to_vec())),
        sca_rx,
    )
    .await
    .expect("state machine");
    Agent {
        machine: Arc::new(machine),
        store,
        capture,
        _dir: dir,
    }
}

/// Provision an agent directly through the state machine; returns the bound token
pub async fn provisioned(authority: &Authority) -> (Agent, String) {
    let agent = agent(authority).await;
    let request = agent
        .machine
        .prepare_bootstrap_request(&AgentInfo::current())
        .expect("bootstrap request");
    authority.offer_issuing(&agent.capture);
    let token = authority.token(b"deployment-1", now() + 3600);
    agent
        .machine
        .process_bootstrap_response(authority.issue(&request, token.clone()).expect("issuance"))
        .await
        .expect("bootstrap should succeed");
    (agent, token)
}

/// Drive a client and server connection to completion in memory
pub fn tls_handshake(
    client: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    server: Arc<ServerConfig>,
) -> Result<(), rustls::Error> {
    let mut client = ClientConnection::new(client, server_name)?;
    let mut server = ServerConnection::new(server)?;

    let io = |e: std::io::Error| rustls::Error::General(e.to_string());
    for _ in 0..16 {
        while client.wants_write() {
            let mut buf = Vec::new();
            client.write_tls(&mut buf).map_err(io)?;
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                server.read_tls(&mut rd).map_err(io)?;
            }
            server.process_new_packets()?;
        }
        while server.wants_write() {
            let mut buf = Vec::new();
            server.write_tls(&mut buf).map_err(io)?;
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                client.read_tls(&mut rd).map_err(io)?;
            }
            client.process_new_packets()?;
        }
        if !client.is_handshaking() && !server.is_handshaking() {
            return Ok(());
        }
    }
    Err(rustls::Error::General("handshake did not complete".into()))
}

pub fn server_name() -> ServerName<'static> {
    mtls::server_name(DEFAULT_SERVER_NAME).expect("server name")
}

pub async fn send<W: FrameWriter + ?Sized>(writer: &mut W, message: &HandshakeMessage) {
    writer
        .send(Frame::Text(message.encode().expect("encode")))
        .await
        .expect("send");
}

pub async fn recv<R: FrameReader + ?Sized>(reader: &mut R) -> HandshakeMessage {
    match reader.recv().await.expect("recv") {
        Some(Frame::Text(text)) => HandshakeMessage::decode(&text).expect("decode"),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// Negotiator that accepts every tunnel and remembers it
#[derive(Default)]
pub struct RecordingNegotiator {
    pub seen: Mutex<Vec<TunnelConfig>>,
}

#[async_trait]
impl TunnelNegotiator for RecordingNegotiator {
    async fn negotiate(&self, tunnel: &TunnelConfig) -> Result<(), String> {
        self.seen
            .lock()
            .expect("negotiator lock")
            .push(tunnel.clone());
        Ok(())
    }
}

pub fn tunnel() -> TunnelConfig {
    TunnelConfig {
        kind: "wireguard".to_string(),
        parameters: [("mtu".to_string(), "1380".to_string())].into_iter().collect(),
    }
}
