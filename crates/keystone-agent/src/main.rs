//! Keystone Agent - operator commands for the hardening client

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keystone_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

use keystone_agent::abh::ExecutableHasher;
use keystone_agent::{AgentConfig, HandshakeState, IdentityStore, StoreArgs};

/// Keystone Agent - mutual-trust handshake client
#[derive(Parser, Debug)]
#[command(name = "keystone-agent", version, about, long_about = None)]
struct Cli {
    /// Emit JSON logs instead of text
    #[arg(long, global = true, env = "KEYSTONE_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether a long-term identity is provisioned
    Status(StoreArgs),
    /// Erase the long-term identity; the next connection re-bootstraps
    Reset(StoreArgs),
    /// Print the identity hash of this binary
    BinaryHash,
    /// Validate trust material and build the TLS config for the next phase
    Check(AgentConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The agent cannot operate without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "keystone-agent".to_string(),
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
    })?;

    match cli.command {
        Commands::Status(args) => status(args).await,
        Commands::Reset(args) => reset(args).await,
        Commands::BinaryHash => binary_hash(),
        Commands::Check(config) => check(config).await,
    }
}

async fn status(args: StoreArgs) -> anyhow::Result<()> {
    let store = IdentityStore::new(&args.store_dir, args.agent_id.clone());
    let provisioned = store.is_provisioned().await;
    println!("agent:       {}", args.agent_id);
    println!("store:       {}", store.blob_path().display());
    println!(
        "provisioned: {}",
        if provisioned { "yes" } else { "no" }
    );
    Ok(())
}

async fn reset(args: StoreArgs) -> anyhow::Result<()> {
    let store = IdentityStore::new(&args.store_dir, args.agent_id.clone());
    store
        .reset()
        .await
        .with_context(|| format!("failed to reset identity for {}", args.agent_id))?;
    println!("identity for {} erased", args.agent_id);
    Ok(())
}

fn binary_hash() -> anyhow::Result<()> {
    let hasher = ExecutableHasher::current().context("failed to hash running binary")?;
    println!("{}  {}", hasher.hex(), hasher.path().display());
    Ok(())
}

async fn check(config: AgentConfig) -> anyhow::Result<()> {
    let trust = Arc::new(
        config
            .trust_material()
            .await
            .context("trust material is unusable")?,
    );
    let abh = Arc::new(ExecutableHasher::current().context("failed to hash running binary")?);

    let hardening = keystone_agent::assemble(
        config.store.agent_id.clone(),
        Arc::clone(&trust),
        &config.store.store_dir,
        abh,
    )
    .await
    .context("failed to initialize hardening components")?;

    let phase = match hardening.machine.state() {
        HandshakeState::Uninitialized => {
            hardening.tls.config_for_bootstrap()?;
            "bootstrap"
        }
        _ => {
            hardening.tls.config_for_connection().await?;
            "connection"
        }
    };

    println!("agent:       {}", config.store.agent_id);
    println!("server name: {}", trust.server_name());
    println!("next phase:  {}", phase);
    println!("handshake timeout: {:?}", config.timeouts().deadline);
    Ok(())
}
