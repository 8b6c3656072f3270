// bin/acn_client.rs - ACN Delegate Client

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::time::Duration;
use tracing::info;

use acn::client::{ClientConfig, ClientSession};
use acn::network::TcpConnector;
use acn::observability::{TracingConfig, init_tracing};
use acn::trust::{LedgerId, LedgerKeyPair};
use acn::wire::Envelope;

/// ACN delegate client
#[derive(Parser)]
#[command(name = "acn-client")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Register an agent with an ACN node and exchange envelopes", long_about = None)]
struct Cli {
    /// Log filter
    #[arg(long, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an agent key pair
    Keygen {
        /// Ledger (fetchai, cosmos, ethereum)
        #[arg(short, long, default_value = "fetchai")]
        ledger: LedgerId,
    },

    /// Send one envelope and wait for its acknowledgement
    Send {
        #[command(flatten)]
        session: SessionArgs,

        /// Recipient agent address
        #[arg(short, long)]
        to: String,

        /// Protocol id carried in the envelope
        #[arg(short, long, default_value = "")]
        protocol: String,

        /// Message body
        message: String,
    },

    /// Print envelopes delivered to this agent until interrupted
    Listen {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(ClapArgs)]
struct SessionArgs {
    /// Delegate endpoint of the node (host:port)
    #[arg(short, long, default_value = "127.0.0.1:11000")]
    node: String,

    /// Public key of the node the agent delegates to
    #[arg(long)]
    node_key: String,

    /// Hex-encoded agent secret key
    #[arg(short, long, env = "ACN_AGENT_KEY", hide_env_values = true)]
    key: String,

    /// Ledger of the agent key
    #[arg(short, long, default_value = "fetchai")]
    ledger: LedgerId,

    /// Acknowledgement timeout in milliseconds
    #[arg(long, default_value = "5000")]
    ack_timeout: u64,
}

impl SessionArgs {
    async fn connect(&self) -> Result<ClientSession> {
        let keys = LedgerKeyPair::from_secret_hex(self.ledger, &self.key)?;
        let config = ClientConfig::default().with_ack_timeout(Duration::from_millis(self.ack_timeout));
        let session = ClientSession::from_signer(
            &keys,
            &self.node_key,
            TcpConnector::new(self.node.clone()),
            config,
        );
        session
            .connect()
            .await
            .with_context(|| format!("failed to register with {}", self.node))?;
        info!(address = %session.address(), node = %self.node, "Registered");
        Ok(session)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&TracingConfig::default().with_filter(cli.log.clone()))?;

    match cli.command {
        Commands::Keygen { ledger } => {
            let keys = LedgerKeyPair::generate(ledger);
            println!("ledger:     {}", ledger.as_str());
            println!("address:    {}", keys.address());
            println!("public key: {}", keys.public_key_string());
            println!("secret key: {}", keys.secret_hex());
        }
        Commands::Send { session, to, protocol, message } => {
            let client = session.connect().await?;
            let envelope = Envelope::new(to, client.address(), message.into_bytes()).with_protocol_id(protocol);
            let result = client.send(&envelope).await;
            client.disconnect().await;
            match result {
                Ok(()) => println!("delivered"),
                Err(e) => bail!("send failed: {e}"),
            }
        }
        Commands::Listen { session } => {
            let client = session.connect().await?;
            println!("listening as {}", client.address());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = client.receive(Duration::from_secs(1)) => {
                        if let Some(envelope) = received {
                            println!(
                                "{} [{}] {}",
                                envelope.sender,
                                envelope.protocol_id,
                                String::from_utf8_lossy(&envelope.message)
                            );
                        } else if !client.is_connected() {
                            bail!("connection to node lost");
                        }
                    }
                }
            }
            client.disconnect().await;
        }
    }

    Ok(())
}
