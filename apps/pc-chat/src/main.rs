use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pc_client::{ChatClient, ClientConfig, MemoryHub};
use pc_crypto::IdentityKeyPair;
use pc_store::{MemoryRecordStore, RecordStore, SqliteRecordStore, Vault};

#[derive(Parser, Debug)]
#[command(name = "pc-chat", version, about = "Peer chat client", long_about = None)]
struct Cli {
    /// JSON client configuration; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new identity and print its session id
    Identity {
        /// Write the secret key (hex) to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run two local clients over the loopback relay through a full handshake
    Demo {
        /// Persist the sender's records in an encrypted SQLite database here
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Vault password for --data-dir
        #[arg(long, default_value = "demo")]
        password: String,
    },
    /// Poll the configured HTTP push relay once and store what arrived
    Inbox {
        /// Hex secret key written by `identity --out`
        #[arg(long)]
        identity: PathBuf,
        /// Session id of a known peer (repeatable)
        #[arg(long = "contact")]
        contacts: Vec<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "demo")]
        password: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pc_chat=info,pc_client=info,pc_store=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Identity { out } => identity_command(out),
        Commands::Demo { data_dir, password } => demo_command(config, data_dir, password).await,
        Commands::Inbox { identity, contacts, data_dir, password } => {
            inbox_command(config, identity, contacts, data_dir, password).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ClientConfig> {
    match path {
        Some(p) => Ok(ClientConfig::load(p)?.with_env()),
        None => Ok(ClientConfig::from_env()),
    }
}

fn identity_command(out: Option<PathBuf>) -> Result<()> {
    let identity = IdentityKeyPair::generate();
    let session_id = identity.session_id()?;
    println!("session id:  {session_id}");
    println!("fingerprint: {}", session_id.fingerprint());
    if let Some(path) = out {
        std::fs::write(&path, hex::encode(identity.secret_bytes()))
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "identity written");
    }
    Ok(())
}

async fn inbox_command(
    config: ClientConfig,
    identity_path: PathBuf,
    contacts: Vec<String>,
    data_dir: Option<PathBuf>,
    password: String,
) -> Result<()> {
    let raw = std::fs::read_to_string(&identity_path)
        .with_context(|| format!("reading {}", identity_path.display()))?;
    let secret = hex::decode(raw.trim()).context("identity file is not hex")?;
    let identity = IdentityKeyPair::from_bytes(&secret)?;
    let sid = identity.session_id()?.to_string();

    // Realtime is never started here; the push relay carries everything.
    let client = ChatClient::with_http_relay(
        config,
        identity,
        open_store(data_dir, &password).await?,
        Arc::new(MemoryHub::new().connector(&sid)),
    )?;
    for contact in &contacts {
        client.add_contact(contact)?;
    }
    let handled = client.pump().await?;
    info!(handled, "inbox polled");
    for conversation in client.conversations().await? {
        println!("{}", serde_json::to_string(&conversation)?);
    }
    Ok(())
}

async fn open_store(data_dir: Option<PathBuf>, password: &str) -> Result<Arc<dyn RecordStore>> {
    let Some(dir) = data_dir else {
        return Ok(Arc::new(MemoryRecordStore::new()));
    };
    std::fs::create_dir_all(&dir)?;
    let store = SqliteRecordStore::open(&dir.join("pc-chat.db"), Vault::new()).await?;
    store.unlock(password.as_bytes()).await?;
    info!(path = %dir.display(), "encrypted store opened");
    Ok(Arc::new(store))
}

fn demo_client(
    hub: &MemoryHub,
    config: ClientConfig,
    store: Arc<dyn RecordStore>,
) -> Result<Arc<ChatClient>> {
    let identity = IdentityKeyPair::generate();
    let sid = identity.session_id()?.to_string();
    let client = ChatClient::new(
        config,
        identity,
        store,
        Arc::new(hub.push_relay(&sid)),
        Arc::new(hub.connector(&sid)),
    )?;
    Ok(Arc::new(client))
}

async fn demo_command(config: ClientConfig, data_dir: Option<PathBuf>, password: String) -> Result<()> {
    let hub = MemoryHub::new();
    let alice = demo_client(
        &hub,
        ClientConfig { sender_name: "alice".into(), ..config.clone() },
        open_store(data_dir, &password).await?,
    )?;
    let bob = demo_client(
        &hub,
        ClientConfig { sender_name: "bob".into(), ..config },
        Arc::new(MemoryRecordStore::new()),
    )?;
    alice.add_contact(bob.session_id())?;
    bob.add_contact(alice.session_id())?;
    alice.start().await;
    bob.start().await;

    let sent = alice.send_message(bob.session_id(), "hello from alice").await?;
    info!(message_id = %sent.id, status = sent.status.as_str(), "alice sent");

    bob.pump().await?;
    alice.pump().await?;
    let delivered = alice.message(&sent.id).await?.ok_or_else(|| anyhow!("message vanished"))?;
    info!(status = delivered.status.as_str(), "alice after delivery receipt");

    bob.open_conversation(alice.session_id()).await?;
    alice.pump().await?;

    let sender_copy = alice.message(&sent.id).await?.ok_or_else(|| anyhow!("message vanished"))?;
    let receiver_copy = bob.message(&sent.id).await?.ok_or_else(|| anyhow!("message not received"))?;
    println!("sender copy:   {}", serde_json::to_string_pretty(&sender_copy)?);
    println!("receiver copy: {}", serde_json::to_string_pretty(&receiver_copy)?);

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
