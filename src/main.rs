//! Command line interface for the group client. Offers offline key
//! utilities plus login, membership and messaging against the configured
//! relays.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relaygroups::{
    config::{Settings, DEFAULT_GROUP_RELAY, DEFAULT_METADATA_RELAYS},
    model::{GroupMessage, GENERAL_CHANNEL},
    ConnectionState, FileStore, KeyPair, Session, WsTransport,
};
use tokio::time::{sleep, timeout_at, Instant};
use tracing_subscriber::EnvFilter;

/// Time given to the socket writers before the process exits.
const FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaygroups",
    author,
    version,
    about = "Nostr relay-based group client"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Generate a new private key and print it with its public key.
    Keygen,
    /// Print the public key for a private key.
    Pubkey { private_key: String },
    /// Store a private key and reconcile joined groups.
    Login { private_key: String },
    /// Forget the stored key and joined groups.
    Logout,
    /// List groups advertised by the active relay.
    Groups {
        /// Seconds to collect group metadata.
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
    /// Join a group on the active relay.
    Join { group: String },
    /// Leave a group on the active relay.
    Leave {
        group: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Send a chat message.
    Send {
        group: String,
        content: String,
        #[arg(long)]
        channel: Option<String>,
    },
    /// Print a channel's messages as they arrive.
    Listen {
        group: String,
        #[arg(long, default_value = GENERAL_CHANNEL)]
        channel: String,
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Make another group relay the active one.
    SwitchRelay { url: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("private_key={}", keys.private_key_hex());
            println!("public_key={}", keys.public_key_hex());
            return Ok(());
        }
        Commands::Pubkey { private_key } => {
            let keys =
                KeyPair::from_private_key_hex(private_key.trim()).context("invalid private key")?;
            println!("{}", keys.public_key_hex());
            return Ok(());
        }
        _ => {}
    }

    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Arc::new(FileStore::open(&cfg.store_path)?);
    let transport = Arc::new(WsTransport::new(cfg.tor_socks.clone(), cfg.connect_timeout));
    let session = Session::new(cfg, store, transport);

    let result = execute(&session, cli.command).await;
    session.teardown();
    result
}

async fn execute(session: &Session, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Login { private_key } => {
            session.restore_relay();
            session
                .login(&private_key)
                .await
                .context("invalid private key")?;
            println!("logged in as {}", session.public_key().unwrap_or_default());
            print_joined(session);
            sleep(FLUSH_DELAY).await;
        }
        Commands::Logout => {
            session.logout()?;
            println!("logged out");
        }
        Commands::Groups { seconds } => {
            session.init().await?;
            if session.connection_state().get() != ConnectionState::Connected {
                session.connect().await?;
            }
            sleep(Duration::from_secs(seconds)).await;
            for group in session.groups().get() {
                let joined = if session.is_group_joined(&group.id) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{joined} {}\t{}\t{}\t{}",
                    group.id,
                    group.name.unwrap_or_default(),
                    if group.is_public { "public" } else { "private" },
                    if group.is_open { "open" } else { "closed" },
                );
            }
        }
        Commands::Join { group } => {
            login_required(session).await?;
            session.join_group(&group).await?;
            println!("joined {group}");
            sleep(FLUSH_DELAY).await;
        }
        Commands::Leave { group, reason } => {
            login_required(session).await?;
            session.leave_group(&group, reason.as_deref())?;
            println!("left {group}");
            sleep(FLUSH_DELAY).await;
        }
        Commands::Send {
            group,
            content,
            channel,
        } => {
            login_required(session).await?;
            let event = session.send_message(&group, &content, channel.as_deref())?;
            println!("{}", event.id.unwrap_or_default());
            sleep(FLUSH_DELAY).await;
        }
        Commands::Listen {
            group,
            channel,
            seconds,
        } => {
            session.init().await?;
            session.request_group_messages(&group).await?;
            listen(session, &group, &channel, Duration::from_secs(seconds)).await;
        }
        Commands::SwitchRelay { url } => {
            session.init().await?;
            session.switch_relay(&url).await?;
            println!("active relay {url}");
            print_joined(session);
            sleep(FLUSH_DELAY).await;
        }
        Commands::Keygen | Commands::Pubkey { .. } => {}
    }
    Ok(())
}

async fn login_required(session: &Session) -> anyhow::Result<()> {
    session.init().await?;
    if !session.is_logged_in() {
        bail!("not logged in; run `relaygroups login <private-key>` first");
    }
    Ok(())
}

fn print_joined(session: &Session) {
    let joined = session.joined_groups().get();
    println!(
        "{} joined group(s) on {}",
        joined.len(),
        session.current_relay_url()
    );
    for group in joined {
        println!("  {group}");
    }
}

/// Print messages of `channel` until `duration` elapses.
async fn listen(session: &Session, group: &str, channel: &str, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut seen = HashSet::new();
    let mut rx = session.messages().subscribe();
    loop {
        for message in session.messages_for_channel(group, channel) {
            if seen.insert(message.id.clone()) {
                print_message(session, &message);
            }
        }
        match timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

fn print_message(session: &Session, message: &GroupMessage) {
    let author = session
        .profiles()
        .with(|p| p.get(&message.pubkey).and_then(|m| m.label().map(str::to_string)))
        .unwrap_or_else(|| message.pubkey.chars().take(8).collect());
    match message.label() {
        "message" => println!("[{}] {author}: {}", message.created_at, message.content),
        label => println!("[{}] {author} ({label})", message.created_at),
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_path = base_dir.join("relaygroups-data").join("store.json");
    let mut content = String::new();
    content.push_str(&format!("GROUP_RELAY={DEFAULT_GROUP_RELAY}\n"));
    content.push_str(&format!(
        "METADATA_RELAYS={}\n",
        DEFAULT_METADATA_RELAYS.join(",")
    ));
    content.push_str(&format!("STORE_PATH={}\n", display_path(&store_path)));
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("MEMBERSHIP_TIMEOUT_MS=5000\n");
    content.push_str("MEMBERSHIP_POLL_MS=500\n");
    content.push_str("METADATA_SETTLE_MS=1000\n");
    content.push_str("CONNECT_TIMEOUT_MS=10000\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaygroups=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygroups::{
        store::{joined_groups_key, KeyValueStore, CURRENT_RELAY_URL, PRIVATE_KEY},
        FileStore,
    };
    use std::{collections::BTreeSet, fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
        "GROUP_RELAY",
        "METADATA_RELAYS",
        "STORE_PATH",
        "VERIFY_SIG",
        "TOR_SOCKS",
        "MEMBERSHIP_TIMEOUT_MS",
        "MEMBERSHIP_POLL_MS",
        "METADATA_SETTLE_MS",
        "CONNECT_TIMEOUT_MS",
    ];

    fn clear_env() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "GROUP_RELAY=ws://127.0.0.1:9\nMETADATA_RELAYS=ws://127.0.0.1:9\nSTORE_PATH={}\nCONNECT_TIMEOUT_MS=200\n",
            dir.path().join("store.json").display()
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Logout,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_store = dir.path().join("relaygroups-data").join("store.json");
        assert!(data.contains(&format!("STORE_PATH={}", expected_store.to_string_lossy())));
        assert!(data.contains(&format!("GROUP_RELAY={DEFAULT_GROUP_RELAY}")));
        assert!(data.contains("VERIFY_SIG=1"));
        assert!(expected_store.exists());
    }

    #[tokio::test]
    async fn logout_clears_store() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let store_path = dir.path().join("store.json");
        {
            let store = FileStore::open(&store_path).unwrap();
            store.set(PRIVATE_KEY, &KeyPair::generate().private_key_hex()).unwrap();
            store.set(CURRENT_RELAY_URL, "wss://kept").unwrap();
            store
                .set_set(&joined_groups_key("wss://kept"), &BTreeSet::from(["g".to_string()]))
                .unwrap();
        }

        run(Cli {
            env: env_file,
            command: Commands::Logout,
        })
        .await
        .unwrap();

        let store = FileStore::open(&store_path).unwrap();
        assert!(store.get(PRIVATE_KEY).is_none());
        assert!(store.get_set(&joined_groups_key("wss://kept")).is_empty());
        assert_eq!(store.get(CURRENT_RELAY_URL).as_deref(), Some("wss://kept"));
    }

    #[tokio::test]
    async fn join_requires_login() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let err = run(Cli {
            env: env_file,
            command: Commands::Join { group: "g".into() },
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not logged in"));
    }

    #[tokio::test]
    async fn pubkey_rejects_bad_hex() {
        assert!(run(Cli {
            env: ".env".into(),
            command: Commands::Pubkey {
                private_key: "xyz".into(),
            },
        })
        .await
        .is_err());
    }
}
