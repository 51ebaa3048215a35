use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nostr_sdk::prelude::*;
use quill_core::config::{default_app_config_json, CONFIG_FILE_NAME};
use quill_core::{
    load_app_config, spawn_secret_poller, EngineContext, FileSecretStore, KeyUpdateOutcome,
    NostrRelayPool, SecretStore, SqliteKvStore, SyncEngine, SyncOptions, UserStatusProps,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "quill")]
#[command(about = "Keep a Nostr identity's profile, relay list and status in sync")]
struct Cli {
    /// State directory (identity, config and cache persist here between runs)
    #[arg(long, default_value = ".quill", env = "QUILL_STATE_DIR")]
    state_dir: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default quill_config.json to the state dir (an existing one is kept)
    InitConfig,

    /// Show the configured identity
    Identity,

    /// Set the private key (nsec or hex) and resync everything for it
    SetKey {
        /// Private key; omit together with --generate to create a fresh one
        key: Option<String>,

        #[arg(long, conflicts_with = "key")]
        generate: bool,
    },

    /// Remove the private key and all cached state
    ClearKey,

    /// Sync state from relays
    Sync {
        /// Also refetch profile and relay list, not just the status
        #[arg(long)]
        metadata: bool,
    },

    /// Print the current profile, relay list and status
    Show,

    /// Publish a text note; #hashtags become `t` tags
    Post { content: String },

    /// Publish a user status
    Status {
        /// Status text (defaults to `default_status` from the config)
        text: Option<String>,

        /// Link attached to the status
        #[arg(long)]
        link: Option<String>,

        /// Expire the status after this many seconds
        #[arg(long)]
        expires_in: Option<u64>,

        /// Clear the status instead
        #[arg(long, conflicts_with_all = ["text", "link", "expires_in"])]
        clear: bool,
    },

    /// Follow live updates and print state whenever it changes
    Listen {
        /// Timeout in seconds (0 = run until interrupted)
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("create state dir {}", cli.state_dir.display()))?;
    quill_core::logging::init_logging(Some(&cli.state_dir), "quill_core=info,warn");

    if let Command::InitConfig = cli.cmd {
        return cmd_init_config(&cli.state_dir);
    }

    let (engine, secrets) = open(&cli).await?;
    let result = match &cli.cmd {
        Command::InitConfig => Ok(()),
        Command::Identity => cmd_identity(&engine),
        Command::SetKey { key, generate } => cmd_set_key(&engine, key.as_deref(), *generate).await,
        Command::ClearKey => cmd_clear_key(&engine).await,
        Command::Sync { metadata } => cmd_sync(&engine, *metadata).await,
        Command::Show => cmd_show(&engine).await,
        Command::Post { content } => cmd_post(&engine, content).await,
        Command::Status {
            text,
            link,
            expires_in,
            clear,
        } => cmd_status(&engine, text.clone(), link.clone(), *expires_in, *clear).await,
        Command::Listen { timeout } => cmd_listen(&engine, secrets, *timeout).await,
    };
    engine.dispose().await;
    result
}

async fn open(cli: &Cli) -> anyhow::Result<(SyncEngine, Arc<dyn SecretStore>)> {
    let config = load_app_config(&cli.state_dir);
    let secrets: Arc<dyn SecretStore> = Arc::new(
        FileSecretStore::open(&cli.state_dir).context("open secret store")?,
    );
    let kv = Arc::new(SqliteKvStore::open(&cli.state_dir).context("open state database")?);
    let pool = Arc::new(NostrRelayPool::new(config.fetch_timeout()));

    let engine = SyncEngine::init(EngineContext {
        relay_pool: pool,
        secrets: secrets.clone(),
        kv,
        config,
    })
    .await
    .context("start engine")?;
    Ok((engine, secrets))
}

fn print(v: serde_json::Value) {
    match serde_json::to_string_pretty(&v) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("json encode: {e}"),
    }
}

fn snapshot(engine: &SyncEngine) -> serde_json::Value {
    let status = engine.user_status();
    json!({
        "profile": engine.profile(),
        "relays": engine.relays(),
        "status": {
            "status": status.status,
            "link_url": status.link_url,
            "expiration": status.expiration,
        },
        "last_updated_ms": engine.last_updated(),
    })
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_init_config(state_dir: &std::path::Path) -> anyhow::Result<()> {
    let path = state_dir.join(CONFIG_FILE_NAME);
    let created = !path.exists();
    if created {
        std::fs::write(&path, default_app_config_json())
            .with_context(|| format!("write {}", path.display()))?;
    }
    print(json!({ "path": path.display().to_string(), "created": created }));
    Ok(())
}

fn cmd_identity(engine: &SyncEngine) -> anyhow::Result<()> {
    match engine.public_key()? {
        Some(pubkey) => print(json!({
            "pubkey": pubkey.to_hex(),
            "npub": pubkey.to_bech32().context("encode npub")?,
        })),
        None => print(json!({ "pubkey": null })),
    }
    Ok(())
}

async fn cmd_set_key(engine: &SyncEngine, key: Option<&str>, generate: bool) -> anyhow::Result<()> {
    let input = match (key, generate) {
        (Some(key), _) => key.to_string(),
        (None, true) => Keys::generate().secret_key().to_secret_hex(),
        (None, false) => anyhow::bail!("pass a private key or --generate"),
    };
    let outcome = engine
        .update_private_key(&input)
        .await
        .context("update private key")?;
    match outcome {
        KeyUpdateOutcome::Applied => {
            let pubkey = engine.public_key()?.map(|pk| pk.to_hex());
            print(json!({ "updated": true, "pubkey": pubkey }));
        }
        KeyUpdateOutcome::Contended => {
            print(json!({ "updated": false, "reason": "key update in progress elsewhere" }))
        }
    }
    Ok(())
}

async fn cmd_clear_key(engine: &SyncEngine) -> anyhow::Result<()> {
    let outcome = engine.clear_private_key().await.context("clear private key")?;
    print(json!({ "cleared": outcome == KeyUpdateOutcome::Applied }));
    Ok(())
}

async fn cmd_sync(engine: &SyncEngine, metadata: bool) -> anyhow::Result<()> {
    engine
        .sync_states_with_relays(SyncOptions {
            sync_metadata: metadata,
        })
        .await
        .context("sync with relays")?;
    if metadata {
        engine.save_metadata_to_cache()?;
    }
    print(snapshot(engine));
    Ok(())
}

async fn cmd_show(engine: &SyncEngine) -> anyhow::Result<()> {
    let mut v = snapshot(engine);
    v["relay_states"] = json!(engine.relay_states().await);
    print(v);
    Ok(())
}

async fn cmd_post(engine: &SyncEngine, content: &str) -> anyhow::Result<()> {
    let id = engine.post_text(content).await.context("post text")?;
    engine.wait_for_pending_publishes().await;
    print(json!({ "event_id": id.to_hex() }));
    Ok(())
}

async fn cmd_status(
    engine: &SyncEngine,
    text: Option<String>,
    link: Option<String>,
    expires_in: Option<u64>,
    clear: bool,
) -> anyhow::Result<()> {
    let props = if clear {
        UserStatusProps::default()
    } else {
        let config = engine.config();
        UserStatusProps {
            status: text.unwrap_or_else(|| config.default_status()),
            link_url: link.unwrap_or_else(|| config.default_status_link()),
            expiration: expires_in.map(|secs| Timestamp::now().as_secs() + secs),
        }
    };
    let id = engine
        .update_user_status(props)
        .await
        .context("update user status")?;
    engine.wait_for_pending_publishes().await;
    print(json!({ "event_id": id.to_hex(), "status": snapshot(engine)["status"] }));
    Ok(())
}

async fn cmd_listen(
    engine: &SyncEngine,
    secrets: Arc<dyn SecretStore>,
    timeout_sec: u64,
) -> anyhow::Result<()> {
    // Picks up key changes made by other quill processes.
    let poller = spawn_secret_poller(secrets, Duration::from_secs(2));

    let deadline = (timeout_sec > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(timeout_sec));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last = serde_json::Value::Null;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        if deadline.is_some_and(|dl| tokio::time::Instant::now() >= dl) {
            break;
        }
        let current = snapshot(engine);
        if current != last {
            print(current.clone());
            last = current;
        }
    }

    poller.abort();
    Ok(())
}
