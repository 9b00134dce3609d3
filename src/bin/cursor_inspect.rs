use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use tweet_relay::config;
use tweet_relay::model::PostId;
use tweet_relay::state;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the stored per-account cursors, or pin one with --set"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Pin a cursor, as `handle=post_id`. Posts up to and including that id
    /// will not be forwarded.
    #[arg(long)]
    set: Option<String>,
}

fn parse_assignment(raw: &str) -> Result<(String, PostId)> {
    let (handle, id) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected handle=post_id, got {:?}", raw))?;
    let handle = handle.trim().trim_start_matches('@');
    if handle.is_empty() {
        return Err(anyhow!("empty handle in {:?}", raw));
    }
    let id: PostId = id
        .parse()
        .with_context(|| format!("invalid post id in {:?}", raw))?;
    Ok((handle.to_string(), id))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let store = state::open_store(&cfg).await?;
    let mut cursors = store.load().await?;

    if let Some(raw) = args.set.as_deref() {
        let (handle, id) = parse_assignment(raw)?;
        let previous = cursors.insert(handle.clone(), id);
        store.save(&cursors).await?;
        info!(%handle, %id, previous = ?previous, "cursor pinned");
    }

    let accounts = cfg.accounts()?;
    println!("State: {}", cfg.state_path().display());
    for account in &accounts {
        let cursor = cursors
            .get(&account.handle)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  @{} [{}] -> {}", account.handle, account.language, cursor);
    }
    for (handle, id) in &cursors {
        if !accounts.iter().any(|a| &a.handle == handle) {
            println!("  @{} (not in account list) -> {}", handle, id);
        }
    }
    Ok(())
}
