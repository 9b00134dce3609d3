use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use tweet_relay::config;
use tweet_relay::publish::MastodonClient;
use tweet_relay::relay::{Pacing, Relay};
use tweet_relay::source::TwitterClient;
use tweet_relay::state;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single cycle over all accounts and exit
    #[arg(long)]
    once: bool,
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
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let accounts = cfg.accounts()?;

    let store = state::open_store(&cfg).await?;
    let cursors = match store.load().await {
        Ok(cursors) => cursors,
        Err(err) if err.is_corrupt() => {
            error!(?err, path = %cfg.state_path().display(), "refusing to start with corrupt cursor state");
            bail!("corrupt cursor state at {}: {}", cfg.state_path().display(), err);
        }
        Err(err) => return Err(err.into()),
    };
    info!(
        accounts = accounts.len(),
        stored_cursors = cursors.len(),
        "cursor state loaded"
    );

    let source = TwitterClient::new(cfg.twitter.bearer_token.clone(), cfg.twitter.batch_size)?;
    let publisher = MastodonClient::new(&cfg.mastodon_base_url(), cfg.mastodon.access_token.clone())?;
    let pacing = Pacing::from_secs(cfg.app.account_delay_secs, cfg.app.cycle_delay_secs);

    let mut relay = Relay::new(&accounts, &source, &publisher, store.as_ref(), cursors, pacing);

    if args.once {
        let report = relay.run_cycle().await;
        info!(
            committed = report.committed(),
            failed = report.failed(),
            forwarded = report.forwarded(),
            "single cycle finished"
        );
        return Ok(());
    }

    info!("starting relay loop");
    relay.run_forever(shutdown_signal()).await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
