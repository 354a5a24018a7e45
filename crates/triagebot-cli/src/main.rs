//! Process entry point: loads configuration and secrets, wires the Slack
//! and Duo adapters to the datastore, and runs the coordinator loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use triagebot_core::adapters::{DuoAuth, SlackChat};
use triagebot_core::config::Config;
use triagebot_core::db::Database;
use triagebot_core::Coordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let _ = dotenvy::dotenv();

    let config_path = std::env::var("TRIAGEBOT_CONFIG")
        .map(PathBuf::from)
        .or_else(|_| std::env::args().nth(1).map(PathBuf::from).ok_or(()))
        .unwrap_or_else(|_| {
            dirs::config_dir().map(|dir| dir.join("triagebot/triagebot.yaml")).unwrap_or_else(|| PathBuf::from("triagebot.yaml"))
        });

    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let slack_token = std::env::var("SLACK_BOT_TOKEN").context("SLACK_BOT_TOKEN is required")?;
    let duo_host = std::env::var("DUO_API_HOST").context("DUO_API_HOST is required")?;
    let duo_ikey = std::env::var("DUO_INTEGRATION_KEY").context("DUO_INTEGRATION_KEY is required")?;
    let duo_skey = std::env::var("DUO_SECRET_KEY").context("DUO_SECRET_KEY is required")?;

    let chat = Arc::new(SlackChat::new(slack_token));
    let auth = Arc::new(DuoAuth::new(duo_host, duo_ikey, duo_skey));
    let db = Arc::new(Mutex::new(
        Database::open(&config.database_path)
            .await
            .with_context(|| format!("opening database at {}", config.database_path.display()))?,
    ));

    info!(config = %config_path.display(), "starting triagebot");
    let mut coordinator = Coordinator::new(chat, auth, db, config);
    coordinator.run().await.context("coordinator loop exited")
}
