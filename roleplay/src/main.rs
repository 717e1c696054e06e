//! Terminal driver for roleplay training courses.
//!
//! Usage:
//! ```bash
//! # Requires ANTHROPIC_API_KEY (a .env file is read if present)
//! cargo run -p roleplay -- --activity refund-desk --user ken --name Ken
//!
//! # Verbose engine logs on stderr
//! RUST_LOG=roleplay_core=debug cargo run -p roleplay -- --activity refund-desk
//! ```

mod repl;

use anyhow::{Context, Result};
use clap::Parser;
use roleplay_core::{
    ClaudeGenerator, DialogueEngine, EngineConfig, InMemoryCatalog, JsonDirDocumentStore,
    JsonFileMemoryRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roleplay")]
#[command(about = "Practice a roleplay training course in the terminal")]
#[command(version)]
struct Args {
    /// Catalog of personas, activities and courses
    #[arg(long, default_value = "roleplay/assets/catalog.json")]
    catalog: PathBuf,

    /// Activity to play
    #[arg(short, long)]
    activity: String,

    /// Learner id
    #[arg(short, long, default_value = "learner")]
    user: String,

    /// Session code; reuse it to resume
    #[arg(short, long, default_value = "default")]
    session: String,

    /// Name the persona addresses you by
    #[arg(short, long, default_value = "")]
    name: String,

    /// Directory for sessions and memories
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roleplay_core=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env();

    let catalog = InMemoryCatalog::from_json_file(&args.catalog)
        .await
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;
    let generator = ClaudeGenerator::from_env(&config).context("ANTHROPIC_API_KEY must be set")?;

    let engine = DialogueEngine::new(
        Arc::new(catalog),
        Arc::new(generator),
        Arc::new(JsonFileMemoryRepository::new(args.data_dir.join("memories.json"))),
        Arc::new(JsonDirDocumentStore::new(args.data_dir.join("sessions"))),
        config,
    );

    let learner = repl::Learner {
        activity: args.activity,
        user: args.user,
        session: args.session,
        name: args.name,
    };
    repl::run(&engine, &learner).await
}
