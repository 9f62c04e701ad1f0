//! Ingest files into an agent's knowledge store
//!
//! Run with: cargo run -p agent-rag --features cli --bin agent-rag-ingest -- --agent <uuid> FILE...

use std::path::PathBuf;
use std::sync::Arc;

use agent_rag::{AddKnowledgeRequest, KnowledgeConfig, RagService, SqliteConnector};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "agent-rag-ingest", version, about = "Ingest documents for an agent")]
struct Args {
    /// Agent that owns the documents
    #[arg(long)]
    agent: Uuid,

    /// Tenant / world the documents belong to (defaults to the agent ID)
    #[arg(long)]
    tenant: Option<Uuid>,

    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Embedded store data directory (overrides the config file)
    #[arg(long, conflicts_with = "database_url")]
    data_dir: Option<PathBuf>,

    /// Remote store connection string, e.g. sqlite:///srv/knowledge.db
    #[arg(long)]
    database_url: Option<String>,

    /// Files to ingest
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_rag=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => KnowledgeConfig::load(path)?,
        None => {
            let mut config = KnowledgeConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    config.store.apply_overrides(
        args.data_dir.as_deref().and_then(|p| p.to_str()),
        args.database_url.as_deref(),
    );

    let service = RagService::connect(config, Arc::new(SqliteConnector::new()))
        .await
        .context("failed to open knowledge store")?;

    let tenant_id = args.tenant.unwrap_or(args.agent);
    let mut failures = 0usize;

    for path in &args.files {
        let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let request = AddKnowledgeRequest {
            correlation_id: Uuid::new_v4(),
            data,
            content_type,
            filename: filename.clone(),
            tenant_id,
        };

        match service.ingest(args.agent, request).await {
            Ok(store_id) => println!("{}\t{}", store_id, filename),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", filename, e);
            }
        }
    }

    service.stop().await;

    if failures > 0 {
        anyhow::bail!("{} of {} files failed", failures, args.files.len());
    }
    Ok(())
}
