//! `rkv-server` binary: serve an in-memory row store over TCP.
//!
//! ```text
//! rkv-server --listen 127.0.0.1:9090 --table users=d,inc --table events=d
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rkv_engine::{MemoryEngine, RowEngine};

#[derive(Debug, Parser)]
#[command(name = "rkv-server", about = "In-memory row store speaking the RowKV protocol")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1:9090")]
    listen: String,

    /// Table to create on startup, as `name=family,family`.
    #[arg(long = "table", value_parser = parse_table)]
    tables: Vec<(String, Vec<String>)>,
}

fn parse_table(raw: &str) -> Result<(String, Vec<String>), String> {
    let (name, families) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=family,family, got {raw}"))?;
    let families: Vec<String> = families
        .split(',')
        .map(str::trim)
        .filter(|family| !family.is_empty())
        .map(str::to_string)
        .collect();
    if name.is_empty() || families.is_empty() {
        return Err(format!("table needs a name and at least one family: {raw}"));
    }
    Ok((name.to_string(), families))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let engine = MemoryEngine::new();
    for (table, families) in &args.tables {
        engine
            .create_table(table, families)
            .with_context(|| format!("creating table {table}"))?;
        info!(table = %table, families = ?families, "table ready");
    }

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    tokio::select! {
        result = rkv_server::serve(listener, Arc::new(engine)) => result.context("server loop failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
