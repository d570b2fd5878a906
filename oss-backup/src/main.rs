//! oss-backup - Main entry point
//!
//! Snapshot and filesystem backups shipped to object storage.

use anyhow::{bail, Context, Result};
use clap::Parser;
use oss_backup::cli::{Cli, Command};
use oss_backup::config::{self, FileConfig, Resolver};
use oss_backup::executor::Pipeline;
use oss_backup::snapshot::{ConsulSource, EtcdSource};
use oss_backup::transfer::{ip, BucketStore, HttpIpResolver, Timestamp};
use oss_backup::utils;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment snapshot first, so every later lookup sees .env values
    let (env, env_file) = config::load_env(cli.global.env_file.as_deref());
    let file = match &cli.global.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let resolver = Resolver::new(&env, &file);

    let log_level = resolver.log_level(cli.global.log_level.as_deref());
    utils::logger::init(&log_level)?;

    tracing::info!("Starting oss-backup v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    let settings = resolver.settings(&cli.global)?;
    let store = BucketStore::from_settings(&settings.oss)?;
    let ip_resolver = HttpIpResolver::new(ip::DEFAULT_TIMEOUT)
        .context("building public IP client")?;

    let pipeline = Pipeline::new(
        Arc::new(store),
        Arc::new(ip_resolver),
        settings.oss.prefix.clone(),
        settings.work_dir.clone(),
    );
    let stamp = Timestamp::now();
    let codec = settings.codec;

    tracing::info!(
        codec = %codec,
        bucket = %settings.oss.bucket,
        work_dir = %settings.work_dir.display(),
        "Configuration resolved"
    );

    match &cli.command {
        Command::Dir(args) => {
            let dirs = resolver.dir(args)?;
            let summary = pipeline.run_directories(&dirs, codec, &stamp).await?;
            if !summary.is_success() {
                bail!("no directory was backed up ({})", summary);
            }
        }
        Command::File(args) => {
            let files = resolver.file(args)?;
            let summary = pipeline.run_files(&files, codec, &stamp).await?;
            if !summary.is_success() {
                bail!("file backup failed ({})", summary);
            }
        }
        Command::Etcd(args) => {
            let source = EtcdSource::new(&resolver.etcd(args)?)?;
            let report = pipeline.run_snapshot(&source, codec, &stamp).await?;
            tracing::info!(key = %report.key, position = ?report.position, "etcd backup complete");
        }
        Command::Consul(args) => {
            let source = ConsulSource::new(&resolver.consul(args)?)?;
            let report = pipeline.run_snapshot(&source, codec, &stamp).await?;
            tracing::info!(key = %report.key, position = ?report.position, "Consul backup complete");
        }
    }

    Ok(())
}
