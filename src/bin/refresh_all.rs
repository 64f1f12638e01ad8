#![forbid(unsafe_code)]

//! Reconciles every tracked channel in turn. Meant to run from cron.
//!
//! Runs inline without the worker pool; nothing is downloaded.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use ytgrab::{
    config::{RuntimeOverrides, resolve_runtime_config},
    logging,
    model::Channel,
    reconcile::Reconciler,
    service::ServiceRegistry,
    store::RecordStore,
};

#[derive(Debug, Parser)]
#[command(name = "refresh_all", about = "Record new videos for every tracked channel")]
struct RefreshArgs {
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl RefreshArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            ytdlp: self.ytdlp,
            env_path: self.env_file,
            ..RuntimeOverrides::default()
        }
    }
}

#[derive(Debug, Default)]
struct RefreshReport {
    created: Vec<(String, usize)>,
    failed: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("refresh_all");
    let config = resolve_runtime_config(RefreshArgs::parse().into_overrides())?;
    let store = Arc::new(
        RecordStore::open(&config.database_path())
            .await
            .context("opening record store")?,
    );
    let services = Arc::new(ServiceRegistry::with_ytdlp(&config.ytdlp));
    let channels = store.list_channels().await?;
    let reconciler = Reconciler::new(store, services);

    let report = refresh_channels(&reconciler, &channels).await;
    for (label, created) in &report.created {
        println!("{label}: {created} new video(s)");
    }
    for (label, reason) in &report.failed {
        eprintln!("{label}: failed: {reason}");
    }
    if !report.failed.is_empty() {
        bail!(
            "{} of {} channel(s) failed to refresh",
            report.failed.len(),
            channels.len()
        );
    }
    Ok(())
}

async fn refresh_channels(reconciler: &Reconciler, channels: &[Channel]) -> RefreshReport {
    let mut report = RefreshReport::default();
    for channel in channels {
        let label = format!("{}/{}", channel.service, channel.chanid);
        match reconciler.reconcile(channel).await {
            Ok(created) => report.created.push((label, created)),
            Err(err) => report.failed.push((label, err.to_string())),
        }
    }
    report
}
