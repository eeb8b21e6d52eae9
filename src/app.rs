use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::AppDefaults;
use crate::ingest::IngestPipeline;
use crate::notify::{LogSink, NotificationSink};
use crate::oauth::TokenCache;
use crate::scheduler::Scheduler;
use crate::sla::SlaEngine;
use crate::source::gmail::GmailSource;
use crate::source::imap::ImapSource;
use crate::source::microsoft::MicrosoftSource;
use crate::source::SourceRegistry;
use crate::storage::Database;
use crate::types::now_ts;

pub async fn run(cli: Cli) -> Result<()> {
    let defaults = AppDefaults::load(cli.config.as_deref())?;
    let db = Arc::new(Database::new_default(defaults.data_dir.as_deref()).await?);
    info!(path = %db.path().display(), "Using SQLite store");

    let notifier: Arc<dyn NotificationSink> = Arc::new(LogSink);
    let sla = Arc::new(SlaEngine::new(db.clone(), notifier));

    if cli.sweep_now {
        let report = sla.sweep_breaches(now_ts()).await?;
        info!(
            examined = report.examined,
            breaches = report.breaches.len(),
            "One-off breach sweep finished"
        );
        return Ok(());
    }

    let tokens = Arc::new(TokenCache::new());
    let sources = SourceRegistry::new()
        .with(Arc::new(ImapSource))
        .with(Arc::new(GmailSource::new(tokens.clone())))
        .with(Arc::new(MicrosoftSource::new(tokens)));
    let pipeline = Arc::new(IngestPipeline::new(db.clone(), sources, sla.clone(), &defaults));

    let mut scheduler = Scheduler::new(db.clone(), pipeline, sla, &defaults);
    if cli.no_ingest {
        info!("Mailbox polling disabled; running breach sweeps only");
        scheduler = scheduler.without_ingest();
    }

    let active = db.list_active_mailboxes().await?;
    if active.is_empty() && !cli.no_ingest {
        warn!("No active mailboxes configured; only breach sweeps will run");
    }

    if cli.once {
        let report = scheduler.tick(now_ts()).await?;
        scheduler.drain().await;
        info!(
            dispatched = report.dispatched.len(),
            sweep = report.sweep_started,
            "Single tick finished"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Listening for ctrl-c failed");
            return;
        }
        info!("Shutdown requested");
        trigger.cancel();
    });

    scheduler.run(shutdown).await
}
