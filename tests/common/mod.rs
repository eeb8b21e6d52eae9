#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use deskpoll::config::AppDefaults;
use deskpoll::errors::{AppError, AppResult};
use deskpoll::ingest::IngestPipeline;
use deskpoll::notify::{ChannelSink, Event, NotificationSink};
use deskpoll::sla::SlaEngine;
use deskpoll::source::{FetchBatch, MailSource, SourceRegistry};
use deskpoll::storage::Database;
use deskpoll::types::{Cursor, Mailbox, MailboxKind, NormalizedMessage};

pub const T0: i64 = 1_709_287_200;

/// In-memory mail source replaying queued responses in order.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<VecDeque<AppResult<FetchBatch>>>,
    calls: AtomicUsize,
    /// When set, each fetch signals `entered` and waits on `release`.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let source = Self {
            gate: Some((entered.clone(), release.clone())),
            ..Self::default()
        };
        (source, entered, release)
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_batch(&self, messages: Vec<NormalizedMessage>, cursor: &str) {
        self.push(Ok(FetchBatch {
            messages,
            cursor: Cursor::new(cursor),
        }));
    }

    pub fn push(&self, response: AppResult<FetchBatch>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailSource for ScriptedSource {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Imap
    }

    async fn fetch_since(
        &self,
        _mailbox: &Mailbox,
        cursor: Option<&Cursor>,
        _limit: usize,
    ) -> AppResult<FetchBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(FetchBatch {
                messages: Vec::new(),
                cursor: cursor.cloned().unwrap_or_else(|| Cursor::new("0")),
            })
        })
    }
}

pub struct Harness {
    _dir: tempfile::TempDir,
    pub db: Arc<Database>,
    pub sla: Arc<SlaEngine>,
    pub pipeline: Arc<IngestPipeline>,
    pub source: Arc<ScriptedSource>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub defaults: AppDefaults,
}

impl Harness {
    pub async fn new(source: ScriptedSource) -> Self {
        Self::with_defaults(source, AppDefaults::default()).await
    }

    pub async fn with_defaults(source: ScriptedSource, defaults: AppDefaults) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("deskpoll.db")).await.unwrap());
        let (sink, events) = ChannelSink::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(sink);
        let sla = Arc::new(SlaEngine::new(db.clone(), notifier));
        let source = Arc::new(source);
        let sources = SourceRegistry::new().with(source.clone());
        let pipeline = Arc::new(IngestPipeline::new(db.clone(), sources, sla.clone(), &defaults));
        Self {
            _dir: dir,
            db,
            sla,
            pipeline,
            source,
            events,
            defaults,
        }
    }

    pub async fn add_mailbox(&self, polling_interval_secs: i64) -> Mailbox {
        let id = self
            .db
            .insert_mailbox(
                MailboxKind::Imap,
                "support@example.com",
                polling_interval_secs,
                &serde_json::json!({ "host": "imap.example.com" }),
            )
            .await
            .unwrap();
        self.mailbox(id).await
    }

    pub async fn mailbox(&self, id: i64) -> Mailbox {
        self.db.get_mailbox(id).await.unwrap().unwrap()
    }

    /// Runs raw SQL against the store, e.g. to install a failure trigger.
    pub async fn exec(&self, sql: &str) {
        sqlx::query(sql).execute(self.db.pool()).await.unwrap();
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A customer email; its Message-ID is `<external_id>@mail.test`.
pub fn inbound(external_id: &str, from: &str, received_at: i64) -> NormalizedMessage {
    NormalizedMessage {
        external_id: external_id.to_string(),
        message_id: Some(message_id(external_id)),
        from_address: from.to_string(),
        from_name: None,
        subject: format!("Help with {external_id}"),
        body_text: format!("Body of {external_id}"),
        body_html: None,
        received_at,
        attachments: Vec::new(),
        in_reply_to: None,
        references: Vec::new(),
    }
}

pub fn reply_to(
    external_id: &str,
    from: &str,
    parent_external_id: &str,
    received_at: i64,
) -> NormalizedMessage {
    NormalizedMessage {
        in_reply_to: Some(message_id(parent_external_id)),
        references: vec![message_id(parent_external_id)],
        subject: format!("Re: Help with {parent_external_id}"),
        ..inbound(external_id, from, received_at)
    }
}

pub fn message_id(external_id: &str) -> String {
    format!("{external_id}@mail.test")
}

pub fn config_invalid(reason: &str) -> AppResult<FetchBatch> {
    Err(AppError::SourceConfigInvalid(reason.to_string()))
}

pub fn unavailable(reason: &str) -> AppResult<FetchBatch> {
    Err(AppError::SourceUnavailable(reason.to_string()))
}
