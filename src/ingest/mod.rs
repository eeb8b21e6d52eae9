//! One poll of one mailbox: fetch, dedup, thread, persist, advance cursor.
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::config::AppDefaults;
use crate::errors::AppError;
use crate::notify::{Event, NotificationSink};
use crate::sla::{SlaEngine, TimerStart};
use crate::source::{FetchBatch, SourceRegistry};
use crate::storage::tickets::{self, NewTicket};
use crate::storage::Database;
use crate::types::{
    Mailbox, MessageKind, NewMessage, NormalizedMessage, Priority, Sender, Ticket, TicketStatus,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { ticket_id: i64 },
    Appended { ticket_id: i64, reopened: bool },
    /// Already ingested from this mailbox.
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Batch processed; the cursor moved if every message was written.
    Ingested { cursor_advanced: bool },
    /// Transient failure; nothing changed.
    Unavailable(String),
    /// Permanent failure; the mailbox was deactivated.
    Deactivated(String),
    /// The mailbox was deactivated while the fetch was in flight.
    Discarded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollReport {
    pub mailbox_id: i64,
    pub fetched: usize,
    pub created: usize,
    pub appended: usize,
    pub reopened: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub outcome: PollOutcome,
}

impl PollReport {
    fn new(mailbox_id: i64, outcome: PollOutcome) -> Self {
        Self {
            mailbox_id,
            fetched: 0,
            created: 0,
            appended: 0,
            reopened: 0,
            duplicates: 0,
            failed: 0,
            outcome,
        }
    }

    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Created { .. } => self.created += 1,
            IngestOutcome::Appended { reopened, .. } => {
                self.appended += 1;
                if reopened {
                    self.reopened += 1;
                }
            }
            IngestOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

pub struct IngestPipeline {
    db: Arc<Database>,
    sources: SourceRegistry,
    sla: Arc<SlaEngine>,
    fetch_timeout: Duration,
    batch_limit: usize,
    default_priority: Priority,
}

impl IngestPipeline {
    pub fn new(
        db: Arc<Database>,
        sources: SourceRegistry,
        sla: Arc<SlaEngine>,
        defaults: &AppDefaults,
    ) -> Self {
        Self {
            db,
            sources,
            sla,
            fetch_timeout: defaults.fetch_timeout(),
            batch_limit: defaults.batch_limit,
            default_priority: defaults.default_priority,
        }
    }

    fn notifier(&self) -> &Arc<dyn NotificationSink> {
        self.sla.notifier()
    }

    /// Polls `mailbox` once. Source failures are reported in the outcome;
    /// only store failures outside per-message processing are errors.
    pub async fn poll_mailbox(&self, mailbox: &Mailbox, now: i64) -> Result<PollReport> {
        let start = Instant::now();

        let batch = match self.fetch(mailbox).await {
            Ok(batch) => batch,
            Err(e) => return self.handle_fetch_error(mailbox, e).await,
        };

        if !self.db.is_mailbox_active(mailbox.id).await? {
            info!(
                mailbox = mailbox.id,
                fetched = batch.messages.len(),
                "Mailbox deactivated during fetch; discarding results"
            );
            return Ok(PollReport::new(mailbox.id, PollOutcome::Discarded));
        }

        let mut report = PollReport::new(
            mailbox.id,
            PollOutcome::Ingested {
                cursor_advanced: false,
            },
        );
        report.fetched = batch.messages.len();

        for message in &batch.messages {
            match self.ingest_one(mailbox, message, now).await {
                Ok(outcome) => {
                    debug!(mailbox = mailbox.id, external_id = %message.external_id, ?outcome, "Message ingested");
                    report.record(outcome);
                }
                Err(e) => {
                    warn!(
                        mailbox = mailbox.id,
                        external_id = %message.external_id,
                        error = %format!("{e:#}"),
                        "Failed to ingest message"
                    );
                    report.failed += 1;
                }
            }
        }

        // A failed message keeps the old cursor so the next poll retries it;
        // dedup skips everything that already made it in.
        let mut cursor_advanced = false;
        if report.failed == 0 {
            cursor_advanced = self
                .db
                .update_cursor(mailbox.id, &batch.cursor, now)
                .await
                .context("advancing mailbox cursor")?;
            if !cursor_advanced {
                info!(mailbox = mailbox.id, "Mailbox deactivated mid-poll; cursor left in place");
            }
        }
        report.outcome = PollOutcome::Ingested { cursor_advanced };

        info!(
            mailbox = mailbox.id,
            kind = %mailbox.kind,
            fetched = report.fetched,
            created = report.created,
            appended = report.appended,
            duplicates = report.duplicates,
            failed = report.failed,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Mailbox poll completed"
        );
        Ok(report)
    }

    async fn fetch(&self, mailbox: &Mailbox) -> Result<FetchBatch, AppError> {
        let source = self.sources.for_mailbox(mailbox)?;
        let fetch = source.fetch_since(mailbox, mailbox.cursor.as_ref(), self.batch_limit);
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(AppError::SourceUnavailable(format!(
                "fetch timed out after {}s",
                self.fetch_timeout.as_secs()
            ))),
        }
    }

    async fn handle_fetch_error(&self, mailbox: &Mailbox, err: AppError) -> Result<PollReport> {
        match err {
            AppError::SourceConfigInvalid(reason) => {
                warn!(mailbox = mailbox.id, address = %mailbox.address, reason = %reason, "Deactivating misconfigured mailbox");
                self.db
                    .deactivate_mailbox(mailbox.id, &reason)
                    .await
                    .context("deactivating mailbox")?;
                self.notifier().notify(Event::MailboxDeactivated {
                    mailbox_id: mailbox.id,
                    reason: reason.clone(),
                });
                Ok(PollReport::new(mailbox.id, PollOutcome::Deactivated(reason)))
            }
            other => {
                warn!(mailbox = mailbox.id, address = %mailbox.address, error = %other, "Mail source unavailable; retrying next tick");
                Ok(PollReport::new(
                    mailbox.id,
                    PollOutcome::Unavailable(other.to_string()),
                ))
            }
        }
    }

    /// Writes one inbound message. Dedup claim, ticket, timer and message
    /// commit together or not at all.
    pub async fn ingest_one(
        &self,
        mailbox: &Mailbox,
        message: &NormalizedMessage,
        now: i64,
    ) -> Result<IngestOutcome> {
        let mut tx = self.db.begin().await?;

        if !tickets::claim_external_id(&mut tx, mailbox.id, &message.external_id).await? {
            return Ok(IngestOutcome::Duplicate);
        }

        let mut pending_event = None;
        let outcome = match find_thread(&mut tx, message).await? {
            Some(ticket) => self.append_reply(&mut tx, mailbox, ticket, message, now).await?,
            None => {
                let (outcome, event) = self.open_ticket(&mut tx, mailbox, message, now).await?;
                pending_event = event;
                outcome
            }
        };

        tx.commit().await.context("committing ingested message")?;

        if let Some(event) = pending_event {
            self.notifier().notify(event);
        }
        Ok(outcome)
    }

    async fn append_reply(
        &self,
        conn: &mut SqliteConnection,
        mailbox: &Mailbox,
        ticket: Ticket,
        message: &NormalizedMessage,
        now: i64,
    ) -> Result<IngestOutcome> {
        let sender = match tickets::find_user_by_email(conn, &message.from_address).await? {
            Some(user_id) => Sender::User(user_id),
            None => Sender::Customer(
                tickets::get_or_create_customer(
                    conn,
                    &message.from_address,
                    message.from_name.as_deref(),
                )
                .await?,
            ),
        };

        let reopened = ticket.status == TicketStatus::Closed;
        if reopened {
            tickets::set_status(conn, ticket.id, TicketStatus::Open).await?;
            self.sla
                .apply_status_change(conn, ticket.id, TicketStatus::Closed, TicketStatus::Open, now)
                .await?;
            info!(ticket = ticket.id, "Closed ticket reopened by inbound reply");
        }

        let reply = reply_from(sender, message);
        let message_id = tickets::insert_message(conn, ticket.id, &reply).await?;
        tickets::touch_activity(conn, ticket.id, message.received_at).await?;
        self.sla.apply_message(conn, ticket.id, &reply).await?;
        tickets::register_thread_key(conn, message.thread_key(), ticket.id).await?;
        tickets::link_external_id(conn, mailbox.id, &message.external_id, message_id).await?;

        Ok(IngestOutcome::Appended {
            ticket_id: ticket.id,
            reopened,
        })
    }

    async fn open_ticket(
        &self,
        conn: &mut SqliteConnection,
        mailbox: &Mailbox,
        message: &NormalizedMessage,
        now: i64,
    ) -> Result<(IngestOutcome, Option<Event>)> {
        let customer_id = tickets::get_or_create_customer(
            conn,
            &message.from_address,
            message.from_name.as_deref(),
        )
        .await?;

        let ticket = tickets::insert(
            conn,
            NewTicket {
                subject: &message.subject,
                priority: self.default_priority,
                customer_id,
                mailbox_id: Some(mailbox.id),
                created_at: now,
            },
        )
        .await?;

        let event = match self.sla.start_timer(conn, &ticket, now).await? {
            TimerStart::Started(_) => None,
            TimerStart::NoPolicy => Some(Event::NoSlaPolicy {
                ticket_id: ticket.id,
                priority: ticket.priority,
            }),
        };

        let first = reply_from(Sender::Customer(customer_id), message);
        let message_id = tickets::insert_message(conn, ticket.id, &first).await?;
        tickets::touch_activity(conn, ticket.id, message.received_at).await?;
        tickets::register_thread_key(conn, message.thread_key(), ticket.id).await?;
        tickets::link_external_id(conn, mailbox.id, &message.external_id, message_id).await?;

        info!(
            ticket = ticket.id,
            mailbox = mailbox.id,
            priority = %ticket.priority,
            "Ticket created from inbound mail"
        );
        Ok((IngestOutcome::Created { ticket_id: ticket.id }, event))
    }
}

async fn find_thread(
    conn: &mut SqliteConnection,
    message: &NormalizedMessage,
) -> Result<Option<Ticket>> {
    for key in message.parent_keys() {
        if let Some(ticket) = tickets::find_by_thread_key(conn, key).await? {
            return Ok(Some(ticket));
        }
    }
    Ok(None)
}

fn reply_from(sender: Sender, message: &NormalizedMessage) -> NewMessage {
    NewMessage {
        sender,
        kind: MessageKind::Reply,
        body_text: message.body_text.clone(),
        body_html: message.body_html.clone(),
        created_at: message.received_at,
        attachments: message.attachments.clone(),
    }
}
