use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::policy;
use super::timer::{BreachKind, SlaTimer};
use crate::errors::AppError;
use crate::notify::{Event, NotificationSink};
use crate::storage::{tickets, timers, Database};
use crate::types::{MessageKind, NewMessage, Ticket, TicketStatus};

/// Outcome of starting the clock for a new ticket.
#[derive(Clone, Debug)]
pub enum TimerStart {
    Started(SlaTimer),
    /// No policy for the ticket's priority; the ticket runs without SLA.
    NoPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub breaches: Vec<(i64, BreachKind)>,
    pub conflicts: usize,
    pub errors: usize,
}

pub struct SlaEngine {
    db: Arc<Database>,
    notifier: Arc<dyn NotificationSink>,
}

impl SlaEngine {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { db, notifier }
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.notifier
    }

    /// Creates the timer for a freshly inserted ticket inside the caller's
    /// transaction. A missing policy degrades to `TimerStart::NoPolicy`.
    pub async fn start_timer(
        &self,
        conn: &mut SqliteConnection,
        ticket: &Ticket,
        now: i64,
    ) -> Result<TimerStart> {
        match policy::resolve(conn, ticket.priority).await {
            Ok(policy) => {
                let timer = timers::insert(conn, &SlaTimer::start(ticket.id, &policy, now)).await?;
                debug!(
                    ticket = ticket.id,
                    policy = policy.id,
                    first_response_due_at = timer.first_response_due_at,
                    resolution_due_at = timer.resolution_due_at,
                    "SLA timer started"
                );
                Ok(TimerStart::Started(timer))
            }
            Err(e) => {
                if let Some(AppError::NoPolicyForPriority(priority)) = e.downcast_ref::<AppError>() {
                    warn!(ticket = ticket.id, priority = %priority, "No SLA policy for priority");
                    return Ok(TimerStart::NoPolicy);
                }
                Err(e)
            }
        }
    }

    /// Pause/resume and resolution stamping for a status transition. Must run
    /// in the same transaction as the ticket status write.
    pub async fn apply_status_change(
        &self,
        conn: &mut SqliteConnection,
        ticket_id: i64,
        old: TicketStatus,
        new: TicketStatus,
        now: i64,
    ) -> Result<Option<SlaTimer>> {
        mutate_timer(conn, ticket_id, |timer| {
            let paused = timer.on_status_change(old, new, now);
            let resolved = new.is_resolution() && timer.on_resolution(now);
            paused || resolved
        })
        .await
    }

    /// Stamps first response when `message` is an agent reply.
    pub async fn apply_message(
        &self,
        conn: &mut SqliteConnection,
        ticket_id: i64,
        message: &NewMessage,
    ) -> Result<Option<SlaTimer>> {
        if message.kind != MessageKind::Reply || !message.sender.is_agent() {
            return Ok(None);
        }
        mutate_timer(conn, ticket_id, |timer| timer.on_agent_reply(message.created_at)).await
    }

    /// Status change entry point for callers outside the ingestion path.
    pub async fn change_status(
        &self,
        ticket_id: i64,
        new_status: TicketStatus,
        now: i64,
    ) -> Result<Ticket> {
        let mut tx = self.db.begin().await?;
        let mut ticket = tickets::get_for_update(&mut tx, ticket_id)
            .await?
            .ok_or_else(|| anyhow!("ticket {ticket_id} not found"))?;

        if ticket.status != new_status {
            tickets::set_status(&mut tx, ticket_id, new_status).await?;
            self.apply_status_change(&mut tx, ticket_id, ticket.status, new_status, now)
                .await?;
            info!(
                ticket = ticket_id,
                from = ticket.status.as_str(),
                to = new_status.as_str(),
                "Ticket status changed"
            );
            ticket.status = new_status;
        }

        tx.commit().await.context("committing status change")?;
        Ok(ticket)
    }

    /// Appends a message written by an agent or customer outside ingestion.
    pub async fn record_message(&self, ticket_id: i64, message: NewMessage) -> Result<i64> {
        let mut tx = self.db.begin().await?;
        tickets::get_for_update(&mut tx, ticket_id)
            .await?
            .ok_or_else(|| anyhow!("ticket {ticket_id} not found"))?;

        let message_id = tickets::insert_message(&mut tx, ticket_id, &message).await?;
        tickets::touch_activity(&mut tx, ticket_id, message.created_at).await?;
        self.apply_message(&mut tx, ticket_id, &message).await?;

        tx.commit().await.context("committing message")?;
        Ok(message_id)
    }

    /// One global pass over every unresolved timer. Per-timer failures are
    /// logged and counted; the pass always continues.
    pub async fn sweep_breaches(&self, now: i64) -> Result<SweepReport> {
        let start = Instant::now();
        let pending = {
            let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
            timers::list_unresolved(&mut conn).await?
        };

        let mut report = SweepReport {
            examined: pending.len(),
            ..Default::default()
        };

        for timer in pending {
            let timer_id = timer.id;
            match self.sweep_one(timer, now).await {
                Ok(Some((timer, latched))) => {
                    for kind in latched {
                        report.breaches.push((timer.ticket_id, kind));
                        self.notifier.notify(Event::SlaBreached {
                            ticket_id: timer.ticket_id,
                            timer_id: timer.id,
                            kind,
                            due_at: timer.due_at(kind),
                            effective_due_at: timer.due_at(kind) + timer.pause_offset(now),
                            breached_at: now,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => match e.downcast_ref::<AppError>() {
                    Some(AppError::TimerWriteConflict(_)) => {
                        warn!(timer = timer_id, "Timer kept changing during sweep; skipping");
                        report.conflicts += 1;
                    }
                    _ => {
                        warn!(timer = timer_id, error = %e, "Breach evaluation failed");
                        report.errors += 1;
                    }
                },
            }
        }

        info!(
            examined = report.examined,
            breaches = report.breaches.len(),
            conflicts = report.conflicts,
            errors = report.errors,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Breach sweep completed"
        );
        Ok(report)
    }

    async fn sweep_one(
        &self,
        mut timer: SlaTimer,
        now: i64,
    ) -> Result<Option<(SlaTimer, Vec<BreachKind>)>> {
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;

        for attempt in 0..2 {
            let mut next = timer.clone();
            let latched = next.evaluate_breaches(now);
            if latched.is_empty() {
                return Ok(None);
            }
            if timers::update_versioned(&mut conn, &next).await? {
                next.version += 1;
                return Ok(Some((next, latched)));
            }

            debug!(timer = timer.id, attempt, "Timer write conflict; reloading");
            timer = match timers::get(&mut conn, timer.id).await? {
                Some(fresh) => fresh,
                None => return Ok(None),
            };
        }

        Err(AppError::TimerWriteConflict(timer.id).into())
    }
}

/// Read-modify-write of a ticket's timer under its version token, retried
/// once on conflict. Tickets without a timer are a no-op.
async fn mutate_timer<F>(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    apply: F,
) -> Result<Option<SlaTimer>>
where
    F: Fn(&mut SlaTimer) -> bool,
{
    for _ in 0..2 {
        let Some(mut timer) = timers::get_for_ticket(conn, ticket_id).await? else {
            return Ok(None);
        };
        if !apply(&mut timer) {
            return Ok(Some(timer));
        }
        if timers::update_versioned(conn, &timer).await? {
            timer.version += 1;
            return Ok(Some(timer));
        }
        debug!(ticket = ticket_id, timer = timer.id, "Timer write conflict; retrying");
    }

    let timer_id = timers::get_for_ticket(conn, ticket_id)
        .await?
        .map(|t| t.id)
        .unwrap_or_default();
    Err(AppError::TimerWriteConflict(timer_id).into())
}
