//! Periodic driver for mailbox polls and the breach sweep.
//!
//! Every tick decides which mailboxes are due and hands them to a bounded
//! worker pool. A mailbox with a poll still in flight is skipped, never
//! queued.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppDefaults;
use crate::ingest::IngestPipeline;
use crate::sla::SlaEngine;
use crate::storage::Database;
use crate::types::now_ts;

#[derive(Clone, Copy, Debug, Default)]
struct MailboxSlot {
    last_run: Option<i64>,
    in_flight: bool,
}

type Slots = Arc<Mutex<HashMap<i64, MailboxSlot>>>;

/// What a single tick set in motion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<i64>,
    pub skipped_in_flight: Vec<i64>,
    pub sweep_started: bool,
}

pub struct Scheduler {
    db: Arc<Database>,
    pipeline: Arc<IngestPipeline>,
    sla: Arc<SlaEngine>,
    ingest_enabled: bool,
    tick_interval: Duration,
    sweep_interval_secs: i64,
    permits: Arc<Semaphore>,
    slots: Slots,
    sweep_running: Arc<AtomicBool>,
    last_sweep: Mutex<Option<i64>>,
    jobs: AsyncMutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        pipeline: Arc<IngestPipeline>,
        sla: Arc<SlaEngine>,
        defaults: &AppDefaults,
    ) -> Self {
        Self {
            db,
            pipeline,
            sla,
            ingest_enabled: true,
            tick_interval: Duration::from_secs(defaults.tick_secs.max(1)),
            sweep_interval_secs: defaults.sweep_interval_secs as i64,
            permits: Arc::new(Semaphore::new(defaults.max_concurrent_polls.max(1))),
            slots: Arc::new(Mutex::new(HashMap::new())),
            sweep_running: Arc::new(AtomicBool::new(false)),
            last_sweep: Mutex::new(None),
            jobs: AsyncMutex::new(JoinSet::new()),
        }
    }

    /// Breach sweeps only.
    pub fn without_ingest(mut self) -> Self {
        self.ingest_enabled = false;
        self
    }

    pub async fn tick(&self, now: i64) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut jobs = self.jobs.lock().await;
        reap_finished(&mut jobs);

        if self.ingest_enabled {
            let mailboxes = self.db.list_active_mailboxes().await?;
            let due = {
                let mut slots = lock_slots(&self.slots);
                let active: HashSet<i64> = mailboxes.iter().map(|m| m.id).collect();
                // Deactivated mailboxes drop out once their last poll ends.
                slots.retain(|id, slot| slot.in_flight || active.contains(id));

                let mut due = Vec::new();
                for mailbox in mailboxes {
                    let slot = slots.entry(mailbox.id).or_insert_with(|| MailboxSlot {
                        last_run: mailbox.last_checked_at,
                        in_flight: false,
                    });
                    let elapsed = slot.last_run.map(|last| now - last);
                    if matches!(elapsed, Some(secs) if secs < mailbox.polling_interval_secs) {
                        continue;
                    }
                    if slot.in_flight {
                        debug!(mailbox = mailbox.id, "Previous poll still running; skipping tick");
                        report.skipped_in_flight.push(mailbox.id);
                        continue;
                    }
                    slot.in_flight = true;
                    slot.last_run = Some(now);
                    due.push(mailbox);
                }
                due
            };

            for mailbox in due {
                report.dispatched.push(mailbox.id);
                let guard = SlotGuard {
                    slots: self.slots.clone(),
                    mailbox_id: mailbox.id,
                };
                let permits = self.permits.clone();
                let pipeline = self.pipeline.clone();
                jobs.spawn(async move {
                    let _guard = guard;
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = pipeline.poll_mailbox(&mailbox, now).await {
                        warn!(mailbox = mailbox.id, error = %format!("{e:#}"), "Mailbox poll failed");
                    }
                });
            }
        }

        if self.sweep_due(now) {
            if self
                .sweep_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *lock_or_recover(&self.last_sweep) = Some(now);
                report.sweep_started = true;
                let guard = FlagGuard(self.sweep_running.clone());
                let sla = self.sla.clone();
                jobs.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = sla.sweep_breaches(now).await {
                        warn!(error = %format!("{e:#}"), "Breach sweep failed");
                    }
                });
            } else {
                debug!("Previous breach sweep still running; skipping");
            }
        }

        Ok(report)
    }

    fn sweep_due(&self, now: i64) -> bool {
        match *lock_or_recover(&self.last_sweep) {
            Some(last) => now - last >= self.sweep_interval_secs,
            None => true,
        }
    }

    /// Waits for every dispatched job to finish.
    pub async fn drain(&self) {
        let mut jobs = self.jobs.lock().await;
        while let Some(res) = jobs.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Scheduled job panicked");
            }
        }
    }

    /// Ticks until `shutdown` fires, then waits for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_secs = self.tick_interval.as_secs(),
            sweep_interval_secs = self.sweep_interval_secs,
            ingest = self.ingest_enabled,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(now_ts()).await {
                        Ok(report) if !report.dispatched.is_empty() || report.sweep_started => {
                            debug!(
                                dispatched = report.dispatched.len(),
                                skipped = report.skipped_in_flight.len(),
                                sweep = report.sweep_started,
                                "Tick dispatched jobs"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %format!("{e:#}"), "Scheduler tick failed"),
                    }
                }
            }
        }

        info!("Scheduler stopping; waiting for in-flight jobs");
        self.drain().await;
        Ok(())
    }
}

fn reap_finished(jobs: &mut JoinSet<()>) {
    while let Some(res) = jobs.try_join_next() {
        if let Err(e) = res {
            warn!(error = %e, "Scheduled job panicked");
        }
    }
}

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<i64, MailboxSlot>> {
    lock_or_recover(&**slots)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight mark when a poll job ends, panics included.
struct SlotGuard {
    slots: Slots,
    mailbox_id: i64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.mailbox_id) {
            slot.in_flight = false;
        }
    }
}

struct FlagGuard(Arc<AtomicBool>);

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
