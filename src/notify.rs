//! Operator-facing events. Delivery is fire-and-forget: a sink must never
//! block or fail the caller.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::sla::BreachKind;
use crate::types::Priority;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    SlaBreached {
        ticket_id: i64,
        timer_id: i64,
        kind: BreachKind,
        due_at: i64,
        effective_due_at: i64,
        breached_at: i64,
    },
    NoSlaPolicy {
        ticket_id: i64,
        priority: Priority,
    },
    MailboxDeactivated {
        mailbox_id: i64,
        reason: String,
    },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: Event);
}

/// Default sink: events go to the operational log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: Event) {
        match event {
            Event::SlaBreached {
                ticket_id,
                timer_id,
                kind,
                due_at,
                effective_due_at,
                breached_at,
            } => warn!(
                ticket = ticket_id,
                timer = timer_id,
                kind = kind.as_str(),
                due_at,
                effective_due_at,
                breached_at,
                "SLA breached"
            ),
            Event::NoSlaPolicy {
                ticket_id,
                priority,
            } => warn!(
                ticket = ticket_id,
                priority = %priority,
                "Ticket created without SLA timer: no active policy"
            ),
            Event::MailboxDeactivated { mailbox_id, reason } => {
                info!(mailbox = mailbox_id, reason = %reason, "Mailbox polling deactivated")
            }
        }
    }
}

/// Forwards events into a channel, for embedding and tests.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: Event) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}
