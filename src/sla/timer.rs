//! Per-ticket SLA clock.
//!
//! All transitions are pure: the engine loads a timer, applies one of these
//! methods and writes it back under a version check.

use crate::types::{SlaPolicy, TicketStatus};

const SECS_PER_HOUR: i64 = 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreachKind {
    FirstResponse,
    Resolution,
}

impl BreachKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BreachKind::FirstResponse => "first_response",
            BreachKind::Resolution => "resolution",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaTimer {
    pub id: i64,
    pub ticket_id: i64,
    pub policy_id: i64,
    pub first_response_due_at: i64,
    pub first_responded_at: Option<i64>,
    pub resolution_due_at: i64,
    pub resolved_at: Option<i64>,
    /// Set exactly while the ticket sits in a paused status.
    pub paused_at: Option<i64>,
    pub total_paused_seconds: i64,
    pub first_response_breached: bool,
    pub resolution_breached: bool,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
}

impl SlaTimer {
    /// A fresh, unsaved timer. Due dates are fixed here and never recomputed.
    pub fn start(ticket_id: i64, policy: &SlaPolicy, now: i64) -> Self {
        Self {
            id: 0,
            ticket_id,
            policy_id: policy.id,
            first_response_due_at: now + policy.first_response_hours * SECS_PER_HOUR,
            first_responded_at: None,
            resolution_due_at: now + policy.resolution_hours * SECS_PER_HOUR,
            resolved_at: None,
            paused_at: None,
            total_paused_seconds: 0,
            first_response_breached: false,
            resolution_breached: false,
            version: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Returns true when the timer changed.
    pub fn on_status_change(&mut self, old: TicketStatus, new: TicketStatus, now: i64) -> bool {
        match (old.is_paused(), new.is_paused()) {
            (false, true) if self.paused_at.is_none() => {
                self.paused_at = Some(now);
                true
            }
            (true, false) => match self.paused_at.take() {
                Some(paused_at) => {
                    self.total_paused_seconds += (now - paused_at).max(0);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn on_agent_reply(&mut self, now: i64) -> bool {
        if self.first_responded_at.is_some() {
            return false;
        }
        self.first_responded_at = Some(now);
        true
    }

    pub fn on_resolution(&mut self, now: i64) -> bool {
        if self.resolved_at.is_some() {
            return false;
        }
        self.resolved_at = Some(now);
        true
    }

    /// Accumulated pause plus the still-running pause, if any.
    pub fn pause_offset(&self, now: i64) -> i64 {
        let running = self.paused_at.map(|p| (now - p).max(0)).unwrap_or(0);
        self.total_paused_seconds + running
    }

    pub fn effective_first_response_due(&self, now: i64) -> i64 {
        self.first_response_due_at + self.pause_offset(now)
    }

    pub fn effective_resolution_due(&self, now: i64) -> i64 {
        self.resolution_due_at + self.pause_offset(now)
    }

    /// Latches any newly exceeded deadline and returns what was latched.
    /// Flags only ever go from false to true.
    pub fn evaluate_breaches(&mut self, now: i64) -> Vec<BreachKind> {
        let mut latched = Vec::new();

        if !self.first_response_breached
            && self.first_responded_at.is_none()
            && now > self.effective_first_response_due(now)
        {
            self.first_response_breached = true;
            latched.push(BreachKind::FirstResponse);
        }

        if !self.resolution_breached
            && self.resolved_at.is_none()
            && now > self.effective_resolution_due(now)
        {
            self.resolution_breached = true;
            latched.push(BreachKind::Resolution);
        }

        latched
    }

    pub fn due_at(&self, kind: BreachKind) -> i64 {
        match kind {
            BreachKind::FirstResponse => self.first_response_due_at,
            BreachKind::Resolution => self.resolution_due_at,
        }
    }
}
