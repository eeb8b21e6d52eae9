use deskpoll::sla::{BreachKind, SlaTimer};
use deskpoll::types::{Priority, SlaPolicy, TicketStatus};

const T0: i64 = 1_700_000_000;
const HOUR: i64 = 3600;

fn policy(first_response_hours: i64, resolution_hours: i64) -> SlaPolicy {
    SlaPolicy {
        id: 1,
        name: "high".to_string(),
        priority: Priority::High,
        first_response_hours,
        resolution_hours,
        active: true,
    }
}

#[test]
fn due_gap_matches_policy_regardless_of_start() {
    for (fr, res) in [(1, 8), (4, 24), (0, 2), (12, 12)] {
        for start in [0, T0, T0 + 12_345] {
            let timer = SlaTimer::start(7, &policy(fr, res), start);
            assert_eq!(
                timer.resolution_due_at - timer.first_response_due_at,
                (res - fr) * HOUR
            );
        }
    }
}

#[test]
fn pause_shifts_effective_due_by_paused_duration() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    let paused_for = 2_700;

    assert!(timer.on_status_change(TicketStatus::Open, TicketStatus::Pending, T0 + 100));
    assert!(timer.is_paused());
    assert!(timer.on_status_change(
        TicketStatus::Pending,
        TicketStatus::Open,
        T0 + 100 + paused_for
    ));

    assert_eq!(timer.total_paused_seconds, paused_for);
    assert_eq!(timer.first_response_due_at, T0 + HOUR);
    assert_eq!(timer.resolution_due_at, T0 + 8 * HOUR);
    let later = T0 + 10 * HOUR;
    assert_eq!(timer.effective_first_response_due(later), T0 + HOUR + paused_for);
    assert_eq!(timer.effective_resolution_due(later), T0 + 8 * HOUR + paused_for);
}

#[test]
fn paused_to_paused_and_active_to_active_are_noops() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    assert!(!timer.on_status_change(TicketStatus::Open, TicketStatus::Resolved, T0 + 10));

    timer.on_status_change(TicketStatus::Open, TicketStatus::Pending, T0 + 20);
    assert!(!timer.on_status_change(TicketStatus::Pending, TicketStatus::OnHold, T0 + 50));
    assert_eq!(timer.paused_at, Some(T0 + 20));
    assert_eq!(timer.total_paused_seconds, 0);
}

#[test]
fn running_pause_counts_toward_effective_due() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    timer.on_status_change(TicketStatus::Open, TicketStatus::OnHold, T0 + 30 * 60);

    // Still on hold two hours in: the first-response deadline keeps moving.
    assert!(timer.evaluate_breaches(T0 + 2 * HOUR).is_empty());
    assert_eq!(
        timer.effective_first_response_due(T0 + 2 * HOUR),
        T0 + HOUR + 90 * 60
    );
}

#[test]
fn on_hold_scenario_breaches_only_after_shifted_deadline() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    assert_eq!(timer.first_response_due_at, T0 + HOUR);
    assert_eq!(timer.resolution_due_at, T0 + 8 * HOUR);

    timer.on_status_change(TicketStatus::Open, TicketStatus::OnHold, T0 + 30 * 60);
    timer.on_status_change(TicketStatus::OnHold, TicketStatus::Open, T0 + 2 * HOUR);
    assert_eq!(timer.total_paused_seconds, 90 * 60);

    assert!(timer.evaluate_breaches(T0 + 2 * HOUR + 10 * 60).is_empty());
    assert!(!timer.first_response_breached);

    assert_eq!(
        timer.evaluate_breaches(T0 + 3 * HOUR),
        vec![BreachKind::FirstResponse]
    );
    assert!(timer.first_response_breached);
    assert!(!timer.resolution_breached);
}

#[test]
fn milestones_are_set_once() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    assert!(timer.on_agent_reply(T0 + 60));
    assert!(!timer.on_agent_reply(T0 + 120));
    assert_eq!(timer.first_responded_at, Some(T0 + 60));

    assert!(timer.on_resolution(T0 + 600));
    assert!(!timer.on_resolution(T0 + 900));
    assert_eq!(timer.resolved_at, Some(T0 + 600));
}

#[test]
fn breach_flags_never_reset() {
    let mut timer = SlaTimer::start(1, &policy(1, 2), T0);
    let latched = timer.evaluate_breaches(T0 + 3 * HOUR);
    assert_eq!(latched, vec![BreachKind::FirstResponse, BreachKind::Resolution]);

    // Nothing that happens afterwards clears a latched flag.
    timer.on_agent_reply(T0 + 4 * HOUR);
    timer.on_status_change(TicketStatus::Open, TicketStatus::Pending, T0 + 4 * HOUR);
    timer.on_status_change(TicketStatus::Pending, TicketStatus::Open, T0 + 40 * HOUR);
    timer.on_resolution(T0 + 41 * HOUR);
    assert!(timer.evaluate_breaches(T0 + 42 * HOUR).is_empty());
    assert!(timer.first_response_breached);
    assert!(timer.resolution_breached);
}

#[test]
fn met_milestones_never_breach() {
    let mut timer = SlaTimer::start(1, &policy(1, 8), T0);
    timer.on_agent_reply(T0 + 30 * 60);
    timer.on_resolution(T0 + 2 * HOUR);
    assert!(timer.evaluate_breaches(T0 + 100 * HOUR).is_empty());
}
