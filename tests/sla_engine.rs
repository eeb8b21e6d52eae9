mod common;

use std::sync::Arc;

use common::*;
use deskpoll::notify::Event;
use deskpoll::sla::{BreachKind, TimerStart};
use deskpoll::storage::tickets::{self, NewTicket};
use deskpoll::storage::timers;
use deskpoll::types::{MessageKind, NewMessage, Priority, Sender, TicketStatus};

const HOUR: i64 = 3600;

async fn high_priority_ticket(h: &Harness, created_at: i64) -> i64 {
    let mut tx = h.db.begin().await.unwrap();
    let customer_id = tickets::get_or_create_customer(&mut tx, "carol@customer.test", None)
        .await
        .unwrap();
    let ticket = tickets::insert(
        &mut tx,
        NewTicket {
            subject: "Printer on fire",
            priority: Priority::High,
            customer_id,
            mailbox_id: None,
            created_at,
        },
    )
    .await
    .unwrap();
    let start = h.sla.start_timer(&mut tx, &ticket, created_at).await.unwrap();
    assert!(matches!(start, TimerStart::Started(_)));
    tx.commit().await.unwrap();
    ticket.id
}

fn agent_reply(user_id: i64, kind: MessageKind, at: i64) -> NewMessage {
    NewMessage {
        sender: Sender::User(user_id),
        kind,
        body_text: "On it".to_string(),
        body_html: None,
        created_at: at,
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn on_hold_pause_defers_first_response_breach() {
    let mut h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let policy = h.db.get_active_policy_for_priority(Priority::High).await.unwrap().unwrap();
    assert_eq!((policy.first_response_hours, policy.resolution_hours), (1, 8));
    let ticket_id = high_priority_ticket(&h, T0).await;

    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert_eq!(timer.first_response_due_at, T0 + HOUR);
    assert_eq!(timer.resolution_due_at, T0 + 8 * HOUR);

    h.sla
        .change_status(ticket_id, TicketStatus::OnHold, T0 + HOUR / 2)
        .await
        .unwrap();
    h.sla
        .change_status(ticket_id, TicketStatus::Open, T0 + 2 * HOUR)
        .await
        .unwrap();

    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert_eq!(timer.total_paused_seconds, 90 * 60);
    assert_eq!(timer.paused_at, None);

    let report = h.sla.sweep_breaches(T0 + 2 * HOUR + 10 * 60).await.unwrap();
    assert!(report.breaches.is_empty());
    assert!(
        !h.db
            .get_timer_for_ticket(ticket_id)
            .await
            .unwrap()
            .unwrap()
            .first_response_breached
    );

    let report = h.sla.sweep_breaches(T0 + 3 * HOUR).await.unwrap();
    assert_eq!(report.breaches, vec![(ticket_id, BreachKind::FirstResponse)]);
    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert!(timer.first_response_breached);
    assert!(!timer.resolution_breached);

    assert_eq!(
        h.drain_events(),
        vec![Event::SlaBreached {
            ticket_id,
            timer_id: timer.id,
            kind: BreachKind::FirstResponse,
            due_at: T0 + HOUR,
            effective_due_at: T0 + HOUR + 90 * 60,
            breached_at: T0 + 3 * HOUR,
        }]
    );

    // Already latched: a later sweep reports nothing new.
    let report = h.sla.sweep_breaches(T0 + 4 * HOUR).await.unwrap();
    assert!(report.breaches.is_empty());
}

#[tokio::test]
async fn only_agent_replies_stamp_first_response() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let agent = h.db.insert_user("dave@support.test", None).await.unwrap();
    let ticket_id = high_priority_ticket(&h, T0).await;

    h.sla
        .record_message(ticket_id, agent_reply(agent, MessageKind::InternalNote, T0 + 60))
        .await
        .unwrap();
    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert_eq!(timer.first_responded_at, None);

    h.sla
        .record_message(ticket_id, agent_reply(agent, MessageKind::Reply, T0 + 120))
        .await
        .unwrap();
    h.sla
        .record_message(ticket_id, agent_reply(agent, MessageKind::Reply, T0 + 240))
        .await
        .unwrap();
    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert_eq!(timer.first_responded_at, Some(T0 + 120));
    assert_eq!(h.db.list_messages(ticket_id).await.unwrap().len(), 3);

    let report = h.sla.sweep_breaches(T0 + 2 * HOUR).await.unwrap();
    assert!(report.breaches.is_empty());
}

#[tokio::test]
async fn resolution_stamps_once_and_leaves_the_sweep() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let ticket_id = high_priority_ticket(&h, T0).await;

    h.sla
        .change_status(ticket_id, TicketStatus::Resolved, T0 + 600)
        .await
        .unwrap();
    h.sla
        .change_status(ticket_id, TicketStatus::Closed, T0 + 900)
        .await
        .unwrap();

    let timer = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();
    assert_eq!(timer.resolved_at, Some(T0 + 600));

    let report = h.sla.sweep_breaches(T0 + 100 * HOUR).await.unwrap();
    assert_eq!(report.examined, 0);
    assert!(report.breaches.is_empty());
}

#[tokio::test]
async fn stale_timer_write_is_rejected_and_flags_stay_latched() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let ticket_id = high_priority_ticket(&h, T0).await;
    let stale = h.db.get_timer_for_ticket(ticket_id).await.unwrap().unwrap();

    h.sla.sweep_breaches(T0 + 2 * HOUR).await.unwrap();

    let mut conn = h.db.pool().acquire().await.unwrap();
    let mut paused = stale.clone();
    paused.paused_at = Some(T0 + 2 * HOUR);
    assert!(!timers::update_versioned(&mut conn, &paused).await.unwrap());

    // Even a writer holding the current version cannot clear a breach.
    let mut fresh = timers::get_for_ticket(&mut conn, ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert!(fresh.first_response_breached);
    fresh.first_response_breached = false;
    assert!(timers::update_versioned(&mut conn, &fresh).await.unwrap());

    let reloaded = timers::get_for_ticket(&mut conn, ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.first_response_breached);
    assert_eq!(reloaded.version, fresh.version + 1);
}

#[tokio::test]
async fn ticket_without_policy_gets_no_timer() {
    let h = Harness::new(ScriptedSource::new()).await;
    let mut tx = h.db.begin().await.unwrap();
    let customer_id = tickets::get_or_create_customer(&mut tx, "erin@customer.test", None)
        .await
        .unwrap();
    let ticket = tickets::insert(
        &mut tx,
        NewTicket {
            subject: "No policy",
            priority: Priority::Urgent,
            customer_id,
            mailbox_id: None,
            created_at: T0,
        },
    )
    .await
    .unwrap();
    let start = h.sla.start_timer(&mut tx, &ticket, T0).await.unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(start, TimerStart::NoPolicy));
    assert!(h.db.get_timer_for_ticket(ticket.id).await.unwrap().is_none());

    // Status changes on a timerless ticket still go through.
    let ticket = h
        .sla
        .change_status(ticket.id, TicketStatus::Pending, T0 + 60)
        .await
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Pending);
}

#[tokio::test]
async fn sweep_reevaluates_a_timer_that_changed_underneath_it() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let first = high_priority_ticket(&h, T0).await;
    let moved = high_priority_ticket(&h, T0).await;
    let last = high_priority_ticket(&h, T0).await;

    // Writing the first timer pauses the second one for two hours behind
    // the sweep's back, so its listed snapshot goes stale.
    h.exec(&format!(
        "CREATE TRIGGER shift_second AFTER UPDATE ON sla_timers WHEN NEW.ticket_id = {first}
         BEGIN
           UPDATE sla_timers SET total_paused_seconds = 7200, version = version + 1
           WHERE ticket_id = {moved};
         END;"
    ))
    .await;

    let report = h.sla.sweep_breaches(T0 + 2 * HOUR).await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(
        report.breaches,
        vec![(first, BreachKind::FirstResponse), (last, BreachKind::FirstResponse)]
    );
    assert_eq!((report.conflicts, report.errors), (0, 0));

    let shifted = h.db.get_timer_for_ticket(moved).await.unwrap().unwrap();
    assert!(!shifted.first_response_breached);
    assert_eq!(shifted.total_paused_seconds, 7200);
}

#[tokio::test]
async fn sweep_counts_a_persistent_conflict_and_moves_on() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let first = high_priority_ticket(&h, T0).await;
    let contested = high_priority_ticket(&h, T0).await;
    let last = high_priority_ticket(&h, T0).await;

    // Every write to the contested timer is dropped, as if another writer
    // always got there first.
    h.exec(&format!(
        "CREATE TRIGGER drop_contested BEFORE UPDATE ON sla_timers WHEN OLD.ticket_id = {contested}
         BEGIN SELECT RAISE(IGNORE); END;"
    ))
    .await;

    let report = h.sla.sweep_breaches(T0 + 2 * HOUR).await.unwrap();
    assert_eq!(
        report.breaches,
        vec![(first, BreachKind::FirstResponse), (last, BreachKind::FirstResponse)]
    );
    assert_eq!((report.conflicts, report.errors), (1, 0));
    let contested = h.db.get_timer_for_ticket(contested).await.unwrap().unwrap();
    assert!(!contested.first_response_breached);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_changes_survive_concurrent_writers() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.db.insert_policy("high", Priority::High, 1, 8).await.unwrap();
    let agent = h.db.insert_user("dave@support.test", None).await.unwrap();
    let toggled = high_priority_ticket(&h, T0).await;
    let chatty = high_priority_ticket(&h, T0).await;
    for _ in 0..4 {
        high_priority_ticket(&h, T0).await;
    }

    let sla = Arc::clone(&h.sla);
    let statuses = tokio::spawn(async move {
        for i in 0..200 {
            let status = if i % 2 == 0 { TicketStatus::OnHold } else { TicketStatus::Open };
            sla.change_status(toggled, status, T0 + i).await?;
        }
        anyhow::Ok(())
    });
    let sla = Arc::clone(&h.sla);
    let messages = tokio::spawn(async move {
        for i in 0..100 {
            sla.record_message(chatty, agent_reply(agent, MessageKind::Reply, T0 + i))
                .await?;
        }
        anyhow::Ok(())
    });
    let sla = Arc::clone(&h.sla);
    let sweeps = tokio::spawn(async move {
        for i in 0..50 {
            let report = sla.sweep_breaches(T0 + 2 * HOUR + i).await?;
            assert_eq!(report.errors, 0);
        }
        anyhow::Ok(())
    });

    statuses.await.unwrap().unwrap();
    messages.await.unwrap().unwrap();
    sweeps.await.unwrap().unwrap();

    let ticket = h.db.get_ticket(toggled).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Open);
    let timer = h.db.get_timer_for_ticket(toggled).await.unwrap().unwrap();
    assert_eq!(timer.paused_at, None);
    assert_eq!(h.db.list_messages(chatty).await.unwrap().len(), 100);
}
