mod common;

use common::*;
use deskpoll::scheduler::Scheduler;

fn scheduler(h: &Harness) -> Scheduler {
    Scheduler::new(h.db.clone(), h.pipeline.clone(), h.sla.clone(), &h.defaults)
}

#[tokio::test]
async fn overlapping_tick_for_same_mailbox_is_skipped() {
    let (source, entered, release) = ScriptedSource::gated();
    let h = Harness::new(source).await;
    let mailbox = h.add_mailbox(60).await;
    let scheduler = scheduler(&h);

    let first = scheduler.tick(T0).await.unwrap();
    assert_eq!(first.dispatched, vec![mailbox.id]);
    entered.notified().await;

    // Due again, but the first poll is still blocked in the fetch.
    let second = scheduler.tick(T0 + 120).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped_in_flight, vec![mailbox.id]);

    release.notify_one();
    scheduler.drain().await;
    assert_eq!(h.source.calls(), 1);
}

#[tokio::test]
async fn mailbox_waits_for_its_polling_interval() {
    let h = Harness::new(ScriptedSource::new()).await;
    let mailbox = h.add_mailbox(300).await;
    let scheduler = scheduler(&h);

    assert_eq!(scheduler.tick(T0).await.unwrap().dispatched, vec![mailbox.id]);
    scheduler.drain().await;

    let early = scheduler.tick(T0 + 299).await.unwrap();
    assert!(early.dispatched.is_empty());
    assert!(early.skipped_in_flight.is_empty());

    assert_eq!(
        scheduler.tick(T0 + 300).await.unwrap().dispatched,
        vec![mailbox.id]
    );
    scheduler.drain().await;
    assert_eq!(h.source.calls(), 2);
}

#[tokio::test]
async fn deactivated_mailbox_is_no_longer_polled() {
    let h = Harness::new(ScriptedSource::new()).await;
    let mailbox = h.add_mailbox(60).await;
    h.source.push(config_invalid("mailbox does not exist"));
    let scheduler = scheduler(&h);

    scheduler.tick(T0).await.unwrap();
    scheduler.drain().await;
    assert!(!h.mailbox(mailbox.id).await.active);

    for offset in [60, 3600, 86_400] {
        let report = scheduler.tick(T0 + offset).await.unwrap();
        assert!(report.dispatched.is_empty());
    }
    scheduler.drain().await;
    assert_eq!(h.source.calls(), 1);
}

#[tokio::test]
async fn unavailable_mailbox_is_retried_next_interval() {
    let h = Harness::new(ScriptedSource::new()).await;
    let mailbox = h.add_mailbox(60).await;
    h.source.push(unavailable("timeout"));
    let scheduler = scheduler(&h);

    scheduler.tick(T0).await.unwrap();
    scheduler.drain().await;
    assert!(h.mailbox(mailbox.id).await.active);

    assert_eq!(
        scheduler.tick(T0 + 60).await.unwrap().dispatched,
        vec![mailbox.id]
    );
    scheduler.drain().await;
    assert_eq!(h.source.calls(), 2);
}

#[tokio::test]
async fn breach_sweep_follows_its_own_interval() {
    let h = Harness::new(ScriptedSource::new()).await;
    let scheduler = scheduler(&h).without_ingest();
    let sweep_every = h.defaults.sweep_interval_secs as i64;

    assert!(scheduler.tick(T0).await.unwrap().sweep_started);
    scheduler.drain().await;
    assert!(!scheduler.tick(T0 + 1).await.unwrap().sweep_started);
    assert!(scheduler.tick(T0 + sweep_every).await.unwrap().sweep_started);
    scheduler.drain().await;
}

#[tokio::test]
async fn ingest_disabled_never_fetches() {
    let h = Harness::new(ScriptedSource::new()).await;
    h.add_mailbox(60).await;
    let scheduler = scheduler(&h).without_ingest();

    let report = scheduler.tick(T0).await.unwrap();
    assert!(report.dispatched.is_empty());
    scheduler.drain().await;
    assert_eq!(h.source.calls(), 0);
}
