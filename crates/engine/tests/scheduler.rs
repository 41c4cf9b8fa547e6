//! Cron templates firing through `ServiceScheduler`.

mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{test_config, Harness};
use pipewright_core::error::CoreError;
use pipewright_db::models::scheduled::NewScheduledService;
use pipewright_db::models::search::{ServicePattern, TimeRange};
use pipewright_db::store::ScheduledServiceStore;
use pipewright_engine::EngineError;

async fn submitted(h: &Harness) -> i64 {
    h.engine
        .count_services(&ServicePattern::named("echo"), &TimeRange::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn due_template_fires_once() {
    let h = Harness::new(test_config(0));
    let template = h
        .store
        .create_scheduled(NewScheduledService::new("nightly", "echo", "0 3 * * *"), None)
        .await
        .unwrap();

    let now = Utc::now();
    let fired = h.engine.scheduler().tick(now).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].name, "echo");

    let advanced = h.store.find_scheduled(template.id).await.unwrap().unwrap();
    assert_eq!(advanced.last_start_time, Some(now));
    assert!(advanced.next_start_time.unwrap() > now);

    assert!(h.engine.scheduler().tick(now).await.unwrap().is_empty());
    assert_eq!(submitted(&h).await, 1);
}

#[tokio::test]
async fn concurrent_ticks_submit_a_firing_once() {
    let h = Harness::new(test_config(0));
    h.store
        .create_scheduled(NewScheduledService::new("hourly", "echo", "0 * * * *"), None)
        .await
        .unwrap();

    let now = Utc::now();
    let first = h.engine.scheduler().clone();
    let second = h.engine.scheduler().clone();
    let (a, b) = tokio::join!(first.tick(now), second.tick(now));

    assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
    assert_eq!(submitted(&h).await, 1);
}

#[tokio::test]
async fn disabled_template_is_skipped() {
    let h = Harness::new(test_config(0));
    let mut template = NewScheduledService::new("paused", "echo", "* * * * *");
    template.disabled = true;
    let template = h.store.create_scheduled(template, None).await.unwrap();

    assert!(h.engine.scheduler().tick(Utc::now()).await.unwrap().is_empty());

    h.engine
        .scheduler()
        .set_disabled(template.id, false)
        .await
        .unwrap();
    assert_eq!(h.engine.scheduler().tick(Utc::now()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn create_checks_cron_and_processor() {
    let h = Harness::new(test_config(0));

    let err = h
        .engine
        .scheduler()
        .create(NewScheduledService::new("bad", "echo", "61 * * * *"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = h
        .engine
        .scheduler()
        .create(NewScheduledService::new("bad", "missing", "0 * * * *"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let created = h
        .engine
        .scheduler()
        .create(NewScheduledService::new("good", "echo", "0 * * * *"))
        .await
        .unwrap();
    assert!(created.next_start_time.unwrap() > Utc::now());
    assert!(h.engine.scheduler().tick(Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn toggling_a_missing_template_is_not_found() {
    let h = Harness::new(test_config(0));
    assert_matches!(
        h.engine.scheduler().set_disabled(42, true).await,
        Err(EngineError::Core(CoreError::NotFound {
            entity: "ScheduledService",
            id: 42
        }))
    );
}
