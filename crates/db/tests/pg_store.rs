//! `PgStore` against a real database. Run with `DATABASE_URL` set and
//! `cargo test -- --ignored`.

use assert_matches::assert_matches;
use pipewright_core::lifecycle::EVENT_QUEUED;
use pipewright_core::scheduling::ServiceState;
use pipewright_db::models::scheduled::NewScheduledService;
use pipewright_db::models::service::{
    ClaimRequest, NewService, ServiceEvent, ServiceRecord, StateChange,
};
use pipewright_db::store::{ScheduledServiceStore, ServiceStore, WorkflowStore};
use pipewright_db::PgStore;
use sqlx::PgPool;

async fn queued(store: &PgStore, new: NewService) -> ServiceRecord {
    let record = store.save_hierarchy(new).await.unwrap();
    store
        .update_state(
            record.id(),
            StateChange::guarded(ServiceState::Queued)
                .with_event(ServiceEvent::new(EVENT_QUEUED, "queued")),
        )
        .await
        .unwrap()
        .unwrap()
}

fn claim(limit: usize) -> ClaimRequest {
    ClaimRequest::new("q1", ServiceState::CLAIMABLE, limit)
}

// -- claiming ---

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_takes_highest_priority_first(pool: PgPool) {
    let store = PgStore::new(pool);
    let low = queued(&store, NewService::new("echo").with_priority(1)).await;
    let high = queued(&store, NewService::new("echo").with_priority(9)).await;
    let mid = queued(&store, NewService::new("echo").with_priority(5)).await;

    let claimed = store.claim_by_queue_and_state(&claim(2)).await.unwrap();
    let ids: Vec<_> = claimed.iter().map(|c| c.service.id()).collect();
    assert_eq!(ids, vec![high.id(), mid.id()]);
    for c in &claimed {
        assert_eq!(c.previous_state, ServiceState::Queued);
        assert_eq!(c.service.state, ServiceState::Dispatched);
        assert_eq!(c.service.queue_id.as_deref(), Some("q1"));
    }

    let rest = store.claim_by_queue_and_state(&claim(2)).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].service.id(), low.id());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_are_disjoint(pool: PgPool) {
    let store = PgStore::new(pool);
    for _ in 0..6 {
        queued(&store, NewService::new("echo")).await;
    }

    let request = claim(4);
    let (a, b) = tokio::join!(
        store.claim_by_queue_and_state(&request),
        store.claim_by_queue_and_state(&request),
    );
    let mut ids: Vec<_> = a
        .unwrap()
        .into_iter()
        .chain(b.unwrap())
        .map(|c| c.service.id())
        .collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert!(total <= 6);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn unfinished_dependency_blocks_claim(pool: PgPool) {
    let store = PgStore::new(pool);
    let a = queued(&store, NewService::new("echo")).await;
    let b = queued(
        &store,
        NewService::new("echo").depends_on(a.id()).with_priority(10),
    )
    .await;

    let claimed = store.claim_by_queue_and_state(&claim(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].service.id(), a.id());

    store
        .update_state(a.id(), StateChange::forced(ServiceState::Successful))
        .await
        .unwrap()
        .unwrap();
    let claimed = store.claim_by_queue_and_state(&claim(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].service.id(), b.id());
}

// -- state changes ---

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn state_change_is_conditional(pool: PgPool) {
    let store = PgStore::new(pool);
    let a = queued(&store, NewService::new("echo")).await;

    let missed = store
        .update_state(
            a.id(),
            StateChange::from_states(&[ServiceState::Running], ServiceState::Successful),
        )
        .await
        .unwrap();
    assert!(missed.is_none());

    let canceled = store
        .update_state(a.id(), StateChange::forced(ServiceState::Canceled))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canceled.state, ServiceState::Canceled);
    assert_matches!(
        store
            .update_state(a.id(), StateChange::forced(ServiceState::Queued))
            .await,
        Ok(None)
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn resume_restarts_the_processing_clock(pool: PgPool) {
    let store = PgStore::new(pool);
    let a = queued(&store, NewService::new("echo")).await;
    let running = store
        .update_state(a.id(), StateChange::forced(ServiceState::Running))
        .await
        .unwrap()
        .unwrap();
    let first_start = running.process_started_at.unwrap();

    let suspended = store
        .update_state(a.id(), StateChange::forced(ServiceState::Suspended))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suspended.process_started_at, Some(first_start));

    let resumed = store
        .update_state(a.id(), StateChange::forced(ServiceState::Resumed))
        .await
        .unwrap()
        .unwrap();
    assert!(resumed.process_started_at.is_none());

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let rerun = store
        .update_state(a.id(), StateChange::forced(ServiceState::Running))
        .await
        .unwrap()
        .unwrap();
    assert!(rerun.process_started_at.unwrap() > first_start);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn result_is_written_only_with_the_transition(pool: PgPool) {
    let store = PgStore::new(pool);
    let a = queued(&store, NewService::new("echo")).await;
    store
        .update_state(a.id(), StateChange::forced(ServiceState::Timeout))
        .await
        .unwrap()
        .unwrap();

    let late = store
        .update_state(
            a.id(),
            StateChange::from_states(ServiceState::IN_FLIGHT, ServiceState::Successful)
                .with_result(serde_json::json!({ "late": true })),
        )
        .await
        .unwrap();
    assert!(late.is_none());
    assert!(store.find_by_id(a.id()).await.unwrap().unwrap().result.is_none());
}

// -- locks and schedules ---

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn workflow_lock_has_one_holder(pool: PgPool) {
    let store = PgStore::new(pool);
    assert!(store.try_lock("build:t1", "service:1").await.unwrap());
    assert!(!store.try_lock("build:t1", "service:2").await.unwrap());
    assert!(!store.unlock("build:t1", "service:2").await.unwrap());
    assert!(store.unlock("build:t1", "service:1").await.unwrap());
    assert!(store.try_lock("build:t1", "service:2").await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn schedule_advances_once_per_firing(pool: PgPool) {
    let store = PgStore::new(pool);
    let template = store
        .create_scheduled(NewScheduledService::new("nightly", "echo", "0 3 * * *"), None)
        .await
        .unwrap();

    let now = chrono::Utc::now();
    assert_eq!(store.list_due(now, 10).await.unwrap().len(), 1);

    let next = Some(now + chrono::Duration::hours(1));
    assert!(store
        .advance_schedule(template.id, None, now, next)
        .await
        .unwrap());
    assert!(!store
        .advance_schedule(template.id, None, now, next)
        .await
        .unwrap());
    assert!(store.list_due(now, 10).await.unwrap().is_empty());
}
