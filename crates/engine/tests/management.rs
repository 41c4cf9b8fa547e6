//! Operator operations of `ServiceEngine`.

mod common;

use assert_matches::assert_matches;
use common::{test_config, Harness};
use pipewright_core::lifecycle::{
    LifecycleStage, EVENT_DEPENDENCY_FAILED, EVENT_RESUME, EVENT_SUSPEND, EVENT_UPDATE_PRIORITY,
    MSG_KILLED_BY_DEPENDENCY_CANCELLATION,
};
use pipewright_core::scheduling::ServiceState;
use pipewright_db::models::search::{PageRequest, ServicePattern, TimeRange};
use pipewright_db::models::service::{NewService, NotificationConfig, NotificationSettings};
use pipewright_db::store::NotificationStore;
use pipewright_engine::EngineError;

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn multiple_services_form_a_prioritized_chain() {
    let h = Harness::new(test_config(0));
    let records = h
        .engine
        .submit_multiple_services(vec![
            NewService::new("echo"),
            NewService::new("echo").with_priority(5),
            NewService::new("echo"),
        ])
        .await
        .unwrap();

    let priorities: Vec<i32> = records.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![6, 5, 0]);
    assert!(records[0].dependencies.is_empty());
    assert!(records[1].dependencies.contains(&records[0].id()));
    assert!(records[2].dependencies.contains(&records[1].id()));
}

#[tokio::test]
async fn invalid_batch_persists_nothing() {
    let h = Harness::new(test_config(0));
    let err = h
        .engine
        .submit_multiple_services(vec![NewService::new("echo"), NewService::new("nope")])
        .await
        .unwrap_err();

    assert!(err.is_validation());
    let total = h
        .engine
        .count_services(&ServicePattern::default(), &TimeRange::default())
        .await
        .unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn waiting_limit_defers_new_roots() {
    let mut config = test_config(0);
    config.max_waiting_slots = 1;
    let h = Harness::new(config);

    let first = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    let second = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();

    assert_eq!(first.state, ServiceState::Queued);
    assert_eq!(second.state, ServiceState::Created);
    let stats = h.engine.get_server_stats().await.unwrap();
    assert_eq!(stats.waiting_count, 1);
    assert_eq!(stats.waiting_capacity, Some(0));

    h.engine.set_max_waiting_slots(0);
    h.engine.dispatcher().run_cycle().await.unwrap();
    assert_eq!(h.get(second.id()).await.state, ServiceState::Queued);
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_update_shifts_the_hierarchy() {
    let h = Harness::new(test_config(0));
    let parent = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    let child = h
        .engine
        .submitter()
        .submit_child(&parent, NewService::new("echo"))
        .await
        .unwrap();
    let gap = child.priority - parent.priority;
    assert!(gap > 0);

    let updated = h
        .engine
        .update_service_priority(parent.id(), parent.priority + 10)
        .await
        .unwrap();

    assert_eq!(updated.len(), 2);
    let parent = h.get(parent.id()).await;
    let child = h.get(child.id()).await;
    assert_eq!(parent.priority, 10);
    assert_eq!(child.priority - parent.priority, gap);
    assert_eq!(child.last_event().unwrap().kind, EVENT_UPDATE_PRIORITY);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_cascades_through_dependents() {
    let h = Harness::new(test_config(0));
    let a = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    let b = h
        .engine
        .submit_single_service(NewService::new("echo").depends_on(a.id()))
        .await
        .unwrap();
    let c = h
        .engine
        .submit_single_service(NewService::new("echo").depends_on(b.id()))
        .await
        .unwrap();
    let d = h
        .engine
        .submit_single_service(
            NewService::new("echo")
                .depends_on(a.id())
                .mark_force_independent(),
        )
        .await
        .unwrap();

    let canceled = h
        .engine
        .update_service_state(a.id(), ServiceState::Canceled, false)
        .await
        .unwrap();
    assert_eq!(canceled.state, ServiceState::Canceled);

    for id in [b.id(), c.id()] {
        let record = h.get(id).await;
        assert_eq!(record.state, ServiceState::Error);
        let event = record.last_event().unwrap();
        assert_eq!(event.kind, EVENT_DEPENDENCY_FAILED);
        assert_eq!(event.message, MSG_KILLED_BY_DEPENDENCY_CANCELLATION);
    }
    assert_eq!(h.get(d.id()).await.state, ServiceState::Queued);
}

#[tokio::test]
async fn terminal_records_never_change() {
    let h = Harness::new(test_config(0));
    let a = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    h.engine
        .update_service_state(a.id(), ServiceState::Canceled, false)
        .await
        .unwrap();

    let err = h
        .engine
        .update_service_state(a.id(), ServiceState::Queued, true)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::InvalidTransition {
            from: ServiceState::Canceled,
            to: ServiceState::Queued
        }
    );
}

#[tokio::test]
async fn disallowed_edge_needs_force() {
    let h = Harness::new(test_config(0));
    let a = h.engine.submit_single_service(NewService::new("echo")).await.unwrap();

    assert_matches!(
        h.engine
            .update_service_state(a.id(), ServiceState::Successful, false)
            .await,
        Err(EngineError::InvalidTransition { .. })
    );
    let forced = h
        .engine
        .update_service_state(a.id(), ServiceState::Successful, true)
        .await
        .unwrap();
    assert_eq!(forced.state, ServiceState::Successful);
}

#[tokio::test]
async fn suspend_and_resume_apply_to_the_hierarchy() {
    let h = Harness::new(test_config(0)).start();
    let notify = NotificationSettings::default().with_default(NotificationConfig::new("job"));
    let parent = h
        .engine
        .submit_single_service(NewService::new("echo").with_notifications(notify))
        .await
        .unwrap();
    let child = h
        .engine
        .submitter()
        .submit_child(&parent, NewService::new("echo"))
        .await
        .unwrap();
    h.wait_for_state(child.id(), ServiceState::Successful).await;

    h.engine
        .update_service_state(parent.id(), ServiceState::Suspended, false)
        .await
        .unwrap();
    let suspended = h.get(parent.id()).await;
    assert_eq!(suspended.state, ServiceState::Suspended);
    assert_eq!(suspended.last_event().unwrap().kind, EVENT_SUSPEND);

    h.engine
        .update_service_state(parent.id(), ServiceState::Resumed, false)
        .await
        .unwrap();
    assert_eq!(
        h.get(parent.id()).await.last_event().unwrap().kind,
        EVENT_RESUME
    );

    h.engine.set_processing_slots_count(1);
    h.wait_for_state(parent.id(), ServiceState::Successful).await;

    let stages: Vec<String> = h
        .store
        .list_for_service(parent.id())
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            LifecycleStage::SuspendProcessing.to_string(),
            LifecycleStage::ResumeProcessing.to_string(),
            LifecycleStage::SuccessfulProcessing.to_string(),
        ]
    );
}

#[tokio::test]
async fn failure_sends_failed_notification() {
    let h = Harness::new(test_config(1)).start();
    let notify = NotificationSettings::default()
        .with_stage(LifecycleStage::FailedProcessing, NotificationConfig::new("job-failed"));
    let a = h
        .engine
        .submit_single_service(NewService::new("fail").with_notifications(notify))
        .await
        .unwrap();

    h.wait_for_state(a.id(), ServiceState::Error).await;
    h.settle().await;

    let notifications = h.store.list_for_service(a.id()).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].event_name, "job-failed");
    assert_eq!(notifications[0].data["data"]["state"], "ERROR");
}

// ---------------------------------------------------------------------------
// Metadata and search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metadata_lists_registered_processors() {
    let h = Harness::new(test_config(0));
    let names: Vec<String> = h
        .engine
        .get_all_services_metadata()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec!["echo", "fail", "gate", "never"]);
    assert!(h.engine.get_service_metadata("echo").is_some());
    assert!(h.engine.get_service_metadata("missing").is_none());
}

#[tokio::test]
async fn search_filters_by_name_and_state() {
    let h = Harness::new(test_config(0));
    h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    h.engine.submit_single_service(NewService::new("echo")).await.unwrap();
    h.engine.submit_single_service(NewService::new("gate")).await.unwrap();

    let page = h
        .engine
        .search_services(
            &ServicePattern::named("echo").in_states(&[ServiceState::Queued]),
            &TimeRange::default(),
            &PageRequest::new(0, 10),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page.items.iter().all(|r| r.name == "echo"));

    let all = h
        .engine
        .count_services(&ServicePattern::named("*"), &TimeRange::default())
        .await
        .unwrap();
    assert_eq!(all, 3);
}
