//! Integration tests for concurrent dispatch and the request service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{shell_config, wait_until, write_playbook, MemoryStore};
use drover_core::error::CoreError;
use drover_core::locking::LOCKED_FOR_PROCESSING;
use drover_core::request::{RequestKind, RequestState};
use drover_db::models::request::CreateRequest;
use drover_pipeline::dispatcher::Dispatcher;
use drover_pipeline::error::ServiceError;
use drover_pipeline::executor::RequestExecutor;
use drover_pipeline::service::RequestService;
use drover_pipeline::store::SharedStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Running {
    store: MemoryStore,
    service: RequestService,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    dir: tempfile::TempDir,
}

fn start(concurrency: usize) -> Running {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = MemoryStore::new();
    let shared: SharedStore = Arc::new(store.clone());
    let executor = Arc::new(RequestExecutor::new(shared.clone(), &shell_config(dir.path())));
    let dispatcher = Dispatcher::new(executor, concurrency);
    let service = RequestService::new(shared).with_dispatcher(dispatcher.handle());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(cancel.clone()));
    Running {
        store,
        service,
        cancel,
        task,
        dir,
    }
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }

    fn is_terminal(&self, id: i64) -> bool {
        self.store.request(id).state().unwrap().is_terminal()
    }
}

fn create(target_id: i64, kind: RequestKind, scope: Option<&str>, payload: serde_json::Value) -> CreateRequest {
    CreateRequest {
        target_id,
        kind,
        scope_name: scope.map(str::to_string),
        payload,
        parent_request_id: None,
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_fans_out_into_synchronizations() {
    let rt = start(4);
    write_playbook(
        rt.dir.path(),
        RequestKind::Initialize,
        "echo 'PYTHON_VERSION 3.6.4'\n",
    );
    write_playbook(
        rt.dir.path(),
        RequestKind::Synchronize,
        "echo 'INSTALLED requests 2.0'\n",
    );
    let target = rt.store.add_target("debian-9");
    rt.store.seed_env(target.id, "env1", &[]);
    let init = rt
        .service
        .create(&create(
            target.id,
            RequestKind::Initialize,
            None,
            json!({"virtual_environments": [{"name": "env2"}]}),
        ))
        .await
        .unwrap();

    assert!(rt.service.trigger(init.id).await.unwrap());

    wait_until(|| {
        let children = rt
            .store
            .all_requests()
            .into_iter()
            .filter(|r| r.parent_request_id == Some(init.id))
            .collect::<Vec<_>>();
        children.len() == 2 && children.iter().all(|c| rt.is_terminal(c.id))
    })
    .await;

    let children = rt.service.list_children(init.id).await.unwrap();
    assert!(children
        .iter()
        .all(|c| c.state().unwrap() == RequestState::Succeeded));
    for env in ["env1", "env2"] {
        assert_eq!(
            rt.store.libraries(target.id, env),
            vec![("requests".to_string(), "2.0".to_string())]
        );
    }
    rt.stop().await;
}

#[tokio::test]
async fn follow_ups_stay_triggered_when_shutdown_interrupts_fan_out() {
    let rt = start(2);
    write_playbook(
        rt.dir.path(),
        RequestKind::Initialize,
        "sleep 1\necho 'PYTHON_VERSION 3.6.4'\n",
    );
    let target = rt.store.add_target("debian-9");
    rt.store.seed_env(target.id, "env1", &[]);
    let init = rt
        .service
        .create(&create(target.id, RequestKind::Initialize, None, json!({})))
        .await
        .unwrap();

    rt.service.trigger(init.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let store = rt.store.clone();
    rt.stop().await;

    assert_eq!(store.request(init.id).state().unwrap(), RequestState::Succeeded);
    let children: Vec<_> = store
        .all_requests()
        .into_iter()
        .filter(|r| r.parent_request_id == Some(init.id))
        .collect();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].state().unwrap(), RequestState::Pending);
    assert!(children[0].triggered_at.is_some());
}

#[tokio::test]
async fn concurrent_requests_on_one_scope_are_mutually_exclusive() {
    let rt = start(4);
    write_playbook(
        rt.dir.path(),
        RequestKind::Synchronize,
        "sleep 1\necho 'INSTALLED six 1.0'\n",
    );
    let target = rt.store.add_target("debian");
    let first = rt
        .service
        .create(&create(target.id, RequestKind::Synchronize, Some("env"), json!({})))
        .await
        .unwrap();
    let second = rt
        .service
        .create(&create(target.id, RequestKind::Synchronize, Some("env"), json!({})))
        .await
        .unwrap();

    rt.service.trigger(first.id).await.unwrap();
    rt.service.trigger(second.id).await.unwrap();

    wait_until(|| rt.is_terminal(first.id) || rt.is_terminal(second.id)).await;
    wait_until(|| {
        let states = [first.id, second.id].map(|id| rt.store.request(id).state().unwrap());
        !states.iter().any(|s| s.holds_lock())
    })
    .await;

    let requests = [rt.store.request(first.id), rt.store.request(second.id)];
    let succeeded = requests
        .iter()
        .filter(|r| r.state().unwrap() == RequestState::Succeeded)
        .count();
    let denied = requests
        .iter()
        .filter(|r| {
            r.state().unwrap() == RequestState::Pending && r.output == LOCKED_FOR_PROCESSING
        })
        .count();
    assert_eq!((succeeded, denied), (1, 1));
    rt.stop().await;
}

#[tokio::test]
async fn distinct_scopes_run_in_parallel() {
    let rt = start(4);
    write_playbook(rt.dir.path(), RequestKind::Synchronize, "sleep 1\necho done\n");
    let target = rt.store.add_target("debian");
    let a = rt
        .service
        .create(&create(target.id, RequestKind::Synchronize, Some("envA"), json!({})))
        .await
        .unwrap();
    let b = rt
        .service
        .create(&create(target.id, RequestKind::Synchronize, Some("envB"), json!({})))
        .await
        .unwrap();

    rt.service.trigger(a.id).await.unwrap();
    rt.service.trigger(b.id).await.unwrap();

    wait_until(|| rt.is_terminal(a.id) && rt.is_terminal(b.id)).await;
    for id in [a.id, b.id] {
        assert_eq!(rt.store.request(id).state().unwrap(), RequestState::Succeeded);
    }
    rt.stop().await;
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_rejects_scope_mismatch() {
    let rt = start(1);
    let target = rt.store.add_target("debian");

    let missing_scope = rt
        .service
        .create(&create(target.id, RequestKind::Synchronize, None, json!({})))
        .await;
    assert_matches!(missing_scope, Err(ServiceError::Invalid(CoreError::Validation(_))));

    let extra_scope = rt
        .service
        .create(&create(target.id, RequestKind::Delete, Some("env"), json!({})))
        .await;
    assert_matches!(extra_scope, Err(ServiceError::Invalid(CoreError::Validation(_))));
    rt.stop().await;
}

#[tokio::test]
async fn create_rejects_unknown_target_and_bad_payload() {
    let rt = start(1);
    let unknown = rt
        .service
        .create(&create(999, RequestKind::Delete, None, json!({})))
        .await;
    assert_matches!(unknown, Err(ServiceError::Invalid(CoreError::NotFound { .. })));

    let target = rt.store.add_target("debian");
    let bad_payload = rt
        .service
        .create(&create(
            target.id,
            RequestKind::Synchronize,
            Some("env"),
            json!({"libraries_to_install": ["a b"]}),
        ))
        .await;
    assert_matches!(bad_payload, Err(ServiceError::Invalid(CoreError::Validation(_))));
    rt.stop().await;
}

#[tokio::test]
async fn trigger_ignores_non_pending_requests() {
    let rt = start(1);
    let target = rt.store.add_target("debian");
    let request = rt
        .service
        .create(&create(target.id, RequestKind::Delete, None, json!({})))
        .await
        .unwrap();
    rt.store.set_state(request.id, RequestState::Failed);

    assert!(!rt.service.trigger(request.id).await.unwrap());
    rt.stop().await;
}

#[tokio::test]
async fn trigger_without_dispatcher_flags_for_pickup() {
    let store = MemoryStore::new();
    let service = RequestService::new(Arc::new(store.clone()));
    let target = store.add_target("debian");
    let request = service
        .create(&create(target.id, RequestKind::FindVirtualEnvs, None, json!({})))
        .await
        .unwrap();

    assert!(service.trigger(request.id).await.unwrap());
    assert!(store.request(request.id).triggered_at.is_some());
}

#[tokio::test]
async fn retry_copies_a_failed_request() {
    let rt = start(1);
    let target = rt.store.add_target("debian");
    let original = rt
        .service
        .create(&create(
            target.id,
            RequestKind::Synchronize,
            Some("env"),
            json!({"libraries_to_install": ["six"]}),
        ))
        .await
        .unwrap();

    let not_failed = rt.service.retry(original.id).await;
    assert_matches!(not_failed, Err(ServiceError::Invalid(CoreError::Conflict(_))));

    rt.store.set_state(original.id, RequestState::Failed);
    let retry = rt.service.retry(original.id).await.unwrap();
    assert_eq!(retry.parent_request_id, Some(original.id));
    assert_eq!(retry.kind, original.kind);
    assert_eq!(retry.scope_name, original.scope_name);
    assert_eq!(retry.payload, original.payload);
    assert_eq!(retry.state().unwrap(), RequestState::Pending);

    let children = rt.service.list_children(original.id).await.unwrap();
    assert_eq!(children.len(), 1);
    rt.stop().await;
}
