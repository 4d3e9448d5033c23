// Dispatcher behavior: clamp, admission/parking, wake-up dispatch,
// rejection before side effects, env defaulting, and tenant isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

use stratus::core::{ComputeTaskRequest, Principal, ResourceSpec, TaskStatus};
use stratus::dispatcher::Dispatcher;
use stratus::error::CoreError;
use stratus::queue::{JobQueue, MemoryQueue};
use stratus::registry::{GpuRegistry, MemoryRegistry};
use stratus::store::TaskStore;
use stratus::workspace::WorkspaceManager;

const TOTAL: u64 = 8192;
const SLICE: u64 = 2048;
const MAX_CPU: u32 = 4;

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<TaskStore>,
    registry: Arc<MemoryRegistry>,
    queue: Arc<MemoryQueue>,
    _tmp: TempDir,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(tmp.path().join("tasks.db")).unwrap());
    let workspaces = Arc::new(WorkspaceManager::new(tmp.path().join("workspaces")).unwrap());
    let registry = Arc::new(MemoryRegistry::new(TOTAL, SLICE));
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        workspaces,
        registry.clone(),
        queue.clone(),
        MAX_CPU,
    );
    Harness {
        dispatcher,
        store,
        registry,
        queue,
        _tmp: tmp,
    }
}

fn alice() -> Principal {
    Principal {
        id: 1,
        name: "alice".into(),
    }
}

fn bob() -> Principal {
    Principal {
        id: 2,
        name: "bob".into(),
    }
}

fn request(cpu: u32, gpu: bool) -> ComputeTaskRequest {
    ComputeTaskRequest {
        image: "alpine:3".into(),
        command: Some(vec!["sh".into(), "-c".into(), "true".into()]),
        args: None,
        env: HashMap::new(),
        resources: ResourceSpec { cpu, gpu },
    }
}

async fn pop(queue: &MemoryQueue) -> Option<stratus::core::JobPayload> {
    timeout(Duration::from_millis(100), queue.next())
        .await
        .ok()
        .and_then(|r| r.unwrap())
}

#[tokio::test]
async fn accepted_task_is_running_with_a_workspace() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(2, false), &alice())
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Running);
    let path = task.path.expect("workspace path written back");
    assert!(path.ends_with(&format!("task_{}", task.id)));
    assert!(std::path::Path::new(&path).is_dir());

    let payload = pop(&h.queue).await.expect("payload submitted");
    assert_eq!(payload.task_id, task.id);
    assert!(!payload.gpu);
}

#[tokio::test]
async fn cpu_request_is_clamped() {
    let h = harness();
    h.dispatcher
        .start_compute(request(99, false), &alice())
        .await
        .unwrap();

    let payload = pop(&h.queue).await.unwrap();
    assert_eq!(payload.cpu_cores, MAX_CPU);
}

#[tokio::test]
async fn empty_image_is_rejected_before_any_row() {
    let h = harness();
    let err = h
        .dispatcher
        .start_compute(
            ComputeTaskRequest {
                image: "  ".into(),
                ..request(1, false)
            },
            &alice(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidArgument(_)));
    assert!(h.store.tasks_for_user(1).unwrap().is_empty());
}

#[tokio::test]
async fn output_dir_defaults_only_without_a_command() {
    let h = harness();

    let mut no_command = request(1, false);
    no_command.command = None;
    h.dispatcher
        .start_compute(no_command, &alice())
        .await
        .unwrap();
    let payload = pop(&h.queue).await.unwrap();
    assert_eq!(payload.env.get("TASK_OUTPUT_DIR").unwrap(), "/workspaces");
    assert_eq!(payload.env.get("OUTPUT_DIR").unwrap(), "/workspaces");

    h.dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();
    let payload = pop(&h.queue).await.unwrap();
    assert_eq!(payload.env.get("TASK_OUTPUT_DIR").unwrap(), "/workspaces");
    assert!(!payload.env.contains_key("OUTPUT_DIR"));
}

#[tokio::test]
async fn fifth_gpu_job_parks_and_wakes_exactly_once() {
    let h = harness();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let task = h
            .dispatcher
            .start_compute(request(1, true), &alice())
            .await
            .unwrap();
        // Parked or not, the user sees a running task.
        assert_eq!(task.status, TaskStatus::Running);
        ids.push(task.id);
    }

    // First four dispatched immediately, fifth parked.
    for expected in &ids[..4] {
        let payload = pop(&h.queue).await.expect("admitted payload");
        assert_eq!(payload.task_id, *expected);
        assert!(payload.gpu);
    }
    assert!(pop(&h.queue).await.is_none());

    let snap = h.registry.snapshot().await.unwrap();
    assert_eq!(snap.used_mb, TOTAL);
    assert_eq!(snap.queue_len, 1);

    // One release admits the parked payload; the worker submits it.
    let woken = h.registry.release(ids[0]).await.unwrap().unwrap();
    assert_eq!(woken.task_id, ids[4]);
    h.queue.submit(woken).await.unwrap();
    assert_eq!(pop(&h.queue).await.unwrap().task_id, ids[4]);

    // Exactly once: later releases find an empty queue.
    assert!(h.registry.release(ids[1]).await.unwrap().is_none());
    assert!(pop(&h.queue).await.is_none());
}

#[tokio::test]
async fn cross_owner_access_reads_as_missing() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();

    let err = h.dispatcher.owned_task(&bob(), task.id).unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    let err = h
        .dispatcher
        .list_task_files(&bob(), task.id, "")
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn traversal_through_the_api_is_rejected() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();

    let err = h
        .dispatcher
        .list_task_files(&alice(), task.id, "../../etc")
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPath));

    let err = h
        .dispatcher
        .download_path(&alice(), task.id, "../secret")
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPath));
}

#[tokio::test]
async fn download_of_a_written_artifact_resolves() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();

    let workspace = task.path.unwrap();
    std::fs::write(format!("{}/out.txt", workspace), b"hi\n").unwrap();

    let file = h
        .dispatcher
        .download_path(&alice(), task.id, "out.txt")
        .unwrap();
    assert_eq!(std::fs::read(file).unwrap(), b"hi\n");
}

#[tokio::test]
async fn delete_of_a_non_terminal_task_is_rejected() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();

    let err = h
        .dispatcher
        .delete_task(&alice(), task.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // The row is untouched.
    assert!(h.store.get_task(task.id).unwrap().is_some());
}

#[tokio::test]
async fn workspace_tree_lists_artifacts() {
    let h = harness();
    let task = h
        .dispatcher
        .start_compute(request(1, false), &alice())
        .await
        .unwrap();

    let workspace = task.path.clone().unwrap();
    std::fs::create_dir_all(format!("{}/results", workspace)).unwrap();
    std::fs::write(format!("{}/results/metrics.json", workspace), b"{}").unwrap();

    let nodes = h.dispatcher.workspace_tree(&alice(), task.id).unwrap();
    let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
    assert!(paths.contains(&"results"));
    assert!(paths.contains(&"results/metrics.json"));
}
