// Task store lifecycle: monotonic ids, the status DAG, terminal
// immutability, and set-once paths.

use tempfile::TempDir;
use stratus::core::{TaskStatus, TaskType};
use stratus::store::TaskStore;

fn open_store(tmp: &TempDir) -> TaskStore {
    TaskStore::open(tmp.path().join("tasks.db")).unwrap()
}

#[test]
fn ids_are_monotonic() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let mut last = 0;
    for _ in 0..5 {
        let task = store
            .create_task(TaskType::Compute, TaskStatus::Pending, 1)
            .unwrap();
        assert!(task.id > last);
        last = task.id;
    }
}

#[test]
fn lifecycle_dag_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Pending, 1)
        .unwrap();

    assert!(store.set_status(task.id, TaskStatus::Running, None).unwrap());
    assert!(store
        .set_status(task.id, TaskStatus::Completed, Some("done"))
        .unwrap());

    // Terminal is immutable, whatever the direction.
    assert!(!store.set_status(task.id, TaskStatus::Running, None).unwrap());
    assert!(!store
        .set_status(task.id, TaskStatus::Failed, Some("late"))
        .unwrap());
    assert!(!store.set_status(task.id, TaskStatus::Pending, None).unwrap());

    let row = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.logs.as_deref(), Some("done"));
}

#[test]
fn pending_may_fail_directly() {
    // Workspace creation failures kill a task before it ever runs.
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Pending, 1)
        .unwrap();

    assert!(store
        .set_status(task.id, TaskStatus::Failed, Some("Workspace creation failed"))
        .unwrap());
    let row = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
}

#[test]
fn running_cannot_go_back_to_pending() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Running, 1)
        .unwrap();

    assert!(!store.set_status(task.id, TaskStatus::Pending, None).unwrap());
    let row = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Running);
}

#[test]
fn logs_survive_refused_transitions() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Running, 1)
        .unwrap();

    assert!(store
        .set_status(task.id, TaskStatus::Failed, Some("exit 7"))
        .unwrap());
    // A redelivered payload trying to finish again changes nothing.
    assert!(!store
        .set_status(task.id, TaskStatus::Completed, Some("other"))
        .unwrap());

    let row = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.logs.as_deref(), Some("exit 7"));
}

#[test]
fn path_is_set_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Running, 1)
        .unwrap();

    store.set_path(task.id, "/srv/workspaces/alice/task_1").unwrap();
    store.set_path(task.id, "/elsewhere").unwrap();

    let row = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(row.path.as_deref(), Some("/srv/workspaces/alice/task_1"));
}

#[test]
fn listing_is_owner_scoped() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    store
        .create_task(TaskType::Compute, TaskStatus::Running, 1)
        .unwrap();
    store
        .create_task(TaskType::StaticPage, TaskStatus::Pending, 1)
        .unwrap();
    store
        .create_task(TaskType::Compute, TaskStatus::Running, 2)
        .unwrap();

    let mine = store.tasks_for_user(1).unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|t| t.user_id == 1));
    assert_eq!(mine[0].task_type, TaskType::Compute);
    assert_eq!(mine[1].task_type, TaskType::StaticPage);
}

#[test]
fn transition_on_unknown_task_is_refused() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    assert!(!store.set_status(999, TaskStatus::Completed, None).unwrap());
}

#[test]
fn delete_removes_the_row() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let task = store
        .create_task(TaskType::Compute, TaskStatus::Running, 1)
        .unwrap();
    store
        .set_status(task.id, TaskStatus::Completed, Some(""))
        .unwrap();

    store.delete_task(task.id).unwrap();
    assert!(store.get_task(task.id).unwrap().is_none());
}
