//! Record store behaviour against a real on-disk repository.
//!
//! Run:
//! ```bash
//! cargo test -p taskvault-storage --test record_store
//! ```

#![allow(clippy::too_many_lines, clippy::significant_drop_tightening)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use proptest::prelude::*;
use taskvault_core::{
    Error, ListFilter, MetadataValue, NewProject, NewTask, ProjectPatch, TaskPatch, TaskStatus,
};
use taskvault_storage::{IntegrityWarning, OpenOptions, RepositoryLock, RepositoryStore};
use taskvault_test_helpers::local_config;
use tempfile::TempDir;

fn open(dir: &TempDir) -> RepositoryStore {
    RepositoryStore::open_with(local_config(dir.path()), OpenOptions::manual()).unwrap()
}

fn commit_count(store: &RepositoryStore) -> usize {
    let repo = git2::Repository::open(&store.config().repo_path).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    walk.count()
}

#[test]
fn create_then_read_returns_identical_record() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let mut new = NewTask::named("Implement X").with_status(TaskStatus::Pending);
    new.description = Some("the whole thing".into());
    new.due_date = NaiveDate::from_ymd_opt(2026, 12, 1);
    new.category = Some("backend".into());
    new.priority = Some(2);
    new.metadata.insert("estimate".into(), MetadataValue::from(3_i64));
    new.metadata.insert("blocked".into(), MetadataValue::from(false));

    let task = store.create_task(new).unwrap();
    assert!(task.id.starts_with("t-"));
    assert_eq!(task.completed_at, None);
    assert!(
        store
            .config()
            .repo_path
            .join(format!("tasks/{}.json", task.id))
            .is_file()
    );
    assert_eq!(store.read_task(&task.id).unwrap(), task);
}

#[test]
fn record_file_uses_null_for_absent_optionals() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = store.create_task(NewTask::named("bare")).unwrap();

    let raw = std::fs::read_to_string(
        store
            .config()
            .repo_path
            .join(format!("tasks/{}.json", task.id)),
    )
    .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["description"], serde_json::Value::Null);
    assert_eq!(value["completed_at"], serde_json::Value::Null);
    assert_eq!(value["priority"], 0);
    let keys: Vec<&str> = value
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys.first(), Some(&"id"));
    assert_eq!(keys.last(), Some(&"completion_report"));
}

#[test]
fn status_toggle_clears_completed_at() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = store.create_task(NewTask::named("toggle")).unwrap();

    let done = store
        .update_task(&task.id, TaskPatch::complete(Some("done".into())))
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.completion_report.as_deref(), Some("done"));

    let back = store
        .update_task(&task.id, TaskPatch::status(TaskStatus::Pending))
        .unwrap();
    assert_eq!(back.status, task.status);
    assert_eq!(back.completed_at, None);
    assert_eq!(back.completion_report, None);
    assert!(back.updated_at > done.updated_at);

    for t in &store.list_tasks(&ListFilter::default()).unwrap() {
        assert!(t.completion_consistent());
    }
}

#[test]
fn completion_report_requires_completed_status() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = store.create_task(NewTask::named("x")).unwrap();

    let patch = TaskPatch {
        status: Some(TaskStatus::InProgress),
        completion_report: Some("nope".into()),
        ..TaskPatch::default()
    };
    let err = store.update_task(&task.id, patch).unwrap_err();
    assert_eq!(err.error_type(), "VALIDATION_ERROR");
}

#[test]
fn nesting_is_limited_to_one_level() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let parent = store.create_task(NewTask::named("parent")).unwrap();
    let child = store
        .create_task(NewTask::named("child").with_parent(&parent.id))
        .unwrap();

    let err = store
        .create_task(NewTask::named("grandchild").with_parent(&child.id))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");

    let err = store
        .create_task(NewTask::named("orphan").with_parent("t-doesnotexist00"))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");

    // A task with subtasks cannot become a subtask.
    let other = store.create_task(NewTask::named("other")).unwrap();
    let patch = TaskPatch {
        parent_task_id: Some(Some(other.id.clone())),
        ..TaskPatch::default()
    };
    assert!(matches!(
        store.update_task(&parent.id, patch),
        Err(Error::Validation(_))
    ));

    let self_parent = TaskPatch {
        parent_task_id: Some(Some(other.id.clone())),
        ..TaskPatch::default()
    };
    assert!(matches!(
        store.update_task(&other.id, self_parent),
        Err(Error::Validation(_))
    ));
}

#[test]
fn deleting_parent_leaves_dangling_subtasks() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let parent = store.create_task(NewTask::named("parent")).unwrap();
    let a = store
        .create_task(NewTask::named("a").with_parent(&parent.id))
        .unwrap();
    let b = store
        .create_task(NewTask::named("b").with_parent(&parent.id))
        .unwrap();

    let subtasks: Vec<String> = store
        .subtasks(&parent.id)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(subtasks, vec![a.id.clone(), b.id.clone()]);

    store.delete_task(&a.id).unwrap();
    let subtasks = store.subtasks(&parent.id).unwrap();
    assert_eq!(subtasks.len(), 1);
    let listing = store.list_tasks(&ListFilter::default()).unwrap();
    assert!(listing.iter().all(|t| t.id != a.id));

    store.delete_task(&parent.id).unwrap();
    let listing = store.list_tasks(&ListFilter::default()).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(
        listing.warnings(),
        &[IntegrityWarning::DanglingParent {
            task_id: b.id.clone(),
            parent_task_id: parent.id.clone(),
        }]
    );
    assert!(store.read_task(&b.id).is_ok());
}

#[test]
fn delete_of_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let before = commit_count(&store);

    let err = store.delete_task("t-0000000000000000").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(err.error_type(), "NOT_FOUND");
    assert!(store.list_tasks(&ListFilter::default()).unwrap().is_empty());
    assert_eq!(commit_count(&store), before);
}

#[test]
fn listing_is_ordered_filtered_and_restartable() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let first = store
        .create_task(NewTask::named("first").with_project("alpha"))
        .unwrap();
    let second = store
        .create_task(
            NewTask::named("second")
                .with_project("beta")
                .with_status(TaskStatus::Completed),
        )
        .unwrap();
    let third = store
        .create_task(NewTask::named("third").with_parent(&first.id))
        .unwrap();

    let listing = store.list_tasks(&ListFilter::default()).unwrap();
    let ids: Vec<&str> = listing.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);
    // Iterating again starts from the beginning.
    assert_eq!(listing.iter().count(), 3);

    let completed = store
        .list_tasks(&ListFilter::default().status(TaskStatus::Completed))
        .unwrap();
    assert_eq!(completed.iter().next().map(|t| &t.id), Some(&second.id));
    assert!(second.completed_at.is_some());

    let top = store
        .list_tasks(&ListFilter::default().top_level())
        .unwrap();
    assert_eq!(top.len(), 2);

    let limited = store
        .list_tasks(&ListFilter::default().project("alpha").limit(5))
        .unwrap();
    assert_eq!(limited.len(), 1);

    let stats = store.task_stats(None).unwrap();
    assert_eq!((stats.total, stats.pending, stats.completed), (3, 2, 1));
}

#[test]
fn loose_json_input_is_validated() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    for bad in [
        serde_json::json!({}),
        serde_json::json!({"task_name": "x", "status": "blocked"}),
        serde_json::json!({"task_name": "x", "id": "t-mine"}),
        serde_json::json!({"task_name": "x", "metadata": {"nested": [1, 2]}}),
        serde_json::json!({"task_name": "x", "colour": "red"}),
    ] {
        let err = NewTask::from_json(bad.clone())
            .and_then(|new| store.create_task(new))
            .unwrap_err();
        assert_eq!(err.error_type(), "VALIDATION_ERROR", "{bad}");
    }

    let new = NewTask::from_json(serde_json::json!({
        "task_name": "from json",
        "status": "in_progress",
        "metadata": {"source": "hook", "score": 1.5, "flag": true, "none": null}
    }))
    .unwrap();
    let task = store.create_task(new).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.metadata.len(), 4);
}

#[test]
fn lock_contention_surfaces_as_retryable_lock_busy() {
    let dir = TempDir::new().unwrap();
    let mut config = local_config(dir.path());
    config.lock_timeout_seconds = 1;
    let store = RepositoryStore::open_with(config, OpenOptions::manual()).unwrap();

    let other = RepositoryLock::for_git_dir(&store.config().repo_path.join(".git"));
    let held = other.acquire().unwrap();
    let err = store.create_task(NewTask::named("blocked")).unwrap_err();
    assert_eq!(err.error_type(), "LOCK_BUSY");
    assert!(err.is_retryable());
    drop(held);

    store.create_task(NewTask::named("unblocked")).unwrap();
}

#[test]
fn concurrent_writers_serialize_through_the_lock() {
    let dir = TempDir::new().unwrap();
    let base = open(&dir);
    let before = commit_count(&base);

    let stores: Vec<Arc<RepositoryStore>> = (0..4).map(|_| Arc::new(open(&dir))).collect();
    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(w, store)| {
            let store = Arc::clone(store);
            std::thread::spawn(move || {
                (0..5)
                    .map(|i| {
                        store
                            .create_task(NewTask::named(format!("writer {w} task {i}")))
                            .unwrap()
                            .id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.extend(handle.join().unwrap());
    }
    assert_eq!(ids.len(), 20);
    assert_eq!(base.list_tasks(&ListFilter::default()).unwrap().len(), 20);
    assert_eq!(commit_count(&base), before + 20);

    let repo = git2::Repository::open(&base.config().repo_path).unwrap();
    assert!(repo.statuses(None).unwrap().is_empty());
}

#[test]
fn projects_round_trip_and_report_counts() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let mut new = NewProject::named("Home Lab");
    new.project_path = Some("/home/me/lab".into());
    let project = store.create_project(new).unwrap();
    assert_eq!(store.read_project("/home/me/lab").unwrap(), project);

    let renamed = store
        .update_project(
            "/home/me/lab",
            ProjectPatch {
                project_name: Some("Lab".into()),
                description: Some(Some("rack".into())),
            },
        )
        .unwrap();
    assert_eq!(renamed.project_name, "Lab");
    assert!(renamed.updated_at > project.updated_at);

    store
        .create_task(NewTask::named("cable").with_project("/home/me/lab"))
        .unwrap();
    let summaries = store.list_projects().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].task_count, 1);
    assert_eq!(summaries[0].pending_count, 1);
    assert!(!summaries[0].implicit);

    store.delete_project("/home/me/lab").unwrap();
    let summaries = store.list_projects().unwrap();
    assert!(summaries[0].implicit);
    assert!(matches!(
        store.delete_project("/home/me/lab"),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn lock_wait_is_bounded() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let lock = RepositoryLock::for_git_dir(&store.config().repo_path.join(".git"))
        .with_timeout(Duration::from_millis(200));
    let _held = lock.acquire().unwrap();

    let started = std::time::Instant::now();
    assert!(lock.acquire().is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn any_valid_task_round_trips(
        name in "[A-Za-z][A-Za-z0-9 ]{0,30}",
        description in proptest::option::of("[ -~]{0,40}"),
        priority in -5i64..5,
        completed in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut new = NewTask::named(name);
        new.description = description;
        new.priority = Some(priority);
        if completed {
            new.status = Some(TaskStatus::Completed);
        }
        let task = store.create_task(new).unwrap();
        prop_assert_eq!(store.read_task(&task.id).unwrap(), task.clone());
        prop_assert_eq!(task.completed_at.is_some(), completed);
    }
}
