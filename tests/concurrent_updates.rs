//! Concurrency integration tests.
//!
//! Threads stand in for independent processes: each opens its own handle on
//! the same directory, so the only thing keeping them apart is the lock files.

use std::sync::{Arc, Barrier};
use std::thread;

use taskweave::Error;
use taskweave::config::StoreSettings;
use taskweave::task::{TaskId, TaskPatch, TaskStatus};
use taskweave::task_manager::TaskManager;
use tempfile::TempDir;

fn settings() -> StoreSettings {
    StoreSettings {
        lock_timeout_ms: 10_000,
        lock_retry_ms: 1,
        stale_lock_ms: 0,
    }
}

/// Two writers patch different fields of the same task at the same moment.
/// Both changes must survive; neither may clobber the other.
#[test]
fn test_same_task_updates_are_not_lost() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("tasks");
    let setup = TaskManager::open(&dir, &settings(), "setup").unwrap();
    let task = setup.create_task("Contended", "original", None).unwrap();

    for round in 0..10 {
        let barrier = Arc::new(Barrier::new(2));
        let patches = [
            TaskPatch::new().description(format!("desc {}", round)),
            TaskPatch::new().owner(format!("owner {}", round)),
        ];

        let handles: Vec<_> = patches
            .into_iter()
            .map(|patch| {
                let dir = dir.clone();
                let id = task.id.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let manager = TaskManager::open(&dir, &settings(), "worker").unwrap();
                    barrier.wait();
                    manager.update(&id, &patch).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = setup.get_task(&task.id).unwrap();
        assert_eq!(stored.description, format!("desc {}", round));
        assert_eq!(stored.owner, format!("owner {}", round));
    }
}

/// Many workers race to start the same task. Exactly one claim wins and the
/// owner never changes afterwards.
#[test]
fn test_claim_race_has_single_winner() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("tasks");
    let setup = TaskManager::open(&dir, &settings(), "setup").unwrap();
    let task = setup.create_task("Prize", "", None).unwrap();

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let dir = dir.clone();
            let id = task.id.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let manager = TaskManager::open(&dir, &settings(), format!("worker-{}", i)).unwrap();
                barrier.wait();
                manager.set_status(&id, TaskStatus::InProgress).unwrap().task.owner
            })
        })
        .collect();

    let owners: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winner = setup.get_task(&task.id).unwrap().owner;
    assert!(winner.starts_with("worker-"));
    // Every caller saw the same winner, including the ones that lost
    assert!(owners.iter().all(|o| o == &winner));
}

/// Concurrent creates never hand out the same id twice.
#[test]
fn test_concurrent_creates_get_unique_ids() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("tasks");

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let dir = dir.clone();
            thread::spawn(move || {
                let manager = TaskManager::open(&dir, &settings(), "creator").unwrap();
                (0..10)
                    .map(|j| manager.create_task(&format!("t{}-{}", i, j), "", None).unwrap().id)
                    .collect::<Vec<TaskId>>()
            })
        })
        .collect();

    let mut ids: Vec<TaskId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 40);
    assert_eq!(ids.first(), Some(&TaskId::from_seq(1)));
    assert_eq!(ids.last(), Some(&TaskId::from_seq(40)));
}

/// Edges added from many threads at once, in both directions across a shared
/// hub, leave the graph consistent.
#[test]
fn test_concurrent_edge_mutations_stay_symmetric() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("tasks");
    let setup = TaskManager::open(&dir, &settings(), "setup").unwrap();
    for i in 0..9 {
        setup.create_task(&format!("Task {}", i), "", None).unwrap();
    }
    let hub = TaskId::from_seq(1);

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (2..=9u64)
        .map(|n| {
            let dir = dir.clone();
            let hub = hub.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let manager = TaskManager::open(&dir, &settings(), "linker").unwrap();
                barrier.wait();
                let me = TaskId::from_seq(n);
                if n % 2 == 0 {
                    manager.update(&me, &TaskPatch::new().add_blocked_by([hub.clone()])).unwrap();
                } else {
                    manager.update(&hub, &TaskPatch::new().add_blocks([me.clone()])).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    setup.verify().unwrap();
    assert_eq!(setup.get_task(&hub).unwrap().blocks.len(), 8);

    let outcome = setup.set_status(&hub, TaskStatus::Completed).unwrap();
    assert_eq!(outcome.unblocked.len(), 8);
    setup.verify().unwrap();
}

/// Two callers link a pair of tasks in opposite directions at the same
/// moment. One wins; the other sees the cycle it would have closed.
#[test]
fn test_opposing_edges_never_form_a_cycle() {
    for _ in 0..50 {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tasks");
        let setup = TaskManager::open(&dir, &settings(), "setup").unwrap();
        setup.create_task("A", "", None).unwrap();
        setup.create_task("B", "", None).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [(1u64, 2u64), (2, 1)]
            .into_iter()
            .map(|(blocked, blocker)| {
                let dir = dir.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let manager = TaskManager::open(&dir, &settings(), "linker").unwrap();
                    barrier.wait();
                    manager.add_dependency(&TaskId::from_seq(blocked), &TaskId::from_seq(blocker))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(Error::DependencyCycle { .. })))
        );

        let a = setup.get_task(&TaskId::from_seq(1)).unwrap();
        let b = setup.get_task(&TaskId::from_seq(2)).unwrap();
        assert_eq!(a.blocked_by.len() + b.blocked_by.len(), 1);
        setup.verify().unwrap();
    }
}

/// Three callers close a ring 1 <- 2 <- 3 <- 1 at once. At most two of the
/// edges can land.
#[test]
fn test_concurrent_ring_is_broken() {
    for _ in 0..20 {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tasks");
        let setup = TaskManager::open(&dir, &settings(), "setup").unwrap();
        for name in ["A", "B", "C"] {
            setup.create_task(name, "", None).unwrap();
        }

        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = [(1u64, 2u64), (2, 3), (3, 1)]
            .into_iter()
            .map(|(blocked, blocker)| {
                let dir = dir.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let manager = TaskManager::open(&dir, &settings(), "linker").unwrap();
                    barrier.wait();
                    manager.add_dependency(&TaskId::from_seq(blocked), &TaskId::from_seq(blocker))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        // Something is still ready to run
        assert!(!setup.ready_tasks().unwrap().is_empty());
        setup.verify().unwrap();
    }
}
