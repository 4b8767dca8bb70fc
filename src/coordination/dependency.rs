//! Dependency engine.
//!
//! Keeps `blocks` / `blockedBy` as exact mirror images. Every edge mutation
//! locks both endpoint records (in id order) and rewrites both before
//! returning, so no caller ever observes one side without the other.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::store::TaskStore;
use crate::task::{Task, TaskId, TaskStatus};

/// How many times `detach` re-reads a record whose edges moved under it.
const DETACH_ATTEMPTS: usize = 5;

/// Store-wide lock taken by every edge addition.
const EDGES_LOCK: &str = ".edges";

/// Maintains the blocking graph stored inside task records.
#[derive(Debug, Clone)]
pub struct DependencyEngine {
    store: TaskStore,
}

impl DependencyEngine {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Make `task_id` wait for each of `prerequisites`.
    ///
    /// Self-edges and edges that would close a cycle are rejected. Edges to a
    /// prerequisite that is already completed are not recorded, since nothing
    /// would ever clear them.
    pub fn add_blocked_by(&self, task_id: &TaskId, prerequisites: &[TaskId]) -> Result<Task> {
        for prerequisite in prerequisites {
            self.add_edge(task_id, prerequisite)?;
        }
        self.store.get(task_id)
    }

    /// Mirror form: each of `dependents` becomes blocked by `task_id`.
    pub fn add_blocks(&self, task_id: &TaskId, dependents: &[TaskId]) -> Result<Task> {
        for dependent in dependents {
            self.add_edge(dependent, task_id)?;
        }
        self.store.get(task_id)
    }

    /// Drop the edges between `task_id` and each of `prerequisites`.
    pub fn remove_blocked_by(&self, task_id: &TaskId, prerequisites: &[TaskId]) -> Result<Task> {
        for prerequisite in prerequisites {
            self.remove_edge(task_id, prerequisite)?;
        }
        self.store.get(task_id)
    }

    /// Mirror form of [`remove_blocked_by`](Self::remove_blocked_by).
    pub fn remove_blocks(&self, task_id: &TaskId, dependents: &[TaskId]) -> Result<Task> {
        for dependent in dependents {
            self.remove_edge(dependent, task_id)?;
        }
        self.store.get(task_id)
    }

    /// Propagate a completion: sever every edge from `task_id` to its
    /// dependents and return those left with nothing blocking them.
    ///
    /// Status of the dependents is not touched. Safe to call again after a
    /// partial failure; already-severed edges are skipped.
    pub fn on_completed(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let task = self.store.get(task_id)?;
        let mut unblocked = Vec::new();

        for dependent in &task.blocks {
            if !self.store.exists(dependent) {
                log::warn!("Task #{} lists missing dependent #{}; dropping edge", task_id, dependent);
                self.store.modify(task_id, |t| Ok(t.blocks.remove(dependent)))?;
                continue;
            }

            let _locks = self.store.locks().acquire_many(&[task_id.clone(), dependent.clone()])?;
            let mut completed = self.store.read_record(task_id)?;
            let mut dep = self.store.read_record(dependent)?;

            let removed = dep.blocked_by.remove(task_id);
            completed.blocks.remove(dependent);
            self.write_pair(&completed, &dep)?;

            if removed && dep.is_executable() && dep.status != TaskStatus::Completed {
                unblocked.push(dep.id.clone());
            }
        }

        if !unblocked.is_empty() {
            log::info!(
                "Completing #{} unblocked {}",
                task_id,
                unblocked.iter().map(|id| format!("#{}", id)).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(unblocked)
    }

    /// Sever every edge touching `task_id` and delete its record.
    ///
    /// Each edge is severed on both ends before the next one is touched, so a
    /// failure part way leaves a smaller but still mirrored graph and the task
    /// in place. Running it again finishes the job.
    ///
    /// Returns dependents that lost their last blocker.
    pub fn detach(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let started = Instant::now();

        for attempt in 1..=DETACH_ATTEMPTS {
            let snapshot = self.store.get(task_id)?;
            let mut ids: Vec<TaskId> = vec![task_id.clone()];
            ids.extend(snapshot.blocks.iter().cloned());
            ids.extend(snapshot.blocked_by.iter().cloned());

            let locks = self.store.locks().acquire_many(&ids)?;
            let mut task = self.store.read_record(task_id)?;
            let locked: HashSet<&TaskId> = ids.iter().collect();
            if !task.blocks.iter().chain(task.blocked_by.iter()).all(|id| locked.contains(id)) {
                log::debug!("Edges of #{} moved while locking (attempt {})", task_id, attempt);
                continue;
            }

            for prerequisite in task.blocked_by.clone() {
                task.blocked_by.remove(&prerequisite);
                match self.store.read_record(&prerequisite) {
                    Ok(mut p) => {
                        p.blocks.remove(task_id);
                        self.write_pair(&task, &p)?;
                    }
                    Err(Error::TaskNotFound { .. }) => self.store.write_record(&task)?,
                    Err(e) => return Err(e),
                }
            }

            let mut unblocked = Vec::new();
            for dependent in task.blocks.clone() {
                task.blocks.remove(&dependent);
                match self.store.read_record(&dependent) {
                    Ok(mut d) => {
                        d.blocked_by.remove(task_id);
                        self.write_pair(&task, &d)?;
                        if d.is_executable() && d.status != TaskStatus::Completed {
                            unblocked.push(d.id.clone());
                        }
                    }
                    Err(Error::TaskNotFound { .. }) => self.store.write_record(&task)?,
                    Err(e) => return Err(e),
                }
            }

            let own_lock = locks
                .iter()
                .find(|l| l.label() == task_id.as_ref())
                .ok_or_else(|| Error::DependencyInconsistency(format!("lock for #{} not held", task_id)))?;
            self.store.remove_record(task_id, own_lock)?;

            log::debug!("Deleted task #{} and severed its edges", task_id);
            return Ok(unblocked);
        }

        Err(edges_kept_moving(task_id, started))
    }

    /// Check that adding these edges to `task_id` would succeed: every id
    /// exists and no edge, alone or together with the others, closes a cycle.
    ///
    /// Nothing is written. Used to reject a whole patch before any part of it
    /// is applied; the edge writes still re-check under their locks.
    pub fn check_additions(&self, task_id: &TaskId, prerequisites: &[TaskId], dependents: &[TaskId]) -> Result<()> {
        self.store.get(task_id)?;

        let edges = prerequisites
            .iter()
            .map(|p| (task_id.clone(), p.clone()))
            .chain(dependents.iter().map(|d| (d.clone(), task_id.clone())));

        let mut planned: Vec<(TaskId, TaskId)> = Vec::new();
        for (dependent, prerequisite) in edges {
            if dependent == prerequisite {
                return Err(cycle(&dependent, &prerequisite));
            }
            self.store.get(&dependent)?;
            if self.store.get(&prerequisite)?.status == TaskStatus::Completed {
                continue;
            }
            if self.is_blocked_transitively(&prerequisite, &dependent, &planned)? {
                return Err(cycle(&dependent, &prerequisite));
            }
            planned.push((dependent, prerequisite));
        }
        Ok(())
    }

    /// Check the mirror invariant across the whole store.
    pub fn verify(&self) -> Result<()> {
        let tasks = self.store.load_all()?;
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

        for task in &tasks {
            for prerequisite in &task.blocked_by {
                let mirrored = by_id.get(prerequisite).is_some_and(|p| p.blocks.contains(&task.id));
                if !mirrored {
                    return Err(Error::DependencyInconsistency(format!(
                        "#{} is blocked by #{} but #{} does not list it in blocks",
                        task.id, prerequisite, prerequisite
                    )));
                }
            }
            for dependent in &task.blocks {
                let mirrored = by_id.get(dependent).is_some_and(|d| d.blocked_by.contains(&task.id));
                if !mirrored {
                    return Err(Error::DependencyInconsistency(format!(
                        "#{} blocks #{} but #{} does not list it in blockedBy",
                        task.id, dependent, dependent
                    )));
                }
            }
        }
        Ok(())
    }

    fn add_edge(&self, task_id: &TaskId, prerequisite: &TaskId) -> Result<()> {
        if task_id == prerequisite {
            return Err(cycle(task_id, prerequisite));
        }

        // Held across the cycle check and the write. Edge additions are the
        // only way a cycle can form, so serialising them makes the check
        // exact; removals elsewhere only ever shrink the graph.
        let _edges = self.store.locks().acquire_named(EDGES_LOCK, "edges")?;
        let _locks = self
            .store
            .locks()
            .acquire_many(&[task_id.clone(), prerequisite.clone()])?;
        let mut task = self.store.read_record(task_id)?;
        let mut pre = self.store.read_record(prerequisite)?;

        if pre.status == TaskStatus::Completed {
            log::debug!("Not recording #{} -> #{}: prerequisite already completed", task_id, prerequisite);
            return Ok(());
        }
        if task.blocked_by.contains(prerequisite) && pre.blocks.contains(task_id) {
            return Ok(());
        }
        if self.is_blocked_transitively(prerequisite, task_id, &[])? {
            return Err(cycle(task_id, prerequisite));
        }

        task.blocked_by.insert(prerequisite.clone());
        pre.blocks.insert(task_id.clone());
        self.write_pair(&task, &pre)?;

        log::debug!("Task #{} now blocked by #{}", task_id, prerequisite);
        Ok(())
    }

    fn remove_edge(&self, task_id: &TaskId, prerequisite: &TaskId) -> Result<()> {
        // A dangling reference has only one side left to clean
        match (self.store.exists(task_id), self.store.exists(prerequisite)) {
            (true, true) => {}
            (true, false) => {
                self.store.modify(task_id, |t| Ok(t.blocked_by.remove(prerequisite)))?;
                return Ok(());
            }
            (false, true) => {
                self.store.modify(prerequisite, |p| Ok(p.blocks.remove(task_id)))?;
                return Ok(());
            }
            (false, false) => return Err(Error::TaskNotFound { id: task_id.to_string() }),
        }

        let _locks = self
            .store
            .locks()
            .acquire_many(&[task_id.clone(), prerequisite.clone()])?;
        let mut task = self.store.read_record(task_id)?;
        let mut pre = self.store.read_record(prerequisite)?;

        let a = task.blocked_by.remove(prerequisite);
        let b = pre.blocks.remove(task_id);
        if a || b {
            self.write_pair(&task, &pre)?;
        }
        Ok(())
    }

    /// Write two records whose locks are held. If the second write fails the
    /// first is rolled back so the pair stays consistent.
    fn write_pair(&self, first: &Task, second: &Task) -> Result<()> {
        let original_first = self.store.read_record(&first.id)?;
        self.store.write_record(first)?;

        if let Err(e) = self.store.write_record(second) {
            return match self.store.write_record(&original_first) {
                Ok(()) => Err(e),
                Err(rollback) => Err(Error::DependencyInconsistency(format!(
                    "wrote #{} but not #{} ({}); rollback failed: {}",
                    first.id, second.id, e, rollback
                ))),
            };
        }
        Ok(())
    }

    /// Whether `from` waits, directly or through others, on `target`.
    ///
    /// `planned` holds `(dependent, prerequisite)` edges not yet on disk that
    /// should count as if they were.
    fn is_blocked_transitively(&self, from: &TaskId, target: &TaskId, planned: &[(TaskId, TaskId)]) -> Result<bool> {
        let mut seen: BTreeSet<TaskId> = BTreeSet::new();
        let mut stack = vec![from.clone()];

        while let Some(current) = stack.pop() {
            if &current == target {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            stack.extend(
                planned
                    .iter()
                    .filter(|(dependent, _)| dependent == &current)
                    .map(|(_, prerequisite)| prerequisite.clone()),
            );
            match self.store.get(&current) {
                Ok(task) => stack.extend(task.blocked_by.into_iter()),
                Err(Error::TaskNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

fn cycle(task: &TaskId, prerequisite: &TaskId) -> Error {
    Error::DependencyCycle {
        task: task.to_string(),
        prerequisite: prerequisite.to_string(),
    }
}

/// Error for a delete that never caught the task's edges standing still.
fn edges_kept_moving(task_id: &TaskId, started: Instant) -> Error {
    let waited = started.elapsed();
    log::warn!(
        "Gave up deleting #{} after {} attempts in {:?}: its edges kept changing",
        task_id,
        DETACH_ATTEMPTS,
        waited
    );
    Error::LockTimeout {
        id: task_id.to_string(),
        waited_ms: waited.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use crate::task::TaskPatch;
    use tempfile::TempDir;

    fn setup(n: usize) -> (TempDir, TaskStore, DependencyEngine) {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::open(temp.path(), &StoreSettings::default()).unwrap();
        for i in 1..=n {
            store.create(&format!("Task {}", i), "", None).unwrap();
        }
        let engine = DependencyEngine::new(store.clone());
        (temp, store, engine)
    }

    fn id(n: u64) -> TaskId {
        TaskId::from_seq(n)
    }

    fn complete(store: &TaskStore, n: u64) {
        store
            .update_fields(&id(n), &TaskPatch::new().status(TaskStatus::Completed), "test")
            .unwrap();
    }

    #[test]
    fn test_add_blocked_by_is_symmetric() {
        let (_temp, store, engine) = setup(2);

        let task = engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        assert!(task.blocked_by.contains(&id(1)));
        assert!(store.get(&id(1)).unwrap().blocks.contains(&id(2)));
        engine.verify().unwrap();
    }

    #[test]
    fn test_add_blocks_mirrors() {
        let (_temp, store, engine) = setup(3);

        let task = engine.add_blocks(&id(1), &[id(2), id(3)]).unwrap();
        assert_eq!(task.blocks, [id(2), id(3)].into_iter().collect());
        assert!(store.get(&id(3)).unwrap().blocked_by.contains(&id(1)));
        engine.verify().unwrap();
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_temp, store, engine) = setup(2);

        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        assert_eq!(store.get(&id(2)).unwrap().blocked_by.len(), 1);
        assert_eq!(store.get(&id(1)).unwrap().blocks.len(), 1);
    }

    #[test]
    fn test_self_edge_rejected() {
        let (_temp, _store, engine) = setup(1);
        assert!(matches!(
            engine.add_blocked_by(&id(1), &[id(1)]),
            Err(Error::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let (_temp, store, engine) = setup(3);

        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.add_blocked_by(&id(3), &[id(2)]).unwrap();

        let err = engine.add_blocked_by(&id(1), &[id(3)]).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { ref task, ref prerequisite } if task == "1" && prerequisite == "3"));

        // Nothing was written
        assert!(store.get(&id(1)).unwrap().blocked_by.is_empty());
        assert!(!store.get(&id(3)).unwrap().blocks.contains(&id(1)));
        engine.verify().unwrap();
    }

    #[test]
    fn test_missing_prerequisite_is_not_found() {
        let (_temp, store, engine) = setup(1);
        assert!(matches!(
            engine.add_blocked_by(&id(1), &[id(9)]),
            Err(Error::TaskNotFound { ref id }) if id == "9"
        ));
        assert!(store.get(&id(1)).unwrap().blocked_by.is_empty());
    }

    #[test]
    fn test_completed_prerequisite_not_recorded() {
        let (_temp, store, engine) = setup(2);
        complete(&store, 1);

        let task = engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        assert!(task.is_executable());
        assert!(store.get(&id(1)).unwrap().blocks.is_empty());
    }

    #[test]
    fn test_on_completed_scenario() {
        let (_temp, store, engine) = setup(3);

        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.add_blocked_by(&id(3), &[id(1), id(2)]).unwrap();

        complete(&store, 1);
        let unblocked = engine.on_completed(&id(1)).unwrap();

        assert_eq!(unblocked, vec![id(2)]);
        assert!(store.get(&id(2)).unwrap().blocked_by.is_empty());
        let t3 = store.get(&id(3)).unwrap();
        assert!(t3.blocked_by.contains(&id(2)));
        assert!(!t3.blocked_by.contains(&id(1)));
        // Status is informational only
        assert_eq!(store.get(&id(2)).unwrap().status, TaskStatus::Pending);
        engine.verify().unwrap();

        // Running it again is harmless
        assert!(engine.on_completed(&id(1)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_blocked_by() {
        let (_temp, store, engine) = setup(2);

        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        let task = engine.remove_blocked_by(&id(2), &[id(1)]).unwrap();

        assert!(task.blocked_by.is_empty());
        assert!(store.get(&id(1)).unwrap().blocks.is_empty());
        engine.verify().unwrap();
    }

    #[test]
    fn test_detach_severs_all_edges() {
        let (_temp, store, engine) = setup(3);

        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.add_blocked_by(&id(3), &[id(2)]).unwrap();

        let unblocked = engine.detach(&id(2)).unwrap();
        assert_eq!(unblocked, vec![id(3)]);
        assert!(!store.exists(&id(2)));
        assert!(store.get(&id(1)).unwrap().blocks.is_empty());
        assert!(store.get(&id(3)).unwrap().blocked_by.is_empty());
        engine.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_one_sided_edge() {
        let (_temp, store, engine) = setup(2);

        store
            .modify(&id(2), |t| Ok(t.blocked_by.insert(id(1))))
            .unwrap();

        assert!(matches!(engine.verify(), Err(Error::DependencyInconsistency(_))));
    }

    /// Make the next atomic write of a record fail by putting a directory
    /// where its temp file goes.
    fn jam_writes(store: &TaskStore, n: u64) -> std::path::PathBuf {
        let tmp = store.dir().join(format!("task_{}.json.tmp", n));
        std::fs::create_dir(&tmp).unwrap();
        tmp
    }

    #[test]
    fn test_failed_second_write_rolls_back_first() {
        let (_temp, store, engine) = setup(2);
        let jam = jam_writes(&store, 1);

        // #2 is written first, then #1 fails
        let err = engine.add_blocked_by(&id(2), &[id(1)]).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));

        assert!(store.get(&id(2)).unwrap().blocked_by.is_empty());
        assert!(store.get(&id(1)).unwrap().blocks.is_empty());
        engine.verify().unwrap();

        std::fs::remove_dir(jam).unwrap();
        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.verify().unwrap();
    }

    #[test]
    fn test_detach_failure_leaves_mirrored_graph() {
        let (_temp, store, engine) = setup(3);
        engine.add_blocked_by(&id(2), &[id(1)]).unwrap();
        engine.add_blocked_by(&id(3), &[id(2)]).unwrap();

        let jam = jam_writes(&store, 3);
        assert!(matches!(engine.detach(&id(2)), Err(Error::Storage { .. })));

        // The edge to #1 is gone on both ends; the one to #3 survives on both
        let t2 = store.get(&id(2)).unwrap();
        assert!(t2.blocked_by.is_empty());
        assert!(t2.blocks.contains(&id(3)));
        assert!(store.get(&id(1)).unwrap().blocks.is_empty());
        assert!(store.get(&id(3)).unwrap().blocked_by.contains(&id(2)));
        engine.verify().unwrap();

        std::fs::remove_dir(jam).unwrap();
        assert_eq!(engine.detach(&id(2)).unwrap(), vec![id(3)]);
        assert!(!store.exists(&id(2)));
        engine.verify().unwrap();
    }

    #[test]
    fn test_check_additions_sees_whole_patch() {
        let (_temp, store, engine) = setup(3);
        complete(&store, 3);

        engine.check_additions(&id(1), &[id(2)], &[]).unwrap();
        // Fine alone, but together they form 1 -> 2 -> 1
        assert!(matches!(
            engine.check_additions(&id(1), &[id(2)], &[id(2)]),
            Err(Error::DependencyCycle { .. })
        ));
        assert!(matches!(
            engine.check_additions(&id(1), &[id(2), id(9)], &[]),
            Err(Error::TaskNotFound { ref id }) if id == "9"
        ));
        // Completed prerequisites are skipped, not rejected
        engine.check_additions(&id(1), &[id(3)], &[]).unwrap();

        assert!(store.load_all().unwrap().iter().all(|t| t.blocks.is_empty() && t.blocked_by.is_empty()));
    }

    #[test]
    fn test_edges_kept_moving_reports_elapsed() {
        let started = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let err = edges_kept_moving(&id(4), started);
        assert!(err.is_retryable());
        assert!(matches!(err, Error::LockTimeout { ref id, waited_ms } if id == "4" && waited_ms >= 20));
    }

    #[test]
    fn test_remove_with_missing_dependent_cleans_prerequisite() {
        let (_temp, store, engine) = setup(1);
        store.modify(&id(1), |t| Ok(t.blocks.insert(id(7)))).unwrap();

        let task = engine.remove_blocks(&id(1), &[id(7)]).unwrap();
        assert!(task.blocks.is_empty());
        engine.verify().unwrap();
    }
}
