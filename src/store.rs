//! File-backed task store.
//!
//! One pretty-printed JSON record per task (`task_<id>.json`) in a single
//! directory. Records are replaced atomically (write to a temp file, fsync,
//! rename), so a reader never sees a torn record and a crash leaves either the
//! old or the new version. Every read-modify-write runs under the record's
//! [`RecordLock`].

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::StoreSettings;
use crate::coordination::locks::{LockManager, RecordLock};
use crate::error::{Error, Result};
use crate::task::{Task, TaskId, TaskPatch, TaskStatus, TaskSummary};

const HIGHWATER_FILE: &str = ".highwater";

/// Durable CRUD over task records.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
    locks: LockManager,
}

impl TaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, settings: &StoreSettings) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;

        let store = Self {
            locks: LockManager::new(&dir, settings),
            dir,
        };
        store.reconcile_highwater()?;
        Ok(store)
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The lock manager guarding this store's records.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Create a new pending task with the next id.
    pub fn create(&self, subject: &str, description: &str, active_form: Option<&str>) -> Result<Task> {
        let _guard = self.locks.acquire_named(HIGHWATER_FILE, "highwater")?;

        let seq = self.read_highwater()? + 1;
        // Advance the mark before the record exists: a crash in between skips
        // an id instead of handing the same id out twice.
        self.write_highwater(seq)?;

        let task = Task::new(
            TaskId::from_seq(seq),
            subject,
            description,
            active_form.filter(|s| !s.is_empty()).map(str::to_string),
        );
        self.write_record(&task)?;

        log::debug!("Created task #{}: {}", task.id, task.subject);
        Ok(task)
    }

    /// Get a task by id.
    pub fn get(&self, id: &TaskId) -> Result<Task> {
        self.read_record(id)
    }

    /// Whether a record exists for `id`.
    pub fn exists(&self, id: &TaskId) -> bool {
        self.record_path(id).is_ok_and(|path| path.exists())
    }

    /// Read-modify-write a record under its lock.
    ///
    /// The closure's error aborts the write; the lock is released either way.
    pub fn modify<T, F>(&self, id: &TaskId, f: F) -> Result<(Task, T)>
    where
        F: FnOnce(&mut Task) -> Result<T>,
    {
        let _guard = self.locks.acquire(id)?;
        let mut task = self.read_record(id)?;
        let out = f(&mut task)?;
        self.write_record(&task)?;
        Ok((task, out))
    }

    /// Apply the field part of a patch, returning the task and its previous status.
    pub fn update_fields(&self, id: &TaskId, patch: &TaskPatch, claimant: &str) -> Result<(Task, TaskStatus)> {
        let (task, previous) = self.modify(id, |task| Ok(task.apply_fields(patch, claimant)))?;
        log::debug!("Updated task #{} ({} -> {})", task.id, previous, task.status);
        Ok((task, previous))
    }

    /// All tasks in creation order, without descriptions.
    pub fn list(&self) -> Result<Vec<TaskSummary>> {
        Ok(self.load_all()?.iter().map(Task::summary).collect())
    }

    /// All full records in creation order.
    ///
    /// Unreadable records are skipped with a warning rather than failing the
    /// whole listing.
    pub fn load_all(&self) -> Result<Vec<Task>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::storage(&self.dir, e))?;

        let mut tasks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(&self.dir, e))?;
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(json) => match serde_json::from_str::<Task>(&json) {
                    Ok(task) => tasks.push(task),
                    Err(e) => log::warn!("Skipping corrupted task record {}: {}", path.display(), e),
                },
                // Deleted between read_dir and read
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to read task record {}: {}", path.display(), e),
            }
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Read a record. The caller decides whether it needs to hold the lock.
    pub(crate) fn read_record(&self, id: &TaskId) -> Result<Task> {
        let path = self.record_path(id)?;
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::TaskNotFound { id: id.to_string() }),
            Err(e) => return Err(Error::storage(&path, e)),
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Atomically replace a record. The caller must hold its lock.
    pub(crate) fn write_record(&self, task: &Task) -> Result<()> {
        let path = self.record_path(&task.id)?;
        let json = serde_json::to_string_pretty(task)?;
        write_atomic(&path, json.as_bytes())
    }

    /// Delete a record. The caller must hold its lock.
    pub(crate) fn remove_record(&self, id: &TaskId, _guard: &RecordLock) -> Result<()> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::TaskNotFound { id: id.to_string() }),
            Err(e) => Err(Error::storage(&path, e)),
        }
    }

    fn record_path(&self, id: &TaskId) -> Result<PathBuf> {
        // Only canonical sequence ids map to files; anything else cannot exist
        match id.seq() {
            Some(seq) if seq.to_string() == id.0 => Ok(self.dir.join(format!("task_{}.json", seq))),
            _ => Err(Error::TaskNotFound { id: id.to_string() }),
        }
    }

    fn read_highwater(&self) -> Result<u64> {
        let path = self.dir.join(HIGHWATER_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::storage(&path, std::io::Error::new(ErrorKind::InvalidData, "corrupt id mark"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::storage(&path, e)),
        }
    }

    fn write_highwater(&self, seq: u64) -> Result<()> {
        write_atomic(&self.dir.join(HIGHWATER_FILE), seq.to_string().as_bytes())
    }

    /// Make sure the mark is at least the largest id on disk (e.g. a store
    /// written before the mark existed, or a lost mark file).
    fn reconcile_highwater(&self) -> Result<()> {
        let _guard = self.locks.acquire_named(HIGHWATER_FILE, "highwater")?;

        let on_disk = fs::read_dir(&self.dir)
            .map_err(|e| Error::storage(&self.dir, e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_prefix("task_")?.strip_suffix(".json")?.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0);

        let mark = self.read_highwater()?;
        if on_disk > mark {
            log::info!("Raising id mark from {} to {} to match records on disk", mark, on_disk);
            self.write_highwater(on_disk)?;
        }
        Ok(())
    }
}

fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("task_") && n.ends_with(".json"))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).map_err(|e| Error::storage(&tmp, e))?;
    file.write_all(bytes).map_err(|e| Error::storage(&tmp, e))?;
    file.sync_all().map_err(|e| Error::storage(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| Error::storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, TaskStore) {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::open(temp.path().join("tasks"), &StoreSettings::default()).unwrap();
        (temp, store)
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let (_temp, store) = setup();

        let t1 = store.create("First", "", None).unwrap();
        let t2 = store.create("Second", "details", Some("Doing second")).unwrap();

        assert_eq!(t1.id, TaskId::from_seq(1));
        assert_eq!(t2.id, TaskId::from_seq(2));
        assert_eq!(t2.status, TaskStatus::Pending);
        assert!(t2.owner.is_empty());
        assert!(t2.blocks.is_empty() && t2.blocked_by.is_empty());
        assert_eq!(t2.active_form.as_deref(), Some("Doing second"));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_temp, store) = setup();
        assert!(matches!(store.get(&TaskId::from_seq(42)), Err(Error::TaskNotFound { .. })));
        assert!(matches!(store.get(&TaskId::from("../etc")), Err(Error::TaskNotFound { .. })));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tasks");

        let store = TaskStore::open(&dir, &StoreSettings::default()).unwrap();
        store.create("Persisted", "survives restart", None).unwrap();
        drop(store);

        let reopened = TaskStore::open(&dir, &StoreSettings::default()).unwrap();
        let task = reopened.get(&TaskId::from_seq(1)).unwrap();
        assert_eq!(task.subject, "Persisted");
        assert_eq!(task.description, "survives restart");
        assert_eq!(reopened.create("Next", "", None).unwrap().id, TaskId::from_seq(2));
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let (_temp, store) = setup();

        store.create("One", "", None).unwrap();
        let two = store.create("Two", "", None).unwrap();
        let guard = store.locks().acquire(&two.id).unwrap();
        store.remove_record(&two.id, &guard).unwrap();
        drop(guard);

        assert_eq!(store.create("Three", "", None).unwrap().id, TaskId::from_seq(3));
    }

    #[test]
    fn test_highwater_reconciled_from_disk() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tasks");

        let store = TaskStore::open(&dir, &StoreSettings::default()).unwrap();
        for i in 0..3 {
            store.create(&format!("Task {}", i), "", None).unwrap();
        }
        fs::remove_file(dir.join(HIGHWATER_FILE)).unwrap();

        let reopened = TaskStore::open(&dir, &StoreSettings::default()).unwrap();
        assert_eq!(reopened.create("After", "", None).unwrap().id, TaskId::from_seq(4));
    }

    #[test]
    fn test_list_in_creation_order() {
        let (_temp, store) = setup();
        for i in 1..=11 {
            store.create(&format!("Task {}", i), "long description", None).unwrap();
        }

        let list = store.list().unwrap();
        assert_eq!(list.len(), 11);
        assert_eq!(list[0].id, TaskId::from_seq(1));
        assert_eq!(list[9].id, TaskId::from_seq(10));
        assert_eq!(list[10].subject, "Task 11");

        let value = serde_json::to_value(&list[0]).unwrap();
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_modify_error_skips_write() {
        let (_temp, store) = setup();
        let task = store.create("Original", "", None).unwrap();

        let result: Result<(Task, ())> = store.modify(&task.id, |t| {
            t.subject = "Changed".to_string();
            Err(Error::Validation("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.get(&task.id).unwrap().subject, "Original");
        assert!(!store.locks().is_locked(&task.id));
    }

    #[test]
    fn test_update_fields_claims_owner() {
        let (_temp, store) = setup();
        let task = store.create("Work", "", None).unwrap();

        let (updated, previous) = store
            .update_fields(&task.id, &TaskPatch::new().status(TaskStatus::InProgress), "worker-1")
            .unwrap();
        assert_eq!(previous, TaskStatus::Pending);
        assert_eq!(updated.owner, "worker-1");
        assert_eq!(store.get(&task.id).unwrap().owner, "worker-1");
    }

    #[test]
    fn test_corrupted_record_skipped_in_list() {
        let (_temp, store) = setup();
        store.create("Good", "", None).unwrap();
        fs::write(store.dir().join("task_99.json"), "{ not json").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert!(matches!(store.get(&TaskId::from_seq(99)), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_temp, store) = setup();
        store.create("Atomic", "", None).unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_io_failure_is_storage_error_with_path() {
        let (_temp, store) = setup();
        fs::create_dir(store.dir().join("task_3.json")).unwrap();

        let err = store.get(&TaskId::from_seq(3)).unwrap_err();
        assert!(matches!(err, Error::Storage { ref path, .. } if path.ends_with("task_3.json")));
        assert!(!err.is_retryable());
    }
}
