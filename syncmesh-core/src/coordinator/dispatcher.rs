//! Task dispatcher
//!
//! Maps tasks onto agents with a [`HashRing`] and keeps one bucket of task
//! ids per agent. All operations are synchronous and linearized by a single
//! lock; nothing here performs I/O.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::hash_ring::{HashRing, RingConfig};
use crate::error::{Result, SyncError};
use crate::task::{Task, TaskKey};

#[derive(Debug)]
struct DispatcherState {
    ring: HashRing,
    /// Task id -> task
    tasks: HashMap<String, Task>,
    /// Service id -> ids of the tasks it owns
    buckets: HashMap<String, BTreeSet<String>>,
    /// Task id -> service id currently holding it
    assignments: HashMap<String, String>,
    /// Payload key -> task id
    keys: HashMap<TaskKey, String>,
}

impl DispatcherState {
    fn assign(&mut self, task_id: &str) {
        if let Some(owner) = self.ring.locate(task_id.as_bytes()) {
            let owner = owner.to_string();
            self.buckets
                .entry(owner.clone())
                .or_default()
                .insert(task_id.to_string());
            self.assignments.insert(task_id.to_string(), owner);
        }
    }

    fn unassign(&mut self, task_id: &str) {
        if let Some(owner) = self.assignments.remove(task_id) {
            if let Some(bucket) = self.buckets.get_mut(&owner) {
                bucket.remove(task_id);
            }
        }
    }

    fn detach(&mut self, task_id: &str) -> Option<Task> {
        let task = self.tasks.remove(task_id)?;
        self.unassign(task_id);
        let key = task.key();
        if self.keys.get(&key).is_some_and(|id| id == task_id) {
            self.keys.remove(&key);
        }
        Some(task)
    }

    fn rebuild(&mut self) {
        self.buckets = self
            .ring
            .members()
            .map(|m| (m.to_string(), BTreeSet::new()))
            .collect();
        self.assignments.clear();

        let ids: Vec<String> = self.tasks.keys().cloned().collect();
        for id in ids {
            self.assign(&id);
        }
    }

    fn bucket_tasks(&self, service_id: &str) -> Vec<Task> {
        self.buckets
            .get(service_id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|id| self.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Consistent-hash task dispatcher
#[derive(Debug)]
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    pub fn new(config: RingConfig) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(DispatcherState {
                ring: HashRing::new(config)?,
                tasks: HashMap::new(),
                buckets: HashMap::new(),
                assignments: HashMap::new(),
                keys: HashMap::new(),
            }),
        })
    }

    /// Add an agent and rebuild every bucket from the global task map.
    ///
    /// Adding a known agent recomputes the same buckets.
    pub fn add_service(&self, service_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ring.add(service_id)?;
        state.rebuild();

        info!(
            "Added service {} ({} services, {} tasks)",
            service_id,
            state.ring.len(),
            state.tasks.len()
        );
        Ok(())
    }

    /// Remove an agent and hand its tasks to their new owners.
    ///
    /// Only the removed agent's tasks move. With no agents left they stay in
    /// the global map unassigned.
    pub fn del_service(&self, service_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.buckets.contains_key(service_id) {
            return Err(SyncError::ServiceNotFound {
                service_id: service_id.to_string(),
            });
        }

        state.ring.remove(service_id)?;
        let orphaned = state.buckets.remove(service_id).unwrap_or_default();
        for task_id in &orphaned {
            state.assignments.remove(task_id);
            state.assign(task_id);
        }

        info!(
            "Removed service {}, relocated {} tasks ({} services left)",
            service_id,
            orphaned.len(),
            state.ring.len()
        );
        Ok(())
    }

    /// Insert or replace a task and place it on its owner's bucket.
    ///
    /// A task carrying a payload key already held by another task id
    /// replaces that task.
    pub fn add_task(&self, task: Task) -> Result<()> {
        task.validate()?;
        let mut state = self.state.lock();

        state.detach(&task.id);
        let key = task.key();
        if let Some(previous) = state.keys.get(&key).cloned() {
            debug!("Task {} replaces task {} for {}", task.id, previous, key);
            state.detach(&previous);
        }

        let id = task.id.clone();
        state.keys.insert(key, id.clone());
        state.tasks.insert(id.clone(), task);
        state.assign(&id);

        debug!(
            "Added task {} (owner={:?}, total={})",
            id,
            state.assignments.get(&id),
            state.tasks.len()
        );
        Ok(())
    }

    /// Remove the task registered under a payload key. Absent keys are a no-op.
    pub fn remove_task_by_key(&self, key: &TaskKey) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(task_id) = state.keys.get(key).cloned() {
            state.detach(&task_id);
            debug!("Removed task {} for {}", task_id, key);
        }
        Ok(())
    }

    /// Remove a task by id, returning it if it existed
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().detach(task_id)
    }

    /// Snapshot of one agent's bucket. Unknown agents have no tasks.
    pub fn tasks_by_service(&self, service_id: &str) -> Vec<Task> {
        self.state.lock().bucket_tasks(service_id)
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.values().cloned().collect()
    }

    pub fn task_by_key(&self, key: &TaskKey) -> Option<Task> {
        let state = self.state.lock();
        state.keys.get(key).and_then(|id| state.tasks.get(id)).cloned()
    }

    pub fn contains_key(&self, key: &TaskKey) -> bool {
        self.state.lock().keys.contains_key(key)
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Tasks waiting for an agent to join
    pub fn unassigned_count(&self) -> usize {
        let state = self.state.lock();
        state.tasks.len() - state.assignments.len()
    }

    /// Agent currently holding a task
    pub fn owner_of(&self, task_id: &str) -> Option<String> {
        self.state.lock().assignments.get(task_id).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut services: Vec<String> = state.buckets.keys().cloned().collect();
        services.sort();
        services
    }

    /// Every bucket keyed by agent, for pushing in one pass
    pub fn snapshot(&self) -> HashMap<String, Vec<Task>> {
        let state = self.state.lock();
        state
            .buckets
            .keys()
            .map(|service| (service.clone(), state.bucket_tasks(service)))
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            state: Mutex::new(DispatcherState {
                ring: HashRing::default(),
                tasks: HashMap::new(),
                buckets: HashMap::new(),
                assignments: HashMap::new(),
                keys: HashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskPayload, TaskType};
    use std::time::Duration;

    fn idl_task(id: &str, idl_id: i64) -> Task {
        Task::with_id(id, TaskPayload::SyncIdl { idl_id }, Duration::from_secs(60))
    }

    #[test]
    fn test_add_task_without_services_is_unassigned() {
        let dispatcher = Dispatcher::default();
        dispatcher.add_task(idl_task("t1", 1)).unwrap();

        assert_eq!(dispatcher.task_count(), 1);
        assert_eq!(dispatcher.unassigned_count(), 1);
        assert!(dispatcher.owner_of("t1").is_none());

        dispatcher.add_service("agent-1").unwrap();
        assert_eq!(dispatcher.unassigned_count(), 0);
        assert_eq!(dispatcher.owner_of("t1").as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_same_key_replaces_task() {
        let dispatcher = Dispatcher::default();
        dispatcher.add_service("agent-1").unwrap();
        dispatcher.add_task(idl_task("t1", 5)).unwrap();
        dispatcher.add_task(idl_task("t2", 5)).unwrap();

        assert_eq!(dispatcher.task_count(), 1);
        let key = TaskKey::new(TaskType::SyncIdl, 5);
        assert_eq!(dispatcher.task_by_key(&key).unwrap().id, "t2");
        assert_eq!(dispatcher.tasks_by_service("agent-1").len(), 1);
    }

    #[test]
    fn test_readding_task_id_does_not_duplicate() {
        let dispatcher = Dispatcher::default();
        dispatcher.add_service("agent-1").unwrap();
        dispatcher.add_task(idl_task("t1", 1)).unwrap();
        dispatcher.add_task(idl_task("t1", 1)).unwrap();

        assert_eq!(dispatcher.task_count(), 1);
        assert_eq!(dispatcher.tasks_by_service("agent-1").len(), 1);
    }

    #[test]
    fn test_remove_by_key() {
        let dispatcher = Dispatcher::default();
        dispatcher.add_service("agent-1").unwrap();
        dispatcher.add_task(idl_task("t1", 9)).unwrap();

        let key = TaskKey::new(TaskType::SyncIdl, 9);
        dispatcher.remove_task_by_key(&key).unwrap();
        assert_eq!(dispatcher.task_count(), 0);
        assert!(dispatcher.tasks_by_service("agent-1").is_empty());

        // Absent key is a no-op
        dispatcher.remove_task_by_key(&key).unwrap();
    }

    #[test]
    fn test_del_last_service_keeps_tasks() {
        let dispatcher = Dispatcher::default();
        dispatcher.add_service("agent-1").unwrap();
        dispatcher.add_task(idl_task("t1", 1)).unwrap();

        dispatcher.del_service("agent-1").unwrap();
        assert_eq!(dispatcher.task_count(), 1);
        assert_eq!(dispatcher.unassigned_count(), 1);
        assert!(dispatcher.services().is_empty());
    }

    #[test]
    fn test_invalid_task_rejected() {
        let dispatcher = Dispatcher::default();
        let mut task = idl_task("t1", 1);
        task.task_type = TaskType::SyncRepo;
        assert!(dispatcher.add_task(task).is_err());
        assert_eq!(dispatcher.task_count(), 0);
    }
}
