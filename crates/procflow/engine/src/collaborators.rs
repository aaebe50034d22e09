//! Collaborator boundaries: tasks, directory, notification delivery
//!
//! The engine never owns these concerns. Embedding applications hand
//! in implementations; the in-memory ones here back the test suites
//! and small deployments.

use procflow_types::{
    EngineError, EngineResult, NotificationRequest, TaskId, TaskStatus, TriggerTask, UserId,
};
use std::collections::HashMap;
use std::sync::Mutex;

// ── Traits ───────────────────────────────────────────────────────────

/// The trigger entity store: where tasks live.
///
/// Status and assignee writes must be idempotent — the engine may
/// re-apply an effect during replay.
pub trait TaskStore: Send + Sync {
    fn get(&self, id: &TaskId) -> EngineResult<TriggerTask>;
    fn set_status(&self, id: &TaskId, status: TaskStatus) -> EngineResult<()>;
    fn set_assignee(&self, id: &TaskId, assignee: &UserId) -> EngineResult<()>;
}

/// What a directory lookup resolves against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryScope {
    Role,
    Group,
    Department,
}

impl std::fmt::Display for DirectoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Role => "role",
            Self::Group => "group",
            Self::Department => "department",
        };
        write!(f, "{}", s)
    }
}

/// Resolves managers and named principals
pub trait Directory: Send + Sync {
    /// One hop up the management chain; `None` when there is nobody
    fn manager_of(&self, user: &UserId) -> Option<UserId>;
    /// Resolve a role/group/department name to a user
    fn resolve_principal(&self, scope: DirectoryScope, name: &str) -> Option<UserId>;
}

/// Delivers notification requests; called exactly once per request
pub trait NotificationSender: Send + Sync {
    fn send(&self, request: &NotificationRequest) -> Result<(), String>;
}

// ── In-memory implementations ────────────────────────────────────────

/// Task store backed by a mutex-guarded map
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, TriggerTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: TriggerTask) {
        let mut tasks = self.tasks.lock().expect("task store lock");
        tasks.insert(task.id.clone(), task);
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, id: &TaskId) -> EngineResult<TriggerTask> {
        let tasks = self.tasks.lock().map_err(|_| EngineError::LockPoisoned)?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.clone()))
    }

    fn set_status(&self, id: &TaskId, status: TaskStatus) -> EngineResult<()> {
        let mut tasks = self.tasks.lock().map_err(|_| EngineError::LockPoisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
        task.status = status;
        Ok(())
    }

    fn set_assignee(&self, id: &TaskId, assignee: &UserId) -> EngineResult<()> {
        let mut tasks = self.tasks.lock().map_err(|_| EngineError::LockPoisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
        task.assignee = Some(assignee.clone());
        Ok(())
    }
}

/// Directory backed by plain maps
#[derive(Default)]
pub struct InMemoryDirectory {
    managers: Mutex<HashMap<UserId, UserId>>,
    principals: Mutex<HashMap<(DirectoryScope, String), UserId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_manager(&self, user: UserId, manager: UserId) {
        let mut managers = self.managers.lock().expect("directory lock");
        managers.insert(user, manager);
    }

    pub fn set_principal(&self, scope: DirectoryScope, name: impl Into<String>, user: UserId) {
        let mut principals = self.principals.lock().expect("directory lock");
        principals.insert((scope, name.into()), user);
    }
}

impl Directory for InMemoryDirectory {
    fn manager_of(&self, user: &UserId) -> Option<UserId> {
        let managers = self.managers.lock().ok()?;
        managers.get(user).cloned()
    }

    fn resolve_principal(&self, scope: DirectoryScope, name: &str) -> Option<UserId> {
        let principals = self.principals.lock().ok()?;
        principals.get(&(scope, name.to_string())).cloned()
    }
}

/// Sender that records every request; failure can be injected per
/// channel to exercise the delivery-failure path
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<NotificationRequest>>,
    fail_channels: Mutex<Vec<procflow_types::NotificationChannel>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send on this channel fail
    pub fn fail_channel(&self, channel: procflow_types::NotificationChannel) {
        self.fail_channels
            .lock()
            .expect("sender lock")
            .push(channel);
    }

    /// Everything handed to the sender so far
    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().expect("sender lock").clone()
    }
}

impl NotificationSender for RecordingSender {
    fn send(&self, request: &NotificationRequest) -> Result<(), String> {
        let failing = self
            .fail_channels
            .lock()
            .map_err(|_| "sender lock poisoned".to_string())?;
        if failing.contains(&request.channel) {
            return Err(format!("channel {} unavailable", request.channel));
        }
        drop(failing);
        self.sent
            .lock()
            .map_err(|_| "sender lock poisoned".to_string())?
            .push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_store_round_trip() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::new("t1");
        store.insert(TriggerTask::new(id.clone(), "Review"));

        store.set_status(&id, TaskStatus::InProgress).unwrap();
        store.set_assignee(&id, &UserId::new("bob")).unwrap();

        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee, Some(UserId::new("bob")));
    }

    #[test]
    fn test_missing_task_errors() {
        let store = InMemoryTaskStore::new();
        assert!(matches!(
            store.get(&TaskId::new("ghost")),
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_directory_manager_hop() {
        let dir = InMemoryDirectory::new();
        dir.set_manager(UserId::new("alice"), UserId::new("boss"));
        assert_eq!(
            dir.manager_of(&UserId::new("alice")),
            Some(UserId::new("boss"))
        );
        assert_eq!(dir.manager_of(&UserId::new("boss")), None);
    }

    #[test]
    fn test_directory_principal_scopes() {
        let dir = InMemoryDirectory::new();
        dir.set_principal(DirectoryScope::Role, "finance", UserId::new("cfo"));
        assert_eq!(
            dir.resolve_principal(DirectoryScope::Role, "finance"),
            Some(UserId::new("cfo"))
        );
        assert_eq!(
            dir.resolve_principal(DirectoryScope::Group, "finance"),
            None
        );
    }
}
