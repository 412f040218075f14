pub mod local;
pub mod rest;

use crate::errors::AppResult;
use crate::models::{AppData, NotificationItem, ServiceRecord, User};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// The source of truth the optimistic store confirms against.
#[async_trait]
pub trait Remote: Send + Sync {
    fn name(&self) -> &'static str;
    async fn bootstrap(&self) -> AppResult<AppData>;
    async fn save_service(&self, service_id: &str, record: &ServiceRecord) -> AppResult<()>;
    async fn save_notifications(&self, notifications: &[NotificationItem]) -> AppResult<()>;
    async fn save_user(&self, key: &str, user: &User) -> AppResult<()>;
    async fn delete_user(&self, key: &str) -> AppResult<()>;

    /// Commits one mutation's writes. Backends that can write atomically override this.
    async fn apply_writes(&self, writes: &WriteSet, state: &AppData) -> AppResult<()> {
        push_each(self, writes, state).await
    }
}

/// The parts of `AppData` a mutation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub services: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub deleted_users: BTreeSet<String>,
    pub notifications: bool,
}

impl WriteSet {
    pub fn service(service_id: &str) -> Self {
        let mut writes = Self {
            notifications: true,
            ..Self::default()
        };
        writes.services.insert(service_id.to_string());
        writes
    }

    pub fn user(key: &str) -> Self {
        let mut writes = Self::default();
        writes.users.insert(key.to_string());
        writes
    }

    pub fn deleted_user(key: &str) -> Self {
        let mut writes = Self::default();
        writes.deleted_users.insert(key.to_string());
        writes
    }

    pub fn notifications_only() -> Self {
        Self {
            notifications: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.users.is_empty() && self.deleted_users.is_empty() && !self.notifications
    }
}

/// Sends every touched part of `state` to the remote.
pub async fn push_writes(remote: &dyn Remote, writes: &WriteSet, state: &AppData) -> AppResult<()> {
    remote.apply_writes(writes, state).await?;
    tracing::debug!(remote = remote.name(), services = writes.services.len(), "pushed writes");
    Ok(())
}

/// One call per touched part, stopping at the first failure.
async fn push_each<R: Remote + ?Sized>(remote: &R, writes: &WriteSet, state: &AppData) -> AppResult<()> {
    for service_id in &writes.services {
        let record = state.services_data.get(service_id).cloned().unwrap_or_default();
        remote.save_service(service_id, &record).await?;
    }
    for key in &writes.users {
        if let Some(user) = state.users.get(key) {
            remote.save_user(key, user).await?;
        }
    }
    for key in &writes.deleted_users {
        remote.delete_user(key).await?;
    }
    if writes.notifications {
        remote.save_notifications(&state.notifications).await?;
    }
    Ok(())
}
