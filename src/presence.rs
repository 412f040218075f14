use crate::models::PresenceEntry;
use crate::users::user_key;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Who is connected right now, keyed by lower-cased user name.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    entries: Arc<Mutex<HashMap<String, PresenceEntry>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the user was not already online.
    pub async fn join(&self, username: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().await;
        let key = user_key(username);
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.last_seen = now;
                false
            }
            None => {
                entries.insert(
                    key,
                    PresenceEntry {
                        username: username.trim().to_string(),
                        connected_at: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Refreshes an existing entry; unknown users are joined.
    pub async fn heartbeat(&self, username: &str, now: DateTime<Utc>) -> bool {
        self.join(username, now).await
    }

    pub async fn leave(&self, username: &str) -> bool {
        let mut entries = self.entries.lock().await;
        entries.remove(&user_key(username)).is_some()
    }

    pub async fn online(&self) -> Vec<PresenceEntry> {
        let entries = self.entries.lock().await;
        let mut online: Vec<PresenceEntry> = entries.values().cloned().collect();
        online.sort_by(|left, right| left.username.to_lowercase().cmp(&right.username.to_lowercase()));
        online
    }

    /// Drops entries idle longer than `timeout`; returns the removed user names.
    pub async fn prune(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now - entry.last_seen > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(entry) = entries.remove(&key) {
                removed.push(entry.username);
            }
        }
        removed.sort();
        removed
    }
}
