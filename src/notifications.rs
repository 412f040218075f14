use crate::errors::{AppError, AppResult};
use crate::models::{AppData, NotificationItem};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const NOTIFICATION_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerb {
    Added,
    Updated,
    Deleted,
    Imported,
    Scheduled,
    Canceled,
    Recorded,
}

impl ChangeVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Imported => "imported",
            Self::Scheduled => "scheduled",
            Self::Canceled => "canceled",
            Self::Recorded => "recorded",
        }
    }

    fn preposition(self) -> &'static str {
        match self {
            Self::Added | Self::Imported | Self::Scheduled | Self::Recorded => "to",
            Self::Updated => "in",
            Self::Deleted | Self::Canceled => "from",
        }
    }
}

/// What changed, as far as the notification log cares.
#[derive(Debug, Clone)]
pub struct ChangeNotice<'a> {
    pub actor: &'a str,
    pub verb: ChangeVerb,
    pub subject: &'a str,
    pub service_id: &'a str,
    pub category_name: Option<&'a str>,
    pub item_id: Option<&'a str>,
}

pub fn build_notification(change: &ChangeNotice<'_>, now: DateTime<Utc>) -> NotificationItem {
    let location = match change.category_name {
        Some(category) => format!("{} / {}", change.service_id, category),
        None => change.service_id.to_string(),
    };
    let message = format!(
        "{} {} \"{}\" {} {}",
        change.actor,
        change.verb.as_str(),
        change.subject,
        change.verb.preposition(),
        location
    );

    let mut read_by = BTreeSet::new();
    read_by.insert(change.actor.to_lowercase());

    NotificationItem {
        id: Uuid::new_v4().to_string(),
        message,
        timestamp: now,
        service_id: change.service_id.to_string(),
        category_name: change.category_name.map(ToString::to_string),
        item_id: change.item_id.map(ToString::to_string),
        read_by,
        author: change.actor.to_string(),
    }
}

/// Newest first; anything past the limit falls off the end.
pub fn push_notification(log: &mut Vec<NotificationItem>, item: NotificationItem) {
    log.insert(0, item);
    log.truncate(NOTIFICATION_LIMIT);
}

pub fn notify(state: &mut AppData, change: &ChangeNotice<'_>, now: DateTime<Utc>) {
    push_notification(&mut state.notifications, build_notification(change, now));
}

pub fn mark_read(mut state: AppData, notification_id: &str, username: &str) -> AppResult<AppData> {
    let reader = username.trim().to_lowercase();
    let Some(item) = state
        .notifications
        .iter_mut()
        .find(|item| item.id == notification_id)
    else {
        return Err(AppError::NotFound(format!("notification {}", notification_id)));
    };
    item.read_by.insert(reader);
    Ok(state)
}

pub fn mark_all_read(mut state: AppData, username: &str) -> AppData {
    let reader = username.trim().to_lowercase();
    for item in &mut state.notifications {
        item.read_by.insert(reader.clone());
    }
    state
}

pub fn unread_count(state: &AppData, username: &str) -> usize {
    let reader = username.trim().to_lowercase();
    state
        .notifications
        .iter()
        .filter(|item| !item.read_by.contains(&reader))
        .count()
}
