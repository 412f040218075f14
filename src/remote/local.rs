use super::{Remote, WriteSet};
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{AppData, NotificationItem, ServiceRecord, User};
use async_trait::async_trait;

#[async_trait]
impl Remote for Database {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn bootstrap(&self) -> AppResult<AppData> {
        self.load_app_data()
    }

    async fn save_service(&self, service_id: &str, record: &ServiceRecord) -> AppResult<()> {
        Database::save_service(self, service_id, record)
    }

    async fn save_notifications(&self, notifications: &[NotificationItem]) -> AppResult<()> {
        self.replace_notifications(notifications)
    }

    async fn save_user(&self, key: &str, user: &User) -> AppResult<()> {
        Database::save_user(self, key, user)
    }

    async fn delete_user(&self, key: &str) -> AppResult<()> {
        Database::delete_user(self, key)?;
        Ok(())
    }

    async fn apply_writes(&self, writes: &WriteSet, state: &AppData) -> AppResult<()> {
        Database::apply_writes(self, writes, state)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::models::{AppData, ServiceData};
    use crate::notifications::{build_notification, ChangeNotice, ChangeVerb};
    use crate::remote::{push_writes, Remote, WriteSet};
    use crate::services::upsert_flat_item;
    use chrono::Utc;

    #[tokio::test]
    async fn local_backend_persists_pushed_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");

        let mut state = AppData::default();
        upsert_flat_item(&mut state, "repository", serde_json::json!({ "id": "f1", "name": "guide.pdf" }))
            .expect("upsert");
        push_writes(&db, &WriteSet::service("repository"), &state)
            .await
            .expect("push");

        let loaded = db.bootstrap().await.expect("bootstrap");
        let Some(ServiceData::Flat(items)) = &loaded.services_data["repository"].data else {
            panic!("expected flat data");
        };
        assert_eq!(items[0]["name"], "guide.pdf");
    }

    #[tokio::test]
    async fn failed_notification_write_keeps_the_service_unsaved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");

        let mut state = AppData::default();
        upsert_flat_item(&mut state, "news", serde_json::json!({ "id": "n1", "headline": "Hi" })).expect("upsert");
        let duplicate = build_notification(
            &ChangeNotice {
                actor: "Alice",
                verb: ChangeVerb::Added,
                subject: "Hi",
                service_id: "news",
                category_name: None,
                item_id: Some("n1"),
            },
            Utc::now(),
        );
        state.notifications = vec![duplicate.clone(), duplicate];

        let result = push_writes(&db, &WriteSet::service("news"), &state).await;
        assert!(result.is_err());

        let loaded = db.bootstrap().await.expect("bootstrap");
        assert!(!loaded.services_data.contains_key("news"));
        assert!(loaded.notifications.is_empty());
    }
}
