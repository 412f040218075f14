use crate::errors::{AppError, AppResult};
use crate::models::{AccessLevel, AppData, HubSettings, NotificationItem, ServiceRecord, User};
use crate::notifications::NOTIFICATION_LIMIT;
use crate::policy::validate_settings;
use crate::remote::WriteSet;
use crate::users::{hash_password, user_key};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BOOTSTRAP_ADMIN_NAME: &str = "Admin";

/// Local backend: holds portal state when no remote server is configured, and settings always.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn load_app_data(&self) -> AppResult<AppData> {
        let conn = self.lock()?;
        let mut data = AppData::default();

        let mut statement = conn.prepare("SELECT service_id, record_json FROM services ORDER BY service_id")?;
        let services = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (service_id, raw) in services {
            match serde_json::from_str::<ServiceRecord>(&raw) {
                Ok(record) => {
                    data.services_data.insert(service_id, record);
                }
                Err(error) => {
                    tracing::warn!(service_id = %service_id, error = %error, "skipping unreadable service record");
                }
            }
        }

        let mut statement = conn.prepare("SELECT item_json FROM notifications ORDER BY position ASC")?;
        let notifications = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        data.notifications = notifications
            .iter()
            .filter_map(|raw| serde_json::from_str::<NotificationItem>(raw).ok())
            .take(NOTIFICATION_LIMIT)
            .collect();

        let mut statement = conn.prepare("SELECT name_key, user_json FROM users ORDER BY name_key")?;
        let users = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (key, raw) in users {
            let user: User = serde_json::from_str(&raw)?;
            data.users.insert(key, user);
        }

        Ok(data)
    }

    pub fn save_service(&self, service_id: &str, record: &ServiceRecord) -> AppResult<()> {
        let conn = self.lock()?;
        upsert_service(&conn, service_id, record)
    }

    /// Replaces the stored log; only the newest entries up to the cap are kept.
    pub fn replace_notifications(&self, notifications: &[NotificationItem]) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_notifications(&tx, notifications)?;
        tx.commit()?;
        Ok(())
    }

    pub fn save_user(&self, key: &str, user: &User) -> AppResult<()> {
        let conn = self.lock()?;
        upsert_user(&conn, key, user)
    }

    pub fn delete_user(&self, key: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM users WHERE name_key = ?1", [key])?;
        Ok(removed > 0)
    }

    /// Writes every touched part of `state` in one transaction; nothing is kept on failure.
    pub fn apply_writes(&self, writes: &WriteSet, state: &AppData) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for service_id in &writes.services {
            let record = state.services_data.get(service_id).cloned().unwrap_or_default();
            upsert_service(&tx, service_id, &record)?;
        }
        for key in &writes.users {
            if let Some(user) = state.users.get(key) {
                upsert_user(&tx, key, user)?;
            }
        }
        for key in &writes.deleted_users {
            tx.execute("DELETE FROM users WHERE name_key = ?1", [key])?;
        }
        if writes.notifications {
            write_notifications(&tx, &state.notifications)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Seeds an admin account on a fresh store so the portal can be administered at all.
    pub fn ensure_bootstrap_admin(&self, password: &str) -> AppResult<bool> {
        let existing: i64 = {
            let conn = self.lock()?;
            conn.query_row("SELECT COUNT(1) FROM users", [], |row| row.get(0))?
        };
        if existing > 0 {
            return Ok(false);
        }
        let admin = User {
            name: BOOTSTRAP_ADMIN_NAME.to_string(),
            avatar: HubSettings::default().default_avatar,
            access_level: AccessLevel::Admin,
            password: Some(hash_password(password)),
            force_password_change: Some(true),
        };
        self.save_user(&user_key(&admin.name), &admin)?;
        tracing::info!(user = BOOTSTRAP_ADMIN_NAME, "seeded bootstrap admin account");
        Ok(true)
    }

    pub fn get_settings(&self) -> AppResult<HubSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'hub'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(HubSettings::default());
        };
        match serde_json::from_str::<HubSettings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                tracing::warn!(error = %error, "unreadable settings row; using defaults");
                Ok(HubSettings::default())
            }
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<HubSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: HubSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("Invalid settings: {}", error)))?;
        validate_settings(&settings)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('hub', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES ('hub', ?1, ?2)",
            params![
                serde_json::to_string(&HubSettings::default())?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn upsert_service(conn: &Connection, service_id: &str, record: &ServiceRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO services (service_id, record_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(service_id) DO UPDATE SET record_json = excluded.record_json, updated_at = excluded.updated_at",
        params![service_id, serde_json::to_string(record)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn upsert_user(conn: &Connection, key: &str, user: &User) -> AppResult<()> {
    conn.execute(
        "INSERT INTO users (name_key, user_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(name_key) DO UPDATE SET user_json = excluded.user_json, updated_at = excluded.updated_at",
        params![key, serde_json::to_string(user)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn write_notifications(conn: &Connection, notifications: &[NotificationItem]) -> AppResult<()> {
    conn.execute("DELETE FROM notifications", [])?;
    let mut insert =
        conn.prepare("INSERT INTO notifications (id, position, item_json, created_at) VALUES (?1, ?2, ?3, ?4)")?;
    for (position, item) in notifications.iter().take(NOTIFICATION_LIMIT).enumerate() {
        insert.execute(params![
            item.id,
            position as i64,
            serde_json::to_string(item)?,
            item.timestamp.to_rfc3339()
        ])?;
    }
    Ok(())
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
