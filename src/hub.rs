use crate::analytics::{forecast_comments, record_comment_analysis, COMMENT_ANALYSIS_SERVICE_ID};
use crate::archive::LegacyArchive;
use crate::breaks::{breaks_on, cancel_break, schedule_break, BREAKS_SERVICE_ID};
use crate::config::HubConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AddCategoryPayload, AppData, ArchivePage, ArchiveQuery, ArchiveTable, BooleanResponse, BreakSlot,
    ChangePasswordPayload, CommentForecast, CommentSample, CreateUserPayload, DeleteCategoryPayload,
    DeleteItemPayload, HubEnvelope, HubSettings, ImportServicePayload, LoginPayload, PresenceEntry,
    RecordCommentAnalysisPayload, ResetPasswordPayload, SaveItemPayload, ScheduleBreakPayload, SessionInfo,
    StateSnapshot, UpdateUserPayload, User,
};
use crate::notifications::{mark_all_read, mark_read, unread_count};
use crate::presence::PresenceTracker;
use crate::remote::rest::RestRemote;
use crate::remote::{push_writes, Remote, WriteSet};
use crate::services::{self, MutationContext};
use crate::session::SessionManager;
use crate::store::OptimisticStore;
use crate::users::{self, find_user, user_key};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Tauri event name the desktop shell forwards `HubEnvelope`s under.
pub const HUB_EVENT: &str = "hub_event";

const EVENT_CAPACITY: usize = 256;
const MAX_PRESENCE_TIMEOUT_SECONDS: i64 = 7 * 24 * 3600;

/// Everything below the UI: state, persistence, presence, archive and settings.
#[derive(Clone)]
pub struct HubCore {
    store: Arc<OptimisticStore<AppData>>,
    remote: Arc<dyn Remote>,
    db: Arc<Database>,
    presence: PresenceTracker,
    sessions: SessionManager,
    archive: Arc<RwLock<Option<Arc<LegacyArchive>>>>,
    events: broadcast::Sender<HubEnvelope>,
}

impl HubCore {
    /// Uses the REST backend when a remote URL is configured, the local database otherwise.
    pub fn new(config: HubConfig) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&config.database_path())?);
        let remote: Arc<dyn Remote> = match config.remote_url.as_deref() {
            Some(url) => Arc::new(RestRemote::new(url, config.remote_token.clone())?) as Arc<dyn Remote>,
            None => {
                if db.ensure_bootstrap_admin(&config.bootstrap_password)? {
                    tracing::warn!("fresh local store; sign in as Admin and change the bootstrap password");
                }
                db.clone() as Arc<dyn Remote>
            }
        };
        tracing::info!(remote = remote.name(), data_dir = %config.data_dir.display(), "hub core initialized");
        Ok(Self::assemble(db, remote))
    }

    pub fn with_remote(config: HubConfig, remote: Arc<dyn Remote>) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&config.database_path())?);
        Ok(Self::assemble(db, remote))
    }

    fn assemble(db: Arc<Database>, remote: Arc<dyn Remote>) -> Arc<Self> {
        let (events, _receiver) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            store: Arc::new(OptimisticStore::default()),
            remote,
            db,
            presence: PresenceTracker::new(),
            sessions: SessionManager::new(),
            archive: Arc::new(RwLock::new(None)),
            events,
        })
    }

    pub fn store(&self) -> &OptimisticStore<AppData> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEnvelope> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let published = self.store.published();
        StateSnapshot {
            revision: published.revision,
            data: published.state.redacted(),
        }
    }

    pub async fn bootstrap(&self) -> AppResult<StateSnapshot> {
        let data = self.remote.bootstrap().await?;
        let revision = self.store.replace(data);
        tracing::info!(remote = self.remote.name(), revision, "bootstrapped portal state");
        self.emit("state_changed", json!({ "revision": revision, "action": "bootstrap" }));
        Ok(self.snapshot())
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let envelope = HubEnvelope {
            r#type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            event_id: Uuid::new_v4().to_string(),
        };
        let _ = self.events.send(envelope);
    }

    fn actor(&self, username: &str) -> AppResult<User> {
        let state = self.store.current();
        find_user(&state, username)
            .cloned()
            .map_err(|_| AppError::Policy(format!("Unknown user '{}'", username.trim())))
    }

    /// Runs `transform` through the optimistic store and pushes `writes` to the remote.
    async fn mutate<F>(&self, action: &'static str, writes: WriteSet, transform: F) -> AppResult<StateSnapshot>
    where
        F: FnOnce(AppData) -> AppResult<AppData>,
    {
        let remote = Arc::clone(&self.remote);
        let result = self
            .store
            .apply_optimistic(transform, move |state| async move {
                push_writes(remote.as_ref(), &writes, &state)
                    .await
                    .map_err(|error| match error {
                        AppError::Remote(message) => AppError::Remote(message),
                        other => AppError::Remote(other.to_string()),
                    })
            })
            .await;

        match result {
            Ok(state) => {
                let revision = self.store.revision();
                tracing::info!(action, revision, "mutation committed");
                self.emit("state_changed", json!({ "revision": revision, "action": action }));
                Ok(StateSnapshot {
                    revision,
                    data: state.redacted(),
                })
            }
            Err(AppError::Remote(message)) => {
                self.emit(
                    "state_rolled_back",
                    json!({ "revision": self.store.revision(), "action": action, "error": message }),
                );
                Err(AppError::Remote(message))
            }
            Err(error) => {
                tracing::debug!(action, error = %error, "mutation rejected locally");
                Err(error)
            }
        }
    }

    pub fn get_settings(&self) -> AppResult<HubSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, actor: &str, update: serde_json::Value) -> AppResult<HubSettings> {
        let actor = self.actor(actor)?;
        crate::policy::require_admin(&actor, "Changing settings")?;
        let settings = self.db.update_settings(update)?;
        self.emit("settings_changed", serde_json::to_value(&settings)?);
        Ok(settings)
    }

    pub async fn add_category(&self, actor: &str, payload: AddCategoryPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let writes = WriteSet::service(&payload.service_id);
        self.mutate("add_category", writes, |state| {
            services::add_category(state, MutationContext { actor: &actor, now: Utc::now() }, &payload)
        })
        .await
    }

    pub async fn delete_category(&self, actor: &str, payload: DeleteCategoryPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let writes = WriteSet::service(&payload.service_id);
        self.mutate("delete_category", writes, |state| {
            services::delete_category(state, MutationContext { actor: &actor, now: Utc::now() }, &payload)
        })
        .await
    }

    pub async fn save_item(&self, actor: &str, payload: SaveItemPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let writes = WriteSet::service(&payload.service_id);
        self.mutate("save_item", writes, |state| {
            services::save_item(state, MutationContext { actor: &actor, now: Utc::now() }, &payload)
        })
        .await
    }

    pub async fn delete_item(&self, actor: &str, payload: DeleteItemPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let writes = WriteSet::service(&payload.service_id);
        self.mutate("delete_item", writes, |state| {
            services::delete_item(state, MutationContext { actor: &actor, now: Utc::now() }, &payload)
        })
        .await
    }

    pub async fn import_service(&self, actor: &str, payload: ImportServicePayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let writes = WriteSet::service(&payload.service_id);
        self.mutate("import_service", writes, |state| {
            services::import_service_data(state, MutationContext { actor: &actor, now: Utc::now() }, &payload)
        })
        .await
    }

    pub async fn schedule_break(&self, actor: &str, payload: ScheduleBreakPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let settings = self.db.get_settings()?;
        self.mutate("schedule_break", WriteSet::service(BREAKS_SERVICE_ID), |state| {
            schedule_break(
                state,
                MutationContext { actor: &actor, now: Utc::now() },
                &payload,
                &settings,
            )
        })
        .await
    }

    pub async fn cancel_break(&self, actor: &str, break_id: &str) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        self.mutate("cancel_break", WriteSet::service(BREAKS_SERVICE_ID), |state| {
            cancel_break(state, MutationContext { actor: &actor, now: Utc::now() }, break_id)
        })
        .await
    }

    pub fn breaks_on(&self, day: NaiveDate) -> AppResult<Vec<BreakSlot>> {
        breaks_on(&self.store.current(), day)
    }

    pub fn forecast_comments(&self, samples: &[CommentSample], horizon_hours: Option<u32>) -> AppResult<CommentForecast> {
        let horizon = match horizon_hours {
            Some(hours) => hours,
            None => self.db.get_settings()?.forecast_horizon_hours,
        };
        forecast_comments(samples, horizon)
    }

    pub async fn record_comment_analysis(
        &self,
        actor: &str,
        payload: RecordCommentAnalysisPayload,
    ) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let default_horizon = self.db.get_settings()?.forecast_horizon_hours;
        self.mutate(
            "record_comment_analysis",
            WriteSet::service(COMMENT_ANALYSIS_SERVICE_ID),
            |state| {
                record_comment_analysis(
                    state,
                    MutationContext { actor: &actor, now: Utc::now() },
                    &payload,
                    default_horizon,
                )
            },
        )
        .await
    }

    pub async fn mark_notification_read(&self, username: &str, notification_id: &str) -> AppResult<StateSnapshot> {
        let reader = self.actor(username)?;
        self.mutate("mark_notification_read", WriteSet::notifications_only(), |state| {
            mark_read(state, notification_id, &reader.name)
        })
        .await
    }

    pub async fn mark_all_notifications_read(&self, username: &str) -> AppResult<StateSnapshot> {
        let reader = self.actor(username)?;
        self.mutate("mark_all_notifications_read", WriteSet::notifications_only(), |state| {
            Ok(mark_all_read(state, &reader.name))
        })
        .await
    }

    pub fn unread_count(&self, username: &str) -> usize {
        unread_count(&self.store.current(), username)
    }

    pub async fn create_user(&self, actor: &str, payload: CreateUserPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let default_avatar = self.db.get_settings()?.default_avatar;
        self.mutate("create_user", WriteSet::user(&user_key(&payload.name)), |state| {
            users::create_user(state, &actor, &payload, &default_avatar)
        })
        .await
    }

    pub async fn update_user(&self, actor: &str, payload: UpdateUserPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let key = user_key(&payload.name);
        let snapshot = self
            .mutate("update_user", WriteSet::user(&key), |state| {
                users::update_user(state, &actor, &payload)
            })
            .await?;
        if let Some(user) = snapshot.data.users.get(&key) {
            self.sessions.refresh_user(user).await;
        }
        Ok(snapshot)
    }

    pub async fn change_password(&self, actor: &str, payload: ChangePasswordPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let key = user_key(&actor.name);
        let snapshot = self
            .mutate("change_password", WriteSet::user(&key), |state| {
                users::change_password(state, &actor, &payload)
            })
            .await?;
        if let Some(user) = snapshot.data.users.get(&key) {
            self.sessions.refresh_user(user).await;
        }
        Ok(snapshot)
    }

    pub async fn reset_password(&self, actor: &str, payload: ResetPasswordPayload) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        self.mutate("reset_password", WriteSet::user(&user_key(&payload.name)), |state| {
            users::reset_password(state, &actor, &payload)
        })
        .await
    }

    pub async fn delete_user(&self, actor: &str, name: &str) -> AppResult<StateSnapshot> {
        let actor = self.actor(actor)?;
        let snapshot = self
            .mutate("delete_user", WriteSet::deleted_user(&user_key(name)), |state| {
                users::delete_user(state, &actor, name)
            })
            .await?;
        self.presence_leave(name).await;
        Ok(snapshot)
    }

    pub async fn login(&self, payload: LoginPayload) -> AppResult<SessionInfo> {
        let user = users::authenticate(&self.store.current(), &payload.name, &payload.password)?;
        let session = self.sessions.open_session(user).await;
        tracing::info!(user = %session.user.name, "signed in");
        self.presence_join(&session.user.name).await?;
        Ok(session)
    }

    pub async fn logout(&self) -> AppResult<BooleanResponse> {
        let Some(session) = self.sessions.close_session().await else {
            return Ok(BooleanResponse { success: false });
        };
        tracing::info!(user = %session.user.name, "signed out");
        self.presence_leave(&session.user.name).await;
        Ok(BooleanResponse { success: true })
    }

    pub async fn presence_join(&self, username: &str) -> AppResult<Vec<PresenceEntry>> {
        let user = self.actor(username)?;
        if self.presence.join(&user.name, Utc::now()).await {
            self.emit_presence().await;
        }
        Ok(self.presence.online().await)
    }

    pub async fn presence_heartbeat(&self, username: &str) -> AppResult<BooleanResponse> {
        let user = self.actor(username)?;
        if self.presence.heartbeat(&user.name, Utc::now()).await {
            self.emit_presence().await;
        }
        Ok(BooleanResponse { success: true })
    }

    pub async fn presence_leave(&self, username: &str) -> BooleanResponse {
        let success = self.presence.leave(username).await;
        if success {
            self.emit_presence().await;
        }
        BooleanResponse { success }
    }

    pub async fn presence_online(&self) -> Vec<PresenceEntry> {
        self.presence.online().await
    }

    pub async fn prune_presence(&self) -> AppResult<Vec<String>> {
        let timeout_seconds = self.db.get_settings()?.presence_timeout_seconds;
        let timeout = chrono::Duration::seconds(i64::try_from(timeout_seconds).unwrap_or(i64::MAX).min(MAX_PRESENCE_TIMEOUT_SECONDS));
        let removed = self.presence.prune(Utc::now(), timeout).await;
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "pruned idle presence entries");
            self.emit_presence().await;
        }
        Ok(removed)
    }

    async fn emit_presence(&self) {
        let online = self.presence.online().await;
        self.emit("presence_changed", json!({ "online": online }));
    }

    pub async fn archive_open(&self, path: &Path) -> AppResult<Vec<ArchiveTable>> {
        let archive = Arc::new(LegacyArchive::open(path)?);
        let tables = archive.tables()?;
        let mut current = self.archive.write().await;
        *current = Some(archive);
        Ok(tables)
    }

    async fn current_archive(&self) -> AppResult<Arc<LegacyArchive>> {
        let current = self.archive.read().await;
        current
            .clone()
            .ok_or_else(|| AppError::NotFound("no legacy archive is open".to_string()))
    }

    pub async fn archive_tables(&self) -> AppResult<Vec<ArchiveTable>> {
        self.current_archive().await?.tables()
    }

    pub async fn archive_search(&self, query: ArchiveQuery) -> AppResult<ArchivePage> {
        let archive = self.current_archive().await?;
        let page_size = self.db.get_settings()?.archive_page_size;
        archive.search(&query, page_size)
    }
}
