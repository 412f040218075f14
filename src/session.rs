use crate::errors::{AppError, AppResult};
use crate::models::{SessionInfo, User};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The user signed in to this desktop shell, if any.
#[derive(Clone, Default)]
pub struct SessionManager {
    current: Arc<RwLock<Option<SessionInfo>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_session(&self, user: User) -> SessionInfo {
        let session = SessionInfo {
            session_id: Uuid::new_v4().to_string(),
            user: user.redacted(),
            started_at: Utc::now(),
        };
        let mut current = self.current.write().await;
        *current = Some(session.clone());
        session
    }

    pub async fn current(&self) -> Option<SessionInfo> {
        self.current.read().await.clone()
    }

    pub async fn username(&self) -> AppResult<String> {
        let current = self.current.read().await;
        let Some(session) = current.as_ref() else {
            return Err(AppError::Policy("Not signed in".to_string()));
        };
        Ok(session.user.name.clone())
    }

    /// Keeps the cached profile in step after the user record changes.
    pub async fn refresh_user(&self, user: &User) {
        let mut current = self.current.write().await;
        if let Some(session) = current.as_mut() {
            if session.user.name.eq_ignore_ascii_case(&user.name) {
                session.user = user.redacted();
            }
        }
    }

    pub async fn close_session(&self) -> Option<SessionInfo> {
        let mut current = self.current.write().await;
        current.take()
    }
}
