pub mod analytics;
pub mod archive;
pub mod breaks;
#[cfg(feature = "desktop")]
mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod hub;
pub mod models;
pub mod notifications;
pub mod policy;
pub mod presence;
pub mod remote;
pub mod services;
pub mod session;
pub mod store;
pub mod users;

use crate::errors::{AppError, AppResult};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global JSON subscriber writing to `<data_dir>/logs/hub.log`, rolled daily.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = config::log_dir(data_dir);
    std::fs::create_dir_all(&log_dir).map_err(|error| AppError::Io(error.to_string()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "hub.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(feature = "desktop")]
pub fn run() {
    use crate::commands::*;
    use crate::config::HubConfig;
    use crate::hub::{HubCore, HUB_EVENT};
    use tauri::{Emitter, Manager};
    use tokio::sync::broadcast::error::RecvError;

    tauri::Builder::default()
        .setup(|app| {
            let app_data_dir = app.path().app_data_dir().map_err(|error| error.to_string())?;
            std::fs::create_dir_all(&app_data_dir).map_err(|error| error.to_string())?;
            init_tracing(&app_data_dir).map_err(|error| error.to_string())?;

            let hub = HubCore::new(HubConfig::from_env(app_data_dir)).map_err(|error| error.to_string())?;
            let handle = app.handle().clone();

            tauri::async_runtime::spawn({
                let hub = hub.clone();
                async move {
                    if let Err(error) = hub.bootstrap().await {
                        tracing::warn!(error = %error, "startup bootstrap failed");
                    }
                }
            });

            tauri::async_runtime::spawn({
                let mut events = hub.subscribe_events();
                async move {
                    loop {
                        match events.recv().await {
                            Ok(envelope) => {
                                if let Err(error) = handle.emit(HUB_EVENT, &envelope) {
                                    tracing::warn!(error = %error, "failed to forward hub event");
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "hub event forwarder lagged");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            });

            tauri::async_runtime::spawn({
                let hub = hub.clone();
                async move {
                    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
                    loop {
                        interval.tick().await;
                        if let Err(error) = hub.prune_presence().await {
                            tracing::warn!(error = %error, "presence pruning failed");
                        }
                    }
                }
            });

            app.manage(AppState { hub });
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            bootstrap_state,
            get_state,
            login,
            logout,
            current_session,
            add_category,
            delete_category,
            save_item,
            delete_item,
            import_service,
            schedule_break,
            cancel_break,
            breaks_on,
            forecast_comments,
            record_comment_analysis,
            mark_notification_read,
            mark_all_notifications_read,
            unread_count,
            create_user,
            update_user,
            change_password,
            reset_password,
            delete_user,
            presence_heartbeat,
            presence_online,
            archive_open,
            archive_tables,
            archive_search,
            get_settings,
            update_settings
        ])
        .run(tauri::generate_context!())
        .expect("failed to run tauri app");
}
