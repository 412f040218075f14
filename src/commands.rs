use crate::hub::HubCore;
use crate::models::{
    AddCategoryPayload, ArchivePage, ArchiveQuery, ArchiveTable, BooleanResponse, BreakSlot, ChangePasswordPayload,
    CommentForecast, CommentSample, CreateUserPayload, DeleteCategoryPayload, DeleteItemPayload, HubSettings,
    ImportServicePayload, LoginPayload, OpenArchivePayload, PresenceEntry, RecordCommentAnalysisPayload,
    ResetPasswordPayload, SaveItemPayload, ScheduleBreakPayload, SessionInfo, StateSnapshot, UpdateUserPayload,
};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubCore>,
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}

async fn signed_in(state: &AppState) -> Result<String, String> {
    state.hub.sessions().username().await.map_err(to_client_error)
}

#[tauri::command]
pub async fn bootstrap_state(state: tauri::State<'_, AppState>) -> Result<StateSnapshot, String> {
    state.hub.bootstrap().await.map_err(to_client_error)
}

#[tauri::command]
pub fn get_state(state: tauri::State<'_, AppState>) -> Result<StateSnapshot, String> {
    Ok(state.hub.snapshot())
}

#[tauri::command]
pub async fn login(state: tauri::State<'_, AppState>, payload: LoginPayload) -> Result<SessionInfo, String> {
    state.hub.login(payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn logout(state: tauri::State<'_, AppState>) -> Result<BooleanResponse, String> {
    state.hub.logout().await.map_err(to_client_error)
}

#[tauri::command]
pub async fn current_session(state: tauri::State<'_, AppState>) -> Result<Option<SessionInfo>, String> {
    Ok(state.hub.sessions().current().await)
}

#[tauri::command]
pub async fn add_category(
    state: tauri::State<'_, AppState>,
    payload: AddCategoryPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.add_category(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn delete_category(
    state: tauri::State<'_, AppState>,
    payload: DeleteCategoryPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.delete_category(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn save_item(state: tauri::State<'_, AppState>, payload: SaveItemPayload) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.save_item(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn delete_item(
    state: tauri::State<'_, AppState>,
    payload: DeleteItemPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.delete_item(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn import_service(
    state: tauri::State<'_, AppState>,
    payload: ImportServicePayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.import_service(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn schedule_break(
    state: tauri::State<'_, AppState>,
    payload: ScheduleBreakPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.schedule_break(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn cancel_break(state: tauri::State<'_, AppState>, break_id: String) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.cancel_break(&actor, &break_id).await.map_err(to_client_error)
}

#[tauri::command]
pub fn breaks_on(state: tauri::State<'_, AppState>, day: NaiveDate) -> Result<Vec<BreakSlot>, String> {
    state.hub.breaks_on(day).map_err(to_client_error)
}

#[tauri::command]
pub fn forecast_comments(
    state: tauri::State<'_, AppState>,
    samples: Vec<CommentSample>,
    horizon_hours: Option<u32>,
) -> Result<CommentForecast, String> {
    state
        .hub
        .forecast_comments(&samples, horizon_hours)
        .map_err(to_client_error)
}

#[tauri::command]
pub async fn record_comment_analysis(
    state: tauri::State<'_, AppState>,
    payload: RecordCommentAnalysisPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state
        .hub
        .record_comment_analysis(&actor, payload)
        .await
        .map_err(to_client_error)
}

#[tauri::command]
pub async fn mark_notification_read(
    state: tauri::State<'_, AppState>,
    notification_id: String,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state
        .hub
        .mark_notification_read(&actor, &notification_id)
        .await
        .map_err(to_client_error)
}

#[tauri::command]
pub async fn mark_all_notifications_read(state: tauri::State<'_, AppState>) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state
        .hub
        .mark_all_notifications_read(&actor)
        .await
        .map_err(to_client_error)
}

#[tauri::command]
pub async fn unread_count(state: tauri::State<'_, AppState>) -> Result<usize, String> {
    let actor = signed_in(&state).await?;
    Ok(state.hub.unread_count(&actor))
}

#[tauri::command]
pub async fn create_user(
    state: tauri::State<'_, AppState>,
    payload: CreateUserPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.create_user(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn update_user(
    state: tauri::State<'_, AppState>,
    payload: UpdateUserPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.update_user(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn change_password(
    state: tauri::State<'_, AppState>,
    payload: ChangePasswordPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.change_password(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn reset_password(
    state: tauri::State<'_, AppState>,
    payload: ResetPasswordPayload,
) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.reset_password(&actor, payload).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn delete_user(state: tauri::State<'_, AppState>, name: String) -> Result<StateSnapshot, String> {
    let actor = signed_in(&state).await?;
    state.hub.delete_user(&actor, &name).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn presence_heartbeat(state: tauri::State<'_, AppState>) -> Result<BooleanResponse, String> {
    let actor = signed_in(&state).await?;
    state.hub.presence_heartbeat(&actor).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn presence_online(state: tauri::State<'_, AppState>) -> Result<Vec<PresenceEntry>, String> {
    Ok(state.hub.presence_online().await)
}

#[tauri::command]
pub async fn archive_open(
    state: tauri::State<'_, AppState>,
    payload: OpenArchivePayload,
) -> Result<Vec<ArchiveTable>, String> {
    let path = PathBuf::from(payload.path);
    state.hub.archive_open(&path).await.map_err(to_client_error)
}

#[tauri::command]
pub async fn archive_tables(state: tauri::State<'_, AppState>) -> Result<Vec<ArchiveTable>, String> {
    state.hub.archive_tables().await.map_err(to_client_error)
}

#[tauri::command]
pub async fn archive_search(state: tauri::State<'_, AppState>, query: ArchiveQuery) -> Result<ArchivePage, String> {
    state.hub.archive_search(query).await.map_err(to_client_error)
}

#[tauri::command]
pub fn get_settings(state: tauri::State<'_, AppState>) -> Result<HubSettings, String> {
    state.hub.get_settings().map_err(to_client_error)
}

#[tauri::command]
pub async fn update_settings(
    state: tauri::State<'_, AppState>,
    update: serde_json::Value,
) -> Result<HubSettings, String> {
    let actor = signed_in(&state).await?;
    state.hub.update_settings(&actor, update).map_err(to_client_error)
}
