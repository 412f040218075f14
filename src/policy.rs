use crate::errors::{AppError, AppResult};
use crate::models::{HubSettings, User};
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_CATEGORY_NAME_CHARS: usize = 80;
const MAX_USERNAME_CHARS: usize = 40;
const MIN_PASSWORD_CHARS: usize = 6;
const MAX_PASSWORD_CHARS: usize = 128;

static SERVICE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid service id regex"));

pub fn require_admin(actor: &User, action: &str) -> AppResult<()> {
    if actor.is_admin() {
        return Ok(());
    }
    Err(AppError::Policy(format!(
        "{} requires admin access; {} has view access",
        action, actor.name
    )))
}

pub fn validate_service_id(service_id: &str) -> AppResult<()> {
    if SERVICE_ID_RE.is_match(service_id) {
        return Ok(());
    }
    Err(AppError::Validation(format!(
        "Service id '{}' must be lowercase letters, digits, '-' or '_' (max 64)",
        service_id
    )))
}

pub fn validate_category_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Category name cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_CATEGORY_NAME_CHARS {
        return Err(AppError::Validation(format!(
            "Category name exceeds {} characters",
            MAX_CATEGORY_NAME_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_username(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("User name cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_USERNAME_CHARS {
        return Err(AppError::Validation(format!(
            "User name exceeds {} characters",
            MAX_USERNAME_CHARS
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::Validation("User name contains control characters".to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn validate_password(password: &str) -> AppResult<()> {
    let length = password.chars().count();
    if !(MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&length) {
        return Err(AppError::Validation(format!(
            "Password must be between {} and {} characters",
            MIN_PASSWORD_CHARS, MAX_PASSWORD_CHARS
        )));
    }
    Ok(())
}

pub fn validate_item(item: &serde_json::Value) -> AppResult<()> {
    if !item.is_object() {
        return Err(AppError::Validation("Items must be JSON objects".to_string()));
    }
    if let Some(id) = item.get("id") {
        if !id.is_string() && !id.is_null() {
            return Err(AppError::Validation("Item id must be a string".to_string()));
        }
    }
    Ok(())
}

fn ensure_range(field: &str, value: u64, min: u64, max: u64) -> AppResult<()> {
    if (min..=max).contains(&value) {
        return Ok(());
    }
    Err(AppError::Validation(format!(
        "Setting '{}' must be between {} and {} (got {})",
        field, min, max, value
    )))
}

/// Rejects settings that would make breaks, presence or the archive unusable.
pub fn validate_settings(settings: &HubSettings) -> AppResult<()> {
    ensure_range("presenceTimeoutSeconds", settings.presence_timeout_seconds, 10, 86_400)?;
    ensure_range("maxConcurrentBreaks", u64::from(settings.max_concurrent_breaks), 1, 50)?;
    ensure_range("breakMaxMinutes", u64::from(settings.break_max_minutes), 1, 480)?;
    ensure_range("archivePageSize", u64::from(settings.archive_page_size), 1, 500)?;
    ensure_range("forecastHorizonHours", u64::from(settings.forecast_horizon_hours), 1, 336)?;
    if settings.default_avatar.trim().is_empty() {
        return Err(AppError::Validation("Setting 'defaultAvatar' cannot be empty".to_string()));
    }
    Ok(())
}
