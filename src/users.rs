use crate::errors::{AppError, AppResult};
use crate::models::{
    AccessLevel, AppData, ChangePasswordPayload, CreateUserPayload, ResetPasswordPayload, UpdateUserPayload, User,
};
use crate::policy::{require_admin, validate_password, validate_username};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const HASH_SCHEME: &str = "sha256";

/// Users are keyed by trimmed, lower-cased name.
pub fn user_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}${}", HASH_SCHEME, salt, digest(&salt, password))
}

/// Accepts hashed values and legacy plaintext ones.
pub fn verify_password(stored: &str, candidate: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_SCHEME), Some(salt), Some(expected)) => digest(salt, candidate) == expected,
        _ => stored == candidate,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn find_user<'a>(state: &'a AppData, name: &str) -> AppResult<&'a User> {
    state
        .users
        .get(&user_key(name))
        .ok_or_else(|| AppError::NotFound(format!("user {}", name.trim())))
}

fn admin_count(state: &AppData) -> usize {
    state.users.values().filter(|user| user.is_admin()).count()
}

pub fn create_user(
    mut state: AppData,
    actor: &User,
    payload: &CreateUserPayload,
    default_avatar: &str,
) -> AppResult<AppData> {
    require_admin(actor, "Creating users")?;
    let name = validate_username(&payload.name)?;
    validate_password(&payload.password)?;

    let key = user_key(&name);
    if state.users.contains_key(&key) {
        return Err(AppError::Validation(format!("User '{}' already exists", name)));
    }

    let avatar = payload
        .avatar
        .as_deref()
        .map(str::trim)
        .filter(|avatar| !avatar.is_empty())
        .unwrap_or(default_avatar)
        .to_string();

    state.users.insert(
        key,
        User {
            name,
            avatar,
            access_level: payload.access_level,
            password: Some(hash_password(&payload.password)),
            force_password_change: Some(true),
        },
    );
    Ok(state)
}

pub fn update_user(mut state: AppData, actor: &User, payload: &UpdateUserPayload) -> AppResult<AppData> {
    require_admin(actor, "Updating users")?;
    let key = user_key(&payload.name);
    let demoting_admin = payload.access_level == Some(AccessLevel::View)
        && state.users.get(&key).map(User::is_admin).unwrap_or(false);
    if demoting_admin && admin_count(&state) <= 1 {
        return Err(AppError::Validation("The last admin cannot be demoted".to_string()));
    }

    let Some(user) = state.users.get_mut(&key) else {
        return Err(AppError::NotFound(format!("user {}", payload.name.trim())));
    };
    if let Some(level) = payload.access_level {
        user.access_level = level;
    }
    if let Some(avatar) = payload.avatar.as_deref().map(str::trim) {
        if !avatar.is_empty() {
            user.avatar = avatar.to_string();
        }
    }
    Ok(state)
}

pub fn change_password(mut state: AppData, actor: &User, payload: &ChangePasswordPayload) -> AppResult<AppData> {
    validate_password(&payload.new_password)?;
    let Some(user) = state.users.get_mut(&user_key(&actor.name)) else {
        return Err(AppError::NotFound(format!("user {}", actor.name)));
    };
    let Some(stored) = user.password.as_deref() else {
        return Err(AppError::Policy(format!(
            "User {} has no password set; ask an admin to reset it",
            user.name
        )));
    };
    if !verify_password(stored, &payload.current_password) {
        return Err(AppError::Validation("Current password is incorrect".to_string()));
    }
    if payload.current_password == payload.new_password {
        return Err(AppError::Validation(
            "New password must differ from the current one".to_string(),
        ));
    }

    user.password = Some(hash_password(&payload.new_password));
    user.force_password_change = Some(false);
    Ok(state)
}

pub fn reset_password(mut state: AppData, actor: &User, payload: &ResetPasswordPayload) -> AppResult<AppData> {
    require_admin(actor, "Resetting passwords")?;
    validate_password(&payload.temporary_password)?;
    let Some(user) = state.users.get_mut(&user_key(&payload.name)) else {
        return Err(AppError::NotFound(format!("user {}", payload.name.trim())));
    };
    user.password = Some(hash_password(&payload.temporary_password));
    user.force_password_change = Some(true);
    Ok(state)
}

pub fn delete_user(mut state: AppData, actor: &User, name: &str) -> AppResult<AppData> {
    require_admin(actor, "Deleting users")?;
    let key = user_key(name);
    if key == user_key(&actor.name) {
        return Err(AppError::Validation("You cannot delete your own account".to_string()));
    }
    let Some(removed) = state.users.remove(&key) else {
        return Err(AppError::NotFound(format!("user {}", name.trim())));
    };
    if removed.is_admin() && admin_count(&state) == 0 {
        return Err(AppError::Validation("The last admin cannot be deleted".to_string()));
    }
    Ok(state)
}

/// Checks credentials and returns the redacted user on success.
pub fn authenticate(state: &AppData, name: &str, password: &str) -> AppResult<User> {
    let denied = || AppError::Policy("Invalid user name or password".to_string());
    let user = state.users.get(&user_key(name)).ok_or_else(denied)?;
    match user.password.as_deref() {
        Some(stored) if verify_password(stored, password) => Ok(user.redacted()),
        Some(_) => Err(denied()),
        None => Err(AppError::Policy(format!(
            "User {} has no password set; ask an admin to reset it",
            user.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        authenticate, change_password, create_user, delete_user, hash_password, reset_password, update_user,
        user_key, verify_password,
    };
    use crate::models::{
        AccessLevel, AppData, ChangePasswordPayload, CreateUserPayload, ResetPasswordPayload, UpdateUserPayload,
        User,
    };

    fn seeded() -> (AppData, User) {
        let admin = User {
            name: "Admin".to_string(),
            avatar: "A".to_string(),
            access_level: AccessLevel::Admin,
            password: Some(hash_password("admin-pass")),
            force_password_change: None,
        };
        let mut state = AppData::default();
        state.users.insert(user_key(&admin.name), admin.clone());
        (state, admin)
    }

    fn create(state: AppData, actor: &User, name: &str, level: AccessLevel) -> AppData {
        create_user(
            state,
            actor,
            &CreateUserPayload {
                name: name.to_string(),
                password: "welcome1".to_string(),
                access_level: level,
                avatar: None,
            },
            "👤",
        )
        .expect("create user")
    }

    #[test]
    fn hashes_verify_and_legacy_plaintext_still_works() {
        let stored = hash_password("hunter22");
        assert!(stored.starts_with("sha256$"));
        assert!(verify_password(&stored, "hunter22"));
        assert!(!verify_password(&stored, "hunter23"));
        assert!(verify_password("plain-old", "plain-old"));
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn created_users_are_keyed_lowercase_and_must_change_password() {
        let (state, admin) = seeded();
        let state = create(state, &admin, "  Maria ", AccessLevel::View);
        let maria = &state.users["maria"];
        assert_eq!(maria.name, "Maria");
        assert_eq!(maria.avatar, "👤");
        assert_eq!(maria.force_password_change, Some(true));

        let duplicate = create_user(
            state,
            &admin,
            &CreateUserPayload {
                name: "MARIA".to_string(),
                password: "welcome1".to_string(),
                access_level: AccessLevel::View,
                avatar: None,
            },
            "👤",
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn password_change_requires_current_password() {
        let (state, admin) = seeded();
        let state = create(state, &admin, "maria", AccessLevel::View);
        let maria = state.users["maria"].clone();

        let wrong = change_password(
            state.clone(),
            &maria,
            &ChangePasswordPayload {
                current_password: "nope".to_string(),
                new_password: "brand-new".to_string(),
            },
        );
        assert!(wrong.is_err());

        let state = change_password(
            state,
            &maria,
            &ChangePasswordPayload {
                current_password: "welcome1".to_string(),
                new_password: "brand-new".to_string(),
            },
        )
        .expect("change password");
        assert_eq!(state.users["maria"].force_password_change, Some(false));
        let user = authenticate(&state, "Maria", "brand-new").expect("login");
        assert!(user.password.is_none());
        assert!(authenticate(&state, "maria", "welcome1").is_err());
    }

    #[test]
    fn password_change_without_stored_password_needs_admin_reset() {
        let (state, admin) = seeded();
        let mut state = create(state, &admin, "maria", AccessLevel::View);
        if let Some(maria) = state.users.get_mut("maria") {
            maria.password = None;
        }
        let maria = state.users["maria"].clone();

        let err = change_password(
            state.clone(),
            &maria,
            &ChangePasswordPayload {
                current_password: String::new(),
                new_password: "self-chosen".to_string(),
            },
        )
        .expect_err("no stored password");
        assert!(err.to_string().starts_with("POLICY_DENIED"));

        let state = reset_password(
            state,
            &admin,
            &ResetPasswordPayload {
                name: "maria".to_string(),
                temporary_password: "temp-123".to_string(),
            },
        )
        .expect("reset");
        let state = change_password(
            state,
            &maria,
            &ChangePasswordPayload {
                current_password: "temp-123".to_string(),
                new_password: "self-chosen".to_string(),
            },
        )
        .expect("change after reset");
        assert!(authenticate(&state, "maria", "self-chosen").is_ok());
    }

    #[test]
    fn admin_reset_forces_change() {
        let (state, admin) = seeded();
        let state = create(state, &admin, "maria", AccessLevel::View);
        let state = reset_password(
            state,
            &admin,
            &ResetPasswordPayload {
                name: "Maria".to_string(),
                temporary_password: "temp-123".to_string(),
            },
        )
        .expect("reset");
        assert_eq!(state.users["maria"].force_password_change, Some(true));
        assert!(authenticate(&state, "maria", "temp-123").is_ok());
    }

    #[test]
    fn last_admin_is_protected() {
        let (state, admin) = seeded();
        let state = create(state, &admin, "Second", AccessLevel::Admin);
        let second = state.users["second"].clone();

        assert!(delete_user(state.clone(), &admin, "admin").is_err());

        let state = delete_user(state, &second, "Admin").expect("delete other admin");
        assert!(!state.users.contains_key("admin"));

        let demote = update_user(
            state,
            &second,
            &UpdateUserPayload {
                name: "second".to_string(),
                access_level: Some(AccessLevel::View),
                avatar: None,
            },
        );
        assert!(demote.is_err());
    }

    #[test]
    fn viewers_cannot_manage_users() {
        let (state, admin) = seeded();
        let state = create(state, &admin, "viewer", AccessLevel::View);
        let viewer = state.users["viewer"].clone();
        let err = delete_user(state, &viewer, "admin").expect_err("denied");
        assert!(err.to_string().starts_with("POLICY_DENIED"));
    }
}
