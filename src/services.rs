use crate::errors::{AppError, AppResult};
use crate::models::{
    AddCategoryPayload, AppData, CategoryMeta, DeleteCategoryPayload, DeleteItemPayload, ImportServicePayload,
    SaveItemPayload, ServiceData, ServiceRecord, User,
};
use crate::notifications::{notify, ChangeNotice, ChangeVerb};
use crate::policy::{require_admin, validate_category_name, validate_item, validate_service_id};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_CATEGORY_ICON: &str = "📁";
const DEFAULT_CATEGORY_COLOR: &str = "#3b82f6";
const DEFAULT_CATEGORY_TYPE: &str = "resource";
const TITLE_FIELDS: [&str; 5] = ["title", "name", "question", "subject", "headline"];

/// Who is mutating, and when.
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    pub actor: &'a User,
    pub now: DateTime<Utc>,
}

pub fn item_id(item: &serde_json::Value) -> Option<&str> {
    item.get("id")
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

/// Human-facing label used in notification messages.
pub fn item_title(item: &serde_json::Value) -> String {
    TITLE_FIELDS
        .iter()
        .filter_map(|field| item.get(*field).and_then(serde_json::Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| item_id(item).map(ToString::to_string))
        .unwrap_or_else(|| "untitled".to_string())
}

/// Returns the item's id, assigning a fresh one when it has none.
pub fn ensure_item_id(item: &mut serde_json::Value) -> AppResult<String> {
    if let Some(id) = item_id(item) {
        return Ok(id.to_string());
    }
    let Some(object) = item.as_object_mut() else {
        return Err(AppError::Validation("Items must be JSON objects".to_string()));
    };
    let id = Uuid::new_v4().to_string();
    object.insert("id".to_string(), serde_json::Value::String(id.clone()));
    Ok(id)
}

pub fn flat_items<'a>(state: &'a AppData, service_id: &str) -> AppResult<&'a [serde_json::Value]> {
    match state.services_data.get(service_id).and_then(|record| record.data.as_ref()) {
        None => Ok(&[]),
        Some(ServiceData::Flat(items)) => Ok(items.as_slice()),
        Some(ServiceData::Categorized(_)) => Err(shape_error(service_id, "categorized")),
    }
}

fn flat_items_mut<'a>(record: &'a mut ServiceRecord, service_id: &str) -> AppResult<&'a mut Vec<serde_json::Value>> {
    let data = record.data.get_or_insert_with(|| ServiceData::Flat(Vec::new()));
    match data {
        ServiceData::Flat(items) => Ok(items),
        ServiceData::Categorized(_) => Err(shape_error(service_id, "categorized")),
    }
}

fn categories_mut<'a>(
    record: &'a mut ServiceRecord,
    service_id: &str,
) -> AppResult<&'a mut BTreeMap<String, Vec<serde_json::Value>>> {
    let data = record
        .data
        .get_or_insert_with(|| ServiceData::Categorized(BTreeMap::new()));
    match data {
        ServiceData::Categorized(categories) => Ok(categories),
        ServiceData::Flat(_) => Err(shape_error(service_id, "flat")),
    }
}

fn shape_error(service_id: &str, actual: &str) -> AppError {
    AppError::Validation(format!(
        "Service '{}' stores {} data; the requested change would mix data shapes",
        service_id, actual
    ))
}

/// Inserts `item` into a flat service, replacing an existing item with the same id.
/// New items go to the front (feeds read newest first). Returns true if an item was replaced.
pub fn upsert_flat_item(state: &mut AppData, service_id: &str, item: serde_json::Value) -> AppResult<bool> {
    let Some(id) = item_id(&item).map(ToString::to_string) else {
        return Err(AppError::Validation("Flat items need an id".to_string()));
    };
    let record = state.services_data.entry(service_id.to_string()).or_default();
    let items = flat_items_mut(record, service_id)?;
    if let Some(existing) = items.iter_mut().find(|current| item_id(current) == Some(id.as_str())) {
        *existing = item;
        return Ok(true);
    }
    items.insert(0, item);
    Ok(false)
}

pub fn remove_flat_item(state: &mut AppData, service_id: &str, id: &str) -> AppResult<serde_json::Value> {
    let Some(record) = state.services_data.get_mut(service_id) else {
        return Err(AppError::NotFound(format!("service {}", service_id)));
    };
    let items = flat_items_mut(record, service_id)?;
    let Some(position) = items.iter().position(|item| item_id(item) == Some(id)) else {
        return Err(AppError::NotFound(format!("item {} in {}", id, service_id)));
    };
    Ok(items.remove(position))
}

pub fn add_category(mut state: AppData, ctx: MutationContext<'_>, payload: &AddCategoryPayload) -> AppResult<AppData> {
    require_admin(ctx.actor, "Adding a category")?;
    validate_service_id(&payload.service_id)?;
    let name = validate_category_name(&payload.category_name)?;

    let record = state.services_data.entry(payload.service_id.clone()).or_default();
    let categories = categories_mut(record, &payload.service_id)?;
    if categories.keys().any(|existing| existing.eq_ignore_ascii_case(&name)) {
        return Err(AppError::Validation(format!(
            "Category '{}' already exists in {}",
            name, payload.service_id
        )));
    }
    categories.insert(name.clone(), Vec::new());

    let meta = CategoryMeta {
        icon: non_empty_or(payload.icon.as_deref(), DEFAULT_CATEGORY_ICON),
        color: non_empty_or(payload.color.as_deref(), DEFAULT_CATEGORY_COLOR),
        kind: non_empty_or(payload.kind.as_deref(), DEFAULT_CATEGORY_TYPE),
        created_at: ctx.now,
    };
    record
        .metadata
        .get_or_insert_with(BTreeMap::new)
        .insert(name.clone(), meta);

    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Added,
            subject: &name,
            service_id: &payload.service_id,
            category_name: None,
            item_id: None,
        },
        ctx.now,
    );
    Ok(state)
}

pub fn delete_category(
    mut state: AppData,
    ctx: MutationContext<'_>,
    payload: &DeleteCategoryPayload,
) -> AppResult<AppData> {
    require_admin(ctx.actor, "Deleting a category")?;
    let Some(record) = state.services_data.get_mut(&payload.service_id) else {
        return Err(AppError::NotFound(format!("service {}", payload.service_id)));
    };
    let categories = categories_mut(record, &payload.service_id)?;
    if categories.remove(&payload.category_name).is_none() {
        return Err(AppError::NotFound(format!(
            "category {} in {}",
            payload.category_name, payload.service_id
        )));
    }
    if let Some(metadata) = record.metadata.as_mut() {
        metadata.remove(&payload.category_name);
    }

    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Deleted,
            subject: &payload.category_name,
            service_id: &payload.service_id,
            category_name: None,
            item_id: None,
        },
        ctx.now,
    );
    Ok(state)
}

pub fn save_item(mut state: AppData, ctx: MutationContext<'_>, payload: &SaveItemPayload) -> AppResult<AppData> {
    require_admin(ctx.actor, "Saving an item")?;
    validate_service_id(&payload.service_id)?;
    validate_item(&payload.item)?;

    let mut item = payload.item.clone();
    let id = ensure_item_id(&mut item)?;
    let title = item_title(&item);

    let replaced = match payload.category_name.as_deref() {
        Some(category) => {
            let record = state.services_data.entry(payload.service_id.clone()).or_default();
            let categories = categories_mut(record, &payload.service_id)?;
            let Some(items) = categories.get_mut(category) else {
                return Err(AppError::NotFound(format!(
                    "category {} in {}",
                    category, payload.service_id
                )));
            };
            match items.iter_mut().find(|current| item_id(current) == Some(id.as_str())) {
                Some(existing) => {
                    *existing = item;
                    true
                }
                None => {
                    items.push(item);
                    false
                }
            }
        }
        None => upsert_flat_item(&mut state, &payload.service_id, item)?,
    };

    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: if replaced { ChangeVerb::Updated } else { ChangeVerb::Added },
            subject: &title,
            service_id: &payload.service_id,
            category_name: payload.category_name.as_deref(),
            item_id: Some(id.as_str()),
        },
        ctx.now,
    );
    Ok(state)
}

pub fn delete_item(mut state: AppData, ctx: MutationContext<'_>, payload: &DeleteItemPayload) -> AppResult<AppData> {
    require_admin(ctx.actor, "Deleting an item")?;

    let removed = match payload.category_name.as_deref() {
        Some(category) => {
            let Some(record) = state.services_data.get_mut(&payload.service_id) else {
                return Err(AppError::NotFound(format!("service {}", payload.service_id)));
            };
            let categories = categories_mut(record, &payload.service_id)?;
            let Some(items) = categories.get_mut(category) else {
                return Err(AppError::NotFound(format!(
                    "category {} in {}",
                    category, payload.service_id
                )));
            };
            let Some(position) = items
                .iter()
                .position(|item| item_id(item) == Some(payload.item_id.as_str()))
            else {
                return Err(AppError::NotFound(format!(
                    "item {} in {} / {}",
                    payload.item_id, payload.service_id, category
                )));
            };
            items.remove(position)
        }
        None => remove_flat_item(&mut state, &payload.service_id, &payload.item_id)?,
    };

    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Deleted,
            subject: &item_title(&removed),
            service_id: &payload.service_id,
            category_name: payload.category_name.as_deref(),
            item_id: Some(payload.item_id.as_str()),
        },
        ctx.now,
    );
    Ok(state)
}

/// Replaces a service's data with an already-parsed import.
pub fn import_service_data(
    mut state: AppData,
    ctx: MutationContext<'_>,
    payload: &ImportServicePayload,
) -> AppResult<AppData> {
    require_admin(ctx.actor, "Importing service data")?;
    validate_service_id(&payload.service_id)?;

    let mut data = payload.data.clone();
    match &mut data {
        ServiceData::Flat(items) => {
            for item in items.iter_mut() {
                validate_item(item)?;
                ensure_item_id(item)?;
            }
        }
        ServiceData::Categorized(categories) => {
            for (name, items) in categories.iter_mut() {
                validate_category_name(name)?;
                for item in items.iter_mut() {
                    validate_item(item)?;
                    ensure_item_id(item)?;
                }
            }
        }
    }

    let record = state.services_data.entry(payload.service_id.clone()).or_default();
    if let Some(existing) = record.data.as_ref() {
        if existing.kind() != data.kind() {
            return Err(shape_error(&payload.service_id, existing.kind()));
        }
    }

    if let ServiceData::Categorized(categories) = &data {
        let metadata = record.metadata.get_or_insert_with(BTreeMap::new);
        metadata.retain(|name, _| categories.contains_key(name));
        for name in categories.keys() {
            metadata.entry(name.clone()).or_insert_with(|| CategoryMeta {
                icon: DEFAULT_CATEGORY_ICON.to_string(),
                color: DEFAULT_CATEGORY_COLOR.to_string(),
                kind: DEFAULT_CATEGORY_TYPE.to_string(),
                created_at: ctx.now,
            });
        }
    }

    let subject = payload
        .file_name
        .clone()
        .unwrap_or_else(|| format!("{} items", data.item_count()));
    record.data = Some(data);
    record.file_name = payload.file_name.clone();

    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Imported,
            subject: &subject,
            service_id: &payload.service_id,
            category_name: None,
            item_id: None,
        },
        ctx.now,
    );
    Ok(state)
}

fn non_empty_or(value: Option<&str>, fallback: &str) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        add_category, delete_category, delete_item, flat_items, import_service_data, item_title, save_item,
        MutationContext,
    };
    use crate::models::{
        AccessLevel, AddCategoryPayload, AppData, DeleteCategoryPayload, DeleteItemPayload, ImportServicePayload,
        SaveItemPayload, ServiceData, User,
    };
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn admin() -> User {
        User {
            name: "Alice".to_string(),
            avatar: "A".to_string(),
            access_level: AccessLevel::Admin,
            password: None,
            force_password_change: None,
        }
    }

    fn viewer() -> User {
        User {
            access_level: AccessLevel::View,
            name: "Victor".to_string(),
            ..admin()
        }
    }

    fn category(service: &str, name: &str) -> AddCategoryPayload {
        AddCategoryPayload {
            service_id: service.to_string(),
            category_name: name.to_string(),
            icon: None,
            color: Some("#ff0000".to_string()),
            kind: None,
        }
    }

    fn with_billing(actor: &User) -> AppData {
        let ctx = MutationContext { actor, now: Utc::now() };
        add_category(AppData::default(), ctx, &category("tickets", "Billing")).expect("add category")
    }

    #[test]
    fn adding_category_records_metadata_and_notifies() {
        let actor = admin();
        let state = with_billing(&actor);
        let record = &state.services_data["tickets"];
        let meta = &record.metadata.as_ref().expect("metadata")["Billing"];
        assert_eq!(meta.color, "#ff0000");
        assert_eq!(meta.icon, "📁");
        assert_eq!(state.notifications.len(), 1);
        assert_eq!(state.notifications[0].message, "Alice added \"Billing\" to tickets");
    }

    #[test]
    fn duplicate_category_is_rejected_case_insensitively() {
        let actor = admin();
        let state = with_billing(&actor);
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        assert!(add_category(state, ctx, &category("tickets", "billing")).is_err());
    }

    #[test]
    fn save_item_assigns_id_then_updates_in_place() {
        let actor = admin();
        let state = with_billing(&actor);
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        let state = save_item(
            state,
            ctx,
            &SaveItemPayload {
                service_id: "tickets".to_string(),
                category_name: Some("Billing".to_string()),
                item: json!({ "title": "Refund policy", "body": "v1" }),
            },
        )
        .expect("add item");

        let Some(ServiceData::Categorized(categories)) = &state.services_data["tickets"].data else {
            panic!("expected categorized data");
        };
        let id = categories["Billing"][0]["id"].as_str().expect("id").to_string();
        assert!(state.notifications[0].message.starts_with("Alice added \"Refund policy\""));

        let state = save_item(
            state,
            ctx,
            &SaveItemPayload {
                service_id: "tickets".to_string(),
                category_name: Some("Billing".to_string()),
                item: json!({ "id": id, "title": "Refund policy", "body": "v2" }),
            },
        )
        .expect("update item");
        let Some(ServiceData::Categorized(categories)) = &state.services_data["tickets"].data else {
            panic!("expected categorized data");
        };
        assert_eq!(categories["Billing"].len(), 1);
        assert_eq!(categories["Billing"][0]["body"], "v2");
        assert!(state.notifications[0].message.starts_with("Alice updated"));
        assert_eq!(state.notifications.len(), 3);
    }

    #[test]
    fn flat_services_prepend_and_reject_categories() {
        let actor = admin();
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        let mut state = AppData::default();
        for headline in ["first", "second"] {
            state = save_item(
                state,
                ctx,
                &SaveItemPayload {
                    service_id: "news".to_string(),
                    category_name: None,
                    item: json!({ "headline": headline }),
                },
            )
            .expect("save news");
        }
        let items = flat_items(&state, "news").expect("flat");
        assert_eq!(item_title(&items[0]), "second");

        let err = add_category(state, ctx, &category("news", "Sports")).expect_err("shape mix");
        assert!(err.is_validation());
    }

    #[test]
    fn delete_item_and_category_require_existing_targets() {
        let actor = admin();
        let state = with_billing(&actor);
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        let missing = delete_item(
            state.clone(),
            ctx,
            &DeleteItemPayload {
                service_id: "tickets".to_string(),
                category_name: Some("Billing".to_string()),
                item_id: "nope".to_string(),
            },
        );
        assert!(missing.is_err());

        let state = delete_category(
            state,
            ctx,
            &DeleteCategoryPayload {
                service_id: "tickets".to_string(),
                category_name: "Billing".to_string(),
            },
        )
        .expect("delete category");
        assert!(state.services_data["tickets"]
            .metadata
            .as_ref()
            .expect("metadata")
            .is_empty());
        assert!(state.notifications[0].message.contains("deleted \"Billing\" from tickets"));
    }

    #[test]
    fn viewers_cannot_change_content() {
        let actor = viewer();
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        let err = save_item(
            AppData::default(),
            ctx,
            &SaveItemPayload {
                service_id: "news".to_string(),
                category_name: None,
                item: json!({ "headline": "nope" }),
            },
        )
        .expect_err("denied");
        assert!(err.to_string().starts_with("POLICY_DENIED"));
    }

    #[test]
    fn import_replaces_data_and_syncs_metadata() {
        let actor = admin();
        let state = with_billing(&actor);
        let ctx = MutationContext { actor: &actor, now: Utc::now() };
        let mut categories = BTreeMap::new();
        categories.insert("Shipping".to_string(), vec![json!({ "question": "Where is my order?" })]);
        let state = import_service_data(
            state,
            ctx,
            &ImportServicePayload {
                service_id: "tickets".to_string(),
                file_name: Some("tickets.xlsx".to_string()),
                data: ServiceData::Categorized(categories),
            },
        )
        .expect("import");

        let record = &state.services_data["tickets"];
        assert_eq!(record.file_name.as_deref(), Some("tickets.xlsx"));
        let metadata = record.metadata.as_ref().expect("metadata");
        assert!(metadata.contains_key("Shipping"));
        assert!(!metadata.contains_key("Billing"));
        let Some(ServiceData::Categorized(categories)) = &record.data else {
            panic!("expected categorized data");
        };
        assert!(categories["Shipping"][0]["id"].is_string());
        assert!(state.notifications[0].message.contains("imported \"tickets.xlsx\""));

        let err = import_service_data(
            state,
            ctx,
            &ImportServicePayload {
                service_id: "tickets".to_string(),
                file_name: None,
                data: ServiceData::Flat(vec![]),
            },
        )
        .expect_err("shape mix");
        assert!(err.is_validation());
    }
}
