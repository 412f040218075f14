use crate::errors::{AppError, AppResult};
use crate::models::{AppData, BreakSlot, HubSettings, ScheduleBreakPayload};
use crate::notifications::{notify, ChangeNotice, ChangeVerb};
use crate::services::{flat_items, remove_flat_item, upsert_flat_item, MutationContext};
use crate::users::{find_user, user_key};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

pub const BREAKS_SERVICE_ID: &str = "team-breaks";

pub fn list_breaks(state: &AppData) -> AppResult<Vec<BreakSlot>> {
    flat_items(state, BREAKS_SERVICE_ID)?
        .iter()
        .map(|item| {
            serde_json::from_value::<BreakSlot>(item.clone())
                .map_err(|error| AppError::Internal(format!("malformed break entry: {}", error)))
        })
        .collect()
}

/// Breaks that touch the given UTC day, earliest first.
pub fn breaks_on(state: &AppData, day: NaiveDate) -> AppResult<Vec<BreakSlot>> {
    let mut slots: Vec<BreakSlot> = list_breaks(state)?
        .into_iter()
        .filter(|slot| slot.start.date_naive() <= day && slot.end.date_naive() >= day)
        .collect();
    slots.sort_by(|left, right| left.start.cmp(&right.start).then_with(|| left.username.cmp(&right.username)));
    Ok(slots)
}

fn overlaps(slot: &BreakSlot, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    slot.start < end && start < slot.end
}

pub fn validate_break(existing: &[BreakSlot], candidate: &BreakSlot, settings: &HubSettings) -> AppResult<()> {
    if candidate.end <= candidate.start {
        return Err(AppError::Validation("A break must end after it starts".to_string()));
    }
    let minutes = (candidate.end - candidate.start).num_minutes();
    if minutes > i64::from(settings.break_max_minutes) {
        return Err(AppError::Validation(format!(
            "Breaks are limited to {} minutes ({} requested)",
            settings.break_max_minutes, minutes
        )));
    }

    let owner = user_key(&candidate.username);
    let mut concurrent = 0u32;
    for slot in existing.iter().filter(|slot| slot.id != candidate.id) {
        if !overlaps(slot, candidate.start, candidate.end) {
            continue;
        }
        if user_key(&slot.username) == owner {
            return Err(AppError::Validation(format!(
                "{} already has a break from {} to {}",
                candidate.username,
                slot.start.format("%H:%M"),
                slot.end.format("%H:%M")
            )));
        }
        concurrent += 1;
    }
    if concurrent >= settings.max_concurrent_breaks {
        return Err(AppError::Validation(format!(
            "At most {} team members can be on break at the same time",
            settings.max_concurrent_breaks
        )));
    }
    Ok(())
}

pub fn schedule_break(
    mut state: AppData,
    ctx: MutationContext<'_>,
    payload: &ScheduleBreakPayload,
    settings: &HubSettings,
) -> AppResult<AppData> {
    let username = match payload.username.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() && user_key(name) != user_key(&ctx.actor.name) => {
            if !ctx.actor.is_admin() {
                return Err(AppError::Policy(
                    "Only admins can schedule breaks for someone else".to_string(),
                ));
            }
            find_user(&state, name)?.name.clone()
        }
        _ => ctx.actor.name.clone(),
    };

    let slot = BreakSlot {
        id: Uuid::new_v4().to_string(),
        username,
        start: payload.start,
        end: payload.end,
        note: payload
            .note
            .as_deref()
            .map(str::trim)
            .filter(|note| !note.is_empty())
            .map(ToString::to_string),
    };
    validate_break(&list_breaks(&state)?, &slot, settings)?;

    let subject = format!("{} {}–{}", slot.username, slot.start.format("%H:%M"), slot.end.format("%H:%M"));
    upsert_flat_item(&mut state, BREAKS_SERVICE_ID, serde_json::to_value(&slot)?)?;
    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Scheduled,
            subject: &subject,
            service_id: BREAKS_SERVICE_ID,
            category_name: None,
            item_id: Some(slot.id.as_str()),
        },
        ctx.now,
    );
    Ok(state)
}

pub fn cancel_break(mut state: AppData, ctx: MutationContext<'_>, break_id: &str) -> AppResult<AppData> {
    let Some(slot) = list_breaks(&state)?.into_iter().find(|slot| slot.id == break_id) else {
        return Err(AppError::NotFound(format!("break {}", break_id)));
    };
    if user_key(&slot.username) != user_key(&ctx.actor.name) && !ctx.actor.is_admin() {
        return Err(AppError::Policy("Only the owner or an admin can cancel a break".to_string()));
    }

    remove_flat_item(&mut state, BREAKS_SERVICE_ID, break_id)?;
    let subject = format!("{} {}–{}", slot.username, slot.start.format("%H:%M"), slot.end.format("%H:%M"));
    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Canceled,
            subject: &subject,
            service_id: BREAKS_SERVICE_ID,
            category_name: None,
            item_id: Some(break_id),
        },
        ctx.now,
    );
    Ok(state)
}
