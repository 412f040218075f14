use crate::errors::{AppError, AppResult};
use crate::models::{
    AppData, CommentForecast, CommentSample, CommentTrend, RecordCommentAnalysisPayload, RegressionLine,
    VelocityPoint,
};
use crate::notifications::{notify, ChangeNotice, ChangeVerb};
use crate::services::{upsert_flat_item, MutationContext};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

pub const COMMENT_ANALYSIS_SERVICE_ID: &str = "comment-analysis";

const TREND_BAND: f64 = 0.15;
const MAX_HORIZON_HOURS: u32 = 24 * 14;

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

fn sorted(samples: &[CommentSample]) -> Vec<CommentSample> {
    let mut ordered = samples.to_vec();
    ordered.sort_by_key(|sample| sample.timestamp);
    ordered
}

/// Comments per hour between consecutive samples, placed at each interval's midpoint.
pub fn velocity_series(samples: &[CommentSample]) -> Vec<VelocityPoint> {
    sorted(samples)
        .windows(2)
        .filter_map(|pair| {
            let hours = hours_between(pair[0].timestamp, pair[1].timestamp);
            if hours <= 0.0 {
                return None;
            }
            let delta = pair[1].total_comments as f64 - pair[0].total_comments as f64;
            let midpoint = pair[0].timestamp + (pair[1].timestamp - pair[0].timestamp) / 2;
            Some(VelocityPoint {
                at: midpoint,
                per_hour: delta / hours,
            })
        })
        .collect()
}

/// Ordinary least squares fit of y on x.
pub fn linear_regression(points: &[(f64, f64)]) -> Option<RegressionLine> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
    Some(RegressionLine {
        slope,
        intercept,
        r_squared,
    })
}

fn trend_of(velocity: &[VelocityPoint]) -> CommentTrend {
    if velocity.len() < 2 {
        return CommentTrend::Steady;
    }
    let split = velocity.len() / 2;
    let mean = |points: &[VelocityPoint]| points.iter().map(|point| point.per_hour).sum::<f64>() / points.len() as f64;
    let earlier = mean(&velocity[..split]);
    let later = mean(&velocity[split..]);

    if earlier <= 0.0 {
        return if later > 0.0 { CommentTrend::Accelerating } else { CommentTrend::Steady };
    }
    let ratio = later / earlier;
    if ratio > 1.0 + TREND_BAND {
        CommentTrend::Accelerating
    } else if ratio < 1.0 - TREND_BAND {
        CommentTrend::Slowing
    } else {
        CommentTrend::Steady
    }
}

pub fn forecast_comments(samples: &[CommentSample], horizon_hours: u32) -> AppResult<CommentForecast> {
    if samples.len() < 2 {
        return Err(AppError::Validation(
            "At least two comment samples are needed for a forecast".to_string(),
        ));
    }
    if horizon_hours == 0 || horizon_hours > MAX_HORIZON_HOURS {
        return Err(AppError::Validation(format!(
            "Forecast horizon must be between 1 and {} hours",
            MAX_HORIZON_HOURS
        )));
    }

    let ordered = sorted(samples);
    let origin = ordered[0].timestamp;
    let Some(last) = ordered.last().copied() else {
        return Err(AppError::Validation("No comment samples".to_string()));
    };
    let points: Vec<(f64, f64)> = ordered
        .iter()
        .map(|sample| (hours_between(origin, sample.timestamp), sample.total_comments as f64))
        .collect();
    let Some(regression) = linear_regression(&points) else {
        return Err(AppError::Validation(
            "Comment samples must span more than one point in time".to_string(),
        ));
    };

    let target = hours_between(origin, last.timestamp + Duration::hours(i64::from(horizon_hours)));
    let projected = regression.intercept + regression.slope * target;
    let predicted_total = if projected.is_finite() {
        projected.round().max(last.total_comments as f64) as u64
    } else {
        last.total_comments
    };

    let velocity = velocity_series(&ordered);
    Ok(CommentForecast {
        horizon_hours,
        predicted_total,
        per_hour: regression.slope,
        trend: trend_of(&velocity),
        regression,
        velocity,
    })
}

/// Stores a forecast for a post in the comment-analysis feed.
pub fn record_comment_analysis(
    mut state: AppData,
    ctx: MutationContext<'_>,
    payload: &RecordCommentAnalysisPayload,
    default_horizon_hours: u32,
) -> AppResult<AppData> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Analysis title cannot be empty".to_string()));
    }
    let forecast = forecast_comments(
        &payload.samples,
        payload.horizon_hours.unwrap_or(default_horizon_hours),
    )?;

    let id = Uuid::new_v4().to_string();
    let entry = json!({
        "id": id,
        "title": title,
        "url": payload.url.as_deref().map(str::trim).filter(|url| !url.is_empty()),
        "samples": sorted(&payload.samples),
        "forecast": forecast,
        "createdAt": ctx.now,
        "author": ctx.actor.name,
    });
    upsert_flat_item(&mut state, COMMENT_ANALYSIS_SERVICE_ID, entry)?;
    notify(
        &mut state,
        &ChangeNotice {
            actor: &ctx.actor.name,
            verb: ChangeVerb::Recorded,
            subject: title,
            service_id: COMMENT_ANALYSIS_SERVICE_ID,
            category_name: None,
            item_id: Some(id.as_str()),
        },
        ctx.now,
    );
    Ok(state)
}
