use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    coordinate::{Coordinate, InvalidCoordinate},
    error::AppError,
    state,
    store::{BackupRecord, SOURCE_MANUAL, SOURCE_MOBILE_DEFAULT, UpsertOutcome},
    utils::{number_field, string_field, timestamp_field},
};

pub type SharedState = Arc<state::State>;

type JsonResult = Result<Json<Value>, AppError>;

#[derive(Serialize)]
struct BinBackup<'a> {
    #[serde(rename = "binId")]
    bin_id: &'a str,
    #[serde(flatten)]
    record: &'a BackupRecord,
}

fn body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| AppError::MalformedPayload(e.body_text()))
}

/// Validated coordinate from a request body's `latitude`/`longitude` fields.
fn coordinate_from(
    body: &Value,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<Coordinate, AppError> {
    let latitude = number_field(body.get("latitude"));
    let longitude = number_field(body.get("longitude"));

    let (Some(lat), Some(lon)) = (latitude, longitude) else {
        return Err(InvalidCoordinate {
            latitude,
            longitude,
        }
        .into());
    };

    Ok(Coordinate::new(lat, lon, timestamp)?)
}

fn outcome_message(bin_id: &str, outcome: UpsertOutcome) -> String {
    match outcome {
        UpsertOutcome::Committed => format!("Backup saved for bin {bin_id}"),
        UpsertOutcome::Stale => {
            format!("Backup for bin {bin_id} unchanged, a newer coordinate is already stored")
        }
    }
}

fn write_outcome(outcome: UpsertOutcome) -> &'static str {
    match outcome {
        UpsertOutcome::Committed => "backed-up",
        UpsertOutcome::Stale => "skipped-stale-write",
    }
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "success": true }))
}

pub async fn status_handler(State(state): State<SharedState>) -> Json<Value> {
    let status = state.scheduler.status().await;

    Json(json!({
        "success": true,
        "status": status,
    }))
}

pub async fn display_handler(
    State(state): State<SharedState>,
    Path(bin_id): Path<String>,
) -> JsonResult {
    let display = state
        .arbiter
        .display_coordinate(&bin_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No coordinates found for bin {bin_id}")))?;

    Ok(Json(json!({
        "success": true,
        "binId": bin_id,
        "coordinates": display.coordinate,
        "source": display.source,
    })))
}

pub async fn get_backup_handler(
    State(state): State<SharedState>,
    Path(bin_id): Path<String>,
) -> JsonResult {
    let record = state.store.get(&bin_id).await?.ok_or_else(|| {
        AppError::NotFound(format!("No backup coordinates found for bin {bin_id}"))
    })?;

    Ok(Json(json!({
        "success": true,
        "binId": bin_id,
        "coordinates": record,
    })))
}

pub async fn trigger_backup_handler(
    State(state): State<SharedState>,
    Path(bin_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> JsonResult {
    let body = body(payload)?;
    let coordinate = coordinate_from(&body, state.clock.now())?;

    let record = BackupRecord::new(coordinate, SOURCE_MANUAL);
    let outcome = state.store.upsert(&bin_id, record.clone()).await?;

    info!(bin_id = %bin_id, ?outcome, "Manual backup requested");

    Ok(Json(json!({
        "success": true,
        "message": outcome_message(&bin_id, outcome),
        "outcome": write_outcome(outcome),
        "coordinates": record,
    })))
}

pub async fn force_backup_handler(State(state): State<SharedState>) -> JsonResult {
    info!("Force backup requested");
    let report = state.scheduler.trigger().await?;

    Ok(Json(json!({
        "success": true,
        "message": "Force backup completed",
        "report": report,
    })))
}

pub async fn bins_status_handler(State(state): State<SharedState>) -> JsonResult {
    let bins = state.reporter.fleet_status().await?;

    Ok(Json(json!({
        "success": true,
        "bins": bins,
    })))
}

pub async fn dynamic_status_handler(
    State(state): State<SharedState>,
    Path(bin_id): Path<String>,
) -> JsonResult {
    let status = state
        .reporter
        .dynamic_bin_status(&bin_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Bin not found".to_string()))?;

    Ok(Json(json!({
        "success": true,
        "binId": bin_id,
        "status": status,
    })))
}

pub async fn dynamic_fleet_handler(State(state): State<SharedState>) -> JsonResult {
    let bins = state.reporter.dynamic_fleet_status().await?;

    Ok(Json(json!({
        "success": true,
        "bins": bins,
    })))
}

pub async fn save_handler(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> JsonResult {
    let body = body(payload)?;

    let bin_id = string_field(body.get("binId"))
        .ok_or_else(|| AppError::MalformedPayload("Missing required field: binId".to_string()))?;

    let now = state.clock.now();
    let timestamp = match body.get("timestamp") {
        None | Some(Value::Null) => now,
        raw => timestamp_field(raw)
            .ok_or_else(|| AppError::MalformedPayload("Unreadable timestamp".to_string()))?,
    };

    if state.config.live_policy().is_from_future(timestamp, now) {
        return Err(AppError::MalformedPayload(format!(
            "Timestamp {timestamp} is ahead of server time {now}"
        )));
    }

    let coordinate = coordinate_from(&body, timestamp)?;
    let source =
        string_field(body.get("source")).unwrap_or_else(|| SOURCE_MOBILE_DEFAULT.to_string());

    let record = BackupRecord::new(coordinate, source);
    let outcome = state.store.upsert(&bin_id, record.clone()).await?;

    info!(bin_id = %bin_id, ?outcome, source = %record.source, "Mobile backup received");

    Ok(Json(json!({
        "success": true,
        "message": outcome_message(&bin_id, outcome),
        "outcome": write_outcome(outcome),
        "data": BinBackup {
            bin_id: &bin_id,
            record: &record,
        },
    })))
}

pub async fn all_backups_handler(State(state): State<SharedState>) -> JsonResult {
    let backups = state.store.list().await?;

    let data: Vec<BinBackup> = backups
        .iter()
        .map(|(bin_id, record)| BinBackup { bin_id, record })
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": data,
    })))
}

pub async fn mobile_backup_handler(
    State(state): State<SharedState>,
    Path(bin_id): Path<String>,
) -> JsonResult {
    let record = state
        .store
        .get(&bin_id)
        .await?
        .ok_or_else(|| AppError::NotFound("No GPS backup found for this bin".to_string()))?;

    Ok(Json(json!({
        "success": true,
        "data": BinBackup {
            bin_id: &bin_id,
            record: &record,
        },
    })))
}
