//! Operator endpoints.

use crate::{errors::AppError, services::reconciler::SweepReport, state::AppState};
use axum::{Json, extract::State};

/// `POST /admin/sweep`
///
/// Runs one reconciliation cycle immediately and returns its report.
/// Responds 409 while a scheduled cycle is in progress.
pub async fn trigger_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.reconciler.sweep().await?;
    Ok(Json(report))
}
