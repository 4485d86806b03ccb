use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::errors::AppError;
use crate::models::Appointment;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AppointmentsQuery {
    pub date: Option<String>,
}

/// Confirmed appointments on `date`, or every upcoming one.
pub async fn list_appointments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AppointmentsQuery>,
) -> Result<Json<Vec<Appointment>>, AppError> {
    let date = match query.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| AppError::BadRequest(format!("invalid date '{raw}', expected YYYY-MM-DD")))?,
        ),
        None => None,
    };

    Ok(Json(state.calendar.list_appointments(date)))
}
