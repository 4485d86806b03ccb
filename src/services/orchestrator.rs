use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use crate::clock::Clock;
use crate::errors::TurnError;
use crate::models::{
    Appointment, AppointmentSummary, ClinicHours, ConversationTurn, Field, Intent, ListScope,
    Outcome, ResponseContext, TurnContext,
};
use crate::services::ai::intent::IntentClassifier;
use crate::services::ai::response::{ResponseSynthesizer, FALLBACK_REPLY};
use crate::services::calendar::{BookingError, CalendarStore, CancelError, UnavailableReason};
use crate::services::scheduling::{
    alternative_slots, canonical_date, long_date, normalize_date, normalize_time, to_24h,
    twelve_hour, weekday_name,
};

const EMPTY_INPUT_REPLY: &str = "I didn't catch that. Could you please speak again?";
const INVALID_DATE_REPLY: &str = "I couldn't understand that date. Please provide a valid date.";
const INVALID_RANGE_REPLY: &str =
    "I couldn't understand that date range. Please provide valid dates.";
const INVALID_TIME_REPLY: &str =
    "I couldn't understand that time. Please give a time like 2:30 PM or 14:30.";
const CANCEL_NEEDS_INFO: &str =
    "Please provide the appointment date or patient name to cancel";

/// Days after `start_date` covered when a listing has no end date.
const OPEN_RANGE_DAYS: i64 = 7;

/// Clinic configuration the orchestrator works with.
#[derive(Debug, Clone)]
pub struct ClinicSettings {
    pub name: String,
    pub hours: ClinicHours,
    pub default_duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParseIntent,
    List,
    CheckAvailability,
    Book,
    Cancel,
    Respond,
    End,
}

impl Stage {
    fn is_domain_action(self) -> bool {
        matches!(
            self,
            Stage::List | Stage::CheckAvailability | Stage::Book | Stage::Cancel
        )
    }
}

/// Where to go once the utterance has been classified.
pub fn route_after_intent(ctx: &TurnContext) -> Stage {
    match ctx.intent {
        Some(Intent::Error | Intent::OutOfScope | Intent::SystemInfo) => Stage::Respond,
        _ if ctx.clarification_needed => Stage::Respond,
        Some(Intent::ListAppointments) => Stage::List,
        Some(Intent::BookAppointment | Intent::CheckAvailability) => Stage::CheckAvailability,
        Some(Intent::CancelAppointment) => Stage::Cancel,
        Some(Intent::Unknown) | None => Stage::Respond,
    }
}

/// Booking only ever follows a successful availability check in the same turn.
pub fn route_after_availability(ctx: &TurnContext) -> Stage {
    if ctx.intent == Some(Intent::BookAppointment) && ctx.available {
        Stage::Book
    } else {
        Stage::Respond
    }
}

/// Runs one turn through the scheduling state machine.
pub struct TurnOrchestrator {
    settings: ClinicSettings,
    classifier: Arc<dyn IntentClassifier>,
    synthesizer: Arc<dyn ResponseSynthesizer>,
    calendar: Arc<dyn CalendarStore>,
    clock: Arc<dyn Clock>,
}

impl TurnOrchestrator {
    pub fn new(
        settings: ClinicSettings,
        classifier: Arc<dyn IntentClassifier>,
        synthesizer: Arc<dyn ResponseSynthesizer>,
        calendar: Arc<dyn CalendarStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            classifier,
            synthesizer,
            calendar,
            clock,
        }
    }

    /// Always returns a context with a non-empty reply.
    pub async fn run(&self, utterance: &str, history: &[ConversationTurn]) -> TurnContext {
        let mut ctx = TurnContext::new(utterance, self.settings.default_duration_minutes);
        let mut stage = Stage::ParseIntent;

        loop {
            let result = match stage {
                Stage::ParseIntent => self.parse_intent(&mut ctx, history).await,
                Stage::List => self.list(&mut ctx),
                Stage::CheckAvailability => self.check_availability(&mut ctx),
                Stage::Book => self.book(&mut ctx),
                Stage::Cancel => self.cancel(&mut ctx),
                Stage::Respond => self.respond(&mut ctx).await,
                Stage::End => break,
            };

            let next = match result {
                Ok(next) if ctx.has_reply() && next.is_domain_action() => Stage::Respond,
                Ok(next) => next,
                Err(err) => {
                    tracing::error!(?stage, error = %err, "stage failed");
                    ctx.record_error(err);
                    ctx.set_reply(FALLBACK_REPLY);
                    Stage::End
                }
            };
            tracing::debug!(from = ?stage, to = ?next, "stage transition");
            stage = next;
        }

        if !ctx.has_reply() {
            ctx.set_reply(FALLBACK_REPLY);
        }
        ctx
    }

    async fn parse_intent(
        &self,
        ctx: &mut TurnContext,
        history: &[ConversationTurn],
    ) -> Result<Stage, TurnError> {
        if ctx.user_message.trim().chars().count() < 2 {
            ctx.intent = Some(Intent::Error);
            ctx.record_error(TurnError::Input("empty utterance".to_string()));
            ctx.set_reply(EMPTY_INPUT_REPLY);
            return Ok(Stage::Respond);
        }

        let classified = self.classifier.classify(ctx.user_message.trim(), history).await;
        let response = classified.response.clone();
        let upstream = classified.error.clone();
        ctx.apply_classification(classified);

        match ctx.intent {
            Some(Intent::Error) => {
                let reason = upstream.unwrap_or_else(|| "intent classifier failed".to_string());
                ctx.record_error(TurnError::Upstream(reason));
                ctx.set_reply(FALLBACK_REPLY);
            }
            Some(Intent::SystemInfo | Intent::OutOfScope) => {
                ctx.set_reply(response.unwrap_or_else(|| self.introduction()));
            }
            _ if ctx.clarification_needed => {
                ctx.record_error(TurnError::Validation(format!(
                    "missing {:?}",
                    ctx.missing_fields
                )));
            }
            _ => {}
        }

        tracing::info!(
            intent = ?ctx.intent,
            date = ?ctx.date,
            time = ?ctx.time,
            patient = ?ctx.patient_name,
            clarification = ctx.clarification_needed,
            "parsed intent"
        );
        Ok(route_after_intent(ctx))
    }

    fn list(&self, ctx: &mut TurnContext) -> Result<Stage, TurnError> {
        let (scope, appointments) = if let Some(raw) = ctx.date.clone() {
            let Some(date) = self.resolve_date(&raw) else {
                return Ok(self.reject_date(ctx, &raw, INVALID_DATE_REPLY));
            };
            ctx.date = Some(canonical_date(date));
            let found: Vec<AppointmentSummary> = self
                .calendar
                .list_appointments(Some(date))
                .iter()
                .map(|apt| summarize(apt, false))
                .collect();
            (ListScope::Day { date: long_date(date) }, found)
        } else if let Some(raw_start) = ctx.start_date.clone() {
            let Some(start) = self.resolve_date(&raw_start) else {
                let reply = if ctx.end_date.is_some() { INVALID_RANGE_REPLY } else { INVALID_DATE_REPLY };
                return Ok(self.reject_date(ctx, &raw_start, reply));
            };
            match ctx.end_date.clone() {
                Some(raw_end) => {
                    let Some(end) = self.resolve_date(&raw_end) else {
                        return Ok(self.reject_date(ctx, &raw_end, INVALID_RANGE_REPLY));
                    };
                    let (start, end) = if end < start { (end, start) } else { (start, end) };
                    let scope = ListScope::Range {
                        start_date: long_date(start),
                        end_date: long_date(end),
                    };
                    (scope, self.list_range(start, end))
                }
                None => {
                    let end = start + Duration::days(OPEN_RANGE_DAYS);
                    let scope = ListScope::Week {
                        start_date: long_date(start),
                        end_date: long_date(end),
                    };
                    (scope, self.list_range(start, end))
                }
            }
        } else {
            let found: Vec<AppointmentSummary> = self
                .calendar
                .list_appointments(None)
                .iter()
                .map(|apt| summarize(apt, true))
                .collect();
            (ListScope::AllFuture, found)
        };

        tracing::info!(scope = ?scope, count = appointments.len(), "listed appointments");

        ctx.appointments_found = appointments;
        ctx.outcome = Some(if ctx.appointments_found.is_empty() {
            Outcome::NoAppointments { scope }
        } else {
            Outcome::AppointmentsFound {
                scope,
                count: ctx.appointments_found.len(),
                appointments: ctx.appointments_found.clone(),
            }
        });
        Ok(Stage::Respond)
    }

    fn list_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<AppointmentSummary> {
        self.calendar
            .list_between(start, end)
            .iter()
            .map(|apt| summarize(apt, true))
            .collect()
    }

    fn check_availability(&self, ctx: &mut TurnContext) -> Result<Stage, TurnError> {
        let Some(raw_time) = ctx.time.clone() else {
            ctx.needs(Field::Time);
            ctx.record_error(TurnError::Validation("no time given".to_string()));
            ctx.outcome = Some(Outcome::MissingTime {
                date: ctx.date.clone(),
            });
            return Ok(Stage::Respond);
        };

        let Some(raw_date) = ctx.date.clone() else {
            ctx.needs(Field::Date);
            ctx.record_error(TurnError::Validation("no date given".to_string()));
            ctx.outcome = Some(clarification(ctx));
            return Ok(Stage::Respond);
        };

        let Some(date) = self.resolve_date(&raw_date) else {
            return Ok(self.reject_date(ctx, &raw_date, INVALID_DATE_REPLY));
        };
        ctx.date = Some(canonical_date(date));
        if let Some(canonical) = to_24h(&raw_time) {
            ctx.time = Some(canonical);
        }

        if ctx.intent == Some(Intent::BookAppointment) && date < self.clock.today() {
            tracing::info!(%date, "refusing to book in the past");
            ctx.available = false;
            ctx.record_error(TurnError::Validation(format!("{date} is in the past")));
            ctx.outcome = Some(Outcome::PastDate {
                date: canonical_date(date),
            });
            return Ok(Stage::Respond);
        }

        let time = ctx.time.clone().unwrap_or(raw_time);
        let check = self.calendar.check_availability(date, &time);
        ctx.available = check.available;

        if check.available {
            if ctx.intent == Some(Intent::CheckAvailability) {
                let parsed = normalize_time(&time)
                    .ok_or_else(|| TurnError::Unknown(format!("store accepted unparseable time {time}")))?;
                ctx.outcome = Some(Outcome::Available {
                    date: long_date(date),
                    time: twelve_hour(parsed),
                });
            }
            return Ok(route_after_availability(ctx));
        }

        match check.reason {
            Some(UnavailableReason::InvalidTime) => {
                ctx.record_error(TurnError::Parse(format!("unparseable time {time:?}")));
                ctx.set_reply(INVALID_TIME_REPLY);
            }
            Some(UnavailableReason::OutsideHours) => {
                ctx.record_error(TurnError::Validation(format!("{time} is outside clinic hours")));
                ctx.outcome = Some(Outcome::OutsideHours {
                    date: canonical_date(date),
                    time: time.clone(),
                    clinic_hours: self.settings.hours.to_human_readable(),
                });
            }
            Some(UnavailableReason::Booked) | None => {
                let requested = normalize_time(&time)
                    .ok_or_else(|| TurnError::Unknown(format!("store rejected unparseable time {time} as booked")))?;
                let available_slots =
                    alternative_slots(self.calendar.as_ref(), &self.settings.hours, date);
                tracing::info!(%date, %time, alternatives = available_slots.len(), "slot taken");
                ctx.record_error(TurnError::Conflict(format!("{date} {time} is booked")));
                ctx.outcome = Some(Outcome::SlotTaken {
                    requested_date: long_date(date),
                    requested_time: twelve_hour(requested),
                    available_slots,
                    booked_with: check.conflicting_patient,
                });
            }
        }

        Ok(route_after_availability(ctx))
    }

    fn book(&self, ctx: &mut TurnContext) -> Result<Stage, TurnError> {
        let Some(patient_name) = ctx.patient_name.clone() else {
            ctx.needs(Field::PatientName);
            ctx.record_error(TurnError::Validation("no patient name given".to_string()));
            ctx.outcome = Some(clarification(ctx));
            return Ok(Stage::Respond);
        };

        let date = ctx
            .date
            .as_deref()
            .and_then(|raw| self.resolve_date(raw))
            .ok_or_else(|| TurnError::Unknown("booking reached without a date".to_string()))?;
        let raw_time = ctx
            .time
            .clone()
            .ok_or_else(|| TurnError::Unknown("booking reached without a time".to_string()))?;
        let Some(time) = normalize_time(&raw_time) else {
            ctx.record_error(TurnError::Parse(format!("unparseable time {raw_time:?}")));
            ctx.set_reply(INVALID_TIME_REPLY);
            return Ok(Stage::Respond);
        };

        let booked = self.calendar.book_appointment(
            date,
            &time.format("%H:%M").to_string(),
            &patient_name,
            ctx.duration_minutes,
        );

        let outcome = match booked {
            Ok(appointment) => Outcome::Booked {
                appointment_id: appointment.id,
                patient_name: appointment.patient_name,
                date: long_date(appointment.date),
                time: twelve_hour(appointment.time),
                duration_minutes: appointment.duration_minutes,
            },
            Err(err) => {
                tracing::info!(error = %err, "booking rejected by calendar");
                ctx.record_error(match &err {
                    BookingError::InvalidTime => TurnError::Parse(err.to_string()),
                    BookingError::SlotUnavailable { .. } => TurnError::Conflict(err.to_string()),
                });
                Outcome::BookingFailed {
                    reason: err.code().to_string(),
                    error_message: err.to_string(),
                }
            }
        };
        ctx.outcome = Some(outcome);
        Ok(Stage::Respond)
    }

    fn cancel(&self, ctx: &mut TurnContext) -> Result<Stage, TurnError> {
        let lacks_anchor = ctx.date.is_none() && ctx.patient_name.is_none();
        let lacks_detail = ctx.time.is_none() && ctx.patient_name.is_none();
        if lacks_anchor || lacks_detail {
            ctx.record_error(TurnError::Validation("not enough detail to cancel".to_string()));
            ctx.outcome = Some(Outcome::CancelNeedsInfo {
                message: CANCEL_NEEDS_INFO.to_string(),
            });
            return Ok(Stage::Respond);
        }

        let date = match ctx.date.clone() {
            Some(raw) => match self.resolve_date(&raw) {
                Some(date) => Some(canonical_date(date)),
                None => return Ok(self.reject_date(ctx, &raw, INVALID_DATE_REPLY)),
            },
            None => None,
        };
        ctx.date = date.clone();
        if let Some(canonical) = ctx.time.as_deref().and_then(to_24h) {
            ctx.time = Some(canonical);
        }

        let cancelled = self.calendar.cancel_appointment(
            date.as_deref(),
            ctx.time.as_deref(),
            ctx.patient_name.as_deref(),
        );

        match cancelled {
            Ok(appointment) => {
                ctx.outcome = Some(Outcome::Cancelled {
                    patient_name: appointment.patient_name,
                    date: long_date(appointment.date),
                    time: twelve_hour(appointment.time),
                });
            }
            Err(CancelError::InvalidDate) => {
                let raw = date.unwrap_or_default();
                return Ok(self.reject_date(ctx, &raw, INVALID_DATE_REPLY));
            }
            Err(err @ CancelError::NotFound) => {
                ctx.record_error(TurnError::NotFound(err.to_string()));
                ctx.outcome = Some(Outcome::CancelNotFound {
                    error_message: err.to_string(),
                    date: ctx.date.clone(),
                    time: ctx.time.clone(),
                    patient_name: ctx.patient_name.clone(),
                });
            }
        }
        Ok(Stage::Respond)
    }

    async fn respond(&self, ctx: &mut TurnContext) -> Result<Stage, TurnError> {
        if ctx.has_reply() {
            tracing::debug!("reply already set, skipping synthesis");
            return Ok(Stage::End);
        }

        let outcome = match ctx.outcome.clone() {
            Some(outcome) => outcome,
            None if ctx.clarification_needed => clarification(ctx),
            None => Outcome::Fallback {
                clarification_needed: ctx.clarification_needed,
                missing_fields: ctx.missing_fields.clone(),
            },
        };

        let synthesis = self
            .synthesizer
            .synthesize(&ResponseContext::new(ctx.intent, outcome))
            .await;
        if let Some(err) = synthesis.error {
            ctx.record_error(TurnError::Upstream(err));
        }
        ctx.set_reply(synthesis.text);
        Ok(Stage::End)
    }

    fn resolve_date(&self, raw: &str) -> Option<NaiveDate> {
        normalize_date(raw, self.clock.today())
    }

    fn reject_date(&self, ctx: &mut TurnContext, raw: &str, reply: &str) -> Stage {
        tracing::info!(date = raw, "could not understand date");
        ctx.record_error(TurnError::Parse(format!("unparseable date {raw:?}")));
        ctx.set_reply(reply);
        Stage::Respond
    }

    fn introduction(&self) -> String {
        format!(
            "I'm the scheduling assistant for {}. I can help you book appointments, check availability, or view your schedule. What would you like to do?",
            self.settings.name
        )
    }
}

fn summarize(apt: &Appointment, with_weekday: bool) -> AppointmentSummary {
    AppointmentSummary {
        patient: apt.patient_name.clone(),
        date: long_date(apt.date),
        time: twelve_hour(apt.time),
        day_of_week: with_weekday.then(|| weekday_name(apt.date)),
    }
}

fn clarification(ctx: &TurnContext) -> Outcome {
    Outcome::Clarification {
        missing_fields: ctx.missing_fields.clone(),
        has_date: ctx.date.is_some(),
        has_time: ctx.time.is_some(),
        has_patient: ctx.patient_name.is_some(),
        date: ctx.date.clone(),
        time: ctx.time.clone(),
        patient_name: ctx.patient_name.clone(),
    }
}
