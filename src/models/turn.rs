use std::collections::BTreeSet;

use serde::Serialize;

use crate::errors::TurnError;
use crate::models::{AppointmentSummary, ClassifiedIntent, Field, Intent};

/// Accumulator carried through the state machine for a single turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_message: String,
    pub intent: Option<Intent>,
    pub date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub time: Option<String>,
    pub patient_name: Option<String>,
    pub duration_minutes: u32,
    pub clarification_needed: bool,
    pub missing_fields: BTreeSet<Field>,
    pub available: bool,
    pub appointments_found: Vec<AppointmentSummary>,
    pub outcome: Option<Outcome>,
    pub error: Option<TurnError>,
    reply_text: String,
}

impl TurnContext {
    pub fn new(user_message: impl Into<String>, default_duration: u32) -> Self {
        Self {
            user_message: user_message.into(),
            intent: None,
            date: None,
            start_date: None,
            end_date: None,
            time: None,
            patient_name: None,
            duration_minutes: default_duration,
            clarification_needed: false,
            missing_fields: BTreeSet::new(),
            available: false,
            appointments_found: Vec::new(),
            outcome: None,
            error: None,
            reply_text: String::new(),
        }
    }

    pub fn apply_classification(&mut self, classified: ClassifiedIntent) {
        self.intent = Some(classified.intent);
        self.date = classified.date;
        self.start_date = classified.start_date;
        self.end_date = classified.end_date;
        self.time = classified.time;
        self.patient_name = classified.patient_name;
        if let Some(duration) = classified.duration {
            self.duration_minutes = duration;
        }
        self.clarification_needed = classified.clarification_needed;
        self.missing_fields = classified.missing_fields;
    }

    pub fn reply(&self) -> &str {
        &self.reply_text
    }

    pub fn has_reply(&self) -> bool {
        !self.reply_text.trim().is_empty()
    }

    /// Sets the reply unless an earlier stage already produced one.
    pub fn set_reply(&mut self, text: impl Into<String>) -> bool {
        if self.has_reply() {
            return false;
        }
        self.reply_text = text.into();
        true
    }

    /// Keeps the first error seen, except that a failure the caller must see
    /// (upstream or unknown) replaces a recoverable one.
    pub fn record_error(&mut self, error: TurnError) {
        match &self.error {
            None => self.error = Some(error),
            Some(existing) if existing.is_recoverable() && !error.is_recoverable() => {
                self.error = Some(error)
            }
            Some(_) => {}
        }
    }

    pub fn needs(&mut self, field: Field) {
        self.clarification_needed = true;
        self.missing_fields.insert(field);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ListScope {
    Day { date: String },
    Range { start_date: String, end_date: String },
    Week { start_date: String, end_date: String },
    AllFuture,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlternativeSlot {
    pub time: String,
    pub formatted: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_date: Option<String>,
}

/// What happened during a turn, in the form the response synthesizer consumes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    AppointmentsFound {
        scope: ListScope,
        count: usize,
        appointments: Vec<AppointmentSummary>,
    },
    NoAppointments {
        scope: ListScope,
    },
    MissingTime {
        date: Option<String>,
    },
    PastDate {
        date: String,
    },
    OutsideHours {
        date: String,
        time: String,
        clinic_hours: String,
    },
    Available {
        date: String,
        time: String,
    },
    SlotTaken {
        requested_date: String,
        requested_time: String,
        available_slots: Vec<AlternativeSlot>,
        #[serde(skip_serializing_if = "Option::is_none")]
        booked_with: Option<String>,
    },
    Booked {
        appointment_id: String,
        patient_name: String,
        date: String,
        time: String,
        duration_minutes: u32,
    },
    BookingFailed {
        reason: String,
        error_message: String,
    },
    Cancelled {
        patient_name: String,
        date: String,
        time: String,
    },
    CancelNotFound {
        error_message: String,
        date: Option<String>,
        time: Option<String>,
        patient_name: Option<String>,
    },
    CancelNeedsInfo {
        message: String,
    },
    Clarification {
        missing_fields: BTreeSet<Field>,
        has_date: bool,
        has_time: bool,
        has_patient: bool,
        date: Option<String>,
        time: Option<String>,
        patient_name: Option<String>,
    },
    Fallback {
        clarification_needed: bool,
        missing_fields: BTreeSet<Field>,
    },
}

/// Input handed to the response synthesizer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseContext {
    pub intent: Option<Intent>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResponseContext {
    pub fn new(intent: Option<Intent>, outcome: Outcome) -> Self {
        Self { intent, outcome }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}
