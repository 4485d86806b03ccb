use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ListAppointments,
    BookAppointment,
    CheckAvailability,
    CancelAppointment,
    SystemInfo,
    OutOfScope,
    Error,
    #[serde(other)]
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ListAppointments => "list_appointments",
            Intent::BookAppointment => "book_appointment",
            Intent::CheckAvailability => "check_availability",
            Intent::CancelAppointment => "cancel_appointment",
            Intent::SystemInfo => "system_info",
            Intent::OutOfScope => "out_of_scope",
            Intent::Error => "error",
            Intent::Unknown => "unknown",
        }
    }

    /// Intents answered directly from the classifier's own reply.
    pub fn is_conversational(&self) -> bool {
        matches!(self, Intent::SystemInfo | Intent::OutOfScope)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of information the assistant may still need from the user.
///
/// Duration is not a field here; it always falls back to the clinic default.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Date,
    StartDate,
    EndDate,
    Time,
    PatientName,
}

impl Field {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "date" => Some(Field::Date),
            "start_date" => Some(Field::StartDate),
            "end_date" => Some(Field::EndDate),
            "time" => Some(Field::Time),
            "patient_name" | "patient" | "name" => Some(Field::PatientName),
            _ => None,
        }
    }
}

/// Structured output of the intent classifier, after normalization.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassifiedIntent {
    pub intent: Intent,
    pub date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub time: Option<String>,
    pub patient_name: Option<String>,
    pub duration: Option<u32>,
    pub clarification_needed: bool,
    pub missing_fields: BTreeSet<Field>,
    pub response: Option<String>,
    /// Upstream failure that forced the `error` intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassifiedIntent {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            date: None,
            start_date: None,
            end_date: None,
            time: None,
            patient_name: None,
            duration: None,
            clarification_needed: false,
            missing_fields: BTreeSet::new(),
            response: None,
            error: None,
        }
    }

    pub fn upstream_failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(Intent::Error)
        }
    }
}

/// Classifier output exactly as the model produced it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClassification {
    #[serde(default, deserialize_with = "lenient_intent")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_duration")]
    pub duration: Option<u32>,
    #[serde(default)]
    pub clarification_needed: Option<bool>,
    #[serde(default)]
    pub missing_fields: Option<Vec<String>>,
    #[serde(default)]
    pub response: Option<String>,
}

impl From<RawClassification> for ClassifiedIntent {
    fn from(raw: RawClassification) -> Self {
        let intent = raw.intent.unwrap_or(Intent::Unknown);
        let raw_missing = raw.missing_fields.unwrap_or_default();
        let mut clarification_needed = raw.clarification_needed.unwrap_or(false);
        let mut missing_fields: BTreeSet<Field> =
            raw_missing.iter().filter_map(|name| Field::parse(name)).collect();

        // Duration never blocks an action: if it was the only thing "missing",
        // there is nothing left to clarify.
        let asked_for_duration = raw_missing
            .iter()
            .any(|name| name.trim().eq_ignore_ascii_case("duration"));
        if asked_for_duration && missing_fields.is_empty() {
            clarification_needed = false;
        }

        if intent.is_conversational() {
            clarification_needed = false;
            missing_fields.clear();
        }

        Self {
            intent,
            date: non_blank(raw.date),
            start_date: non_blank(raw.start_date),
            end_date: non_blank(raw.end_date),
            time: non_blank(raw.time),
            patient_name: non_blank(raw.patient_name),
            duration: raw.duration.filter(|d| *d > 0),
            clarification_needed,
            missing_fields,
            response: non_blank(raw.response),
            error: None,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

fn lenient_intent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Intent>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|s| {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .unwrap_or(Intent::Unknown)
    }))
}

fn lenient_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u32),
        Some(serde_json::Value::String(s)) => parse_duration_text(&s),
        _ => None,
    })
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)\s*(minutes?|mins?|m|hours?|hrs?|h)?$").expect("valid duration regex")
    })
}

/// `"45"`, `"45 minutes"`, `"1 hour"`, `"1.5 hrs"`; a bare number is minutes.
fn parse_duration_text(text: &str) -> Option<u32> {
    let lowered = text.trim().to_lowercase();
    let caps = duration_re().captures(&lowered)?;
    let value: f64 = caps[1].parse().ok()?;
    let per_unit = match caps.get(2).map(|m| m.as_str()) {
        Some(unit) if unit.starts_with('h') => 60.0,
        _ => 1.0,
    };
    Some((value * per_unit).round() as u32)
}
