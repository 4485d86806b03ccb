use std::fmt;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::models::{Appointment, AppointmentStatus, ClinicHours};
use crate::services::scheduling::normalize_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    InvalidTime,
    OutsideHours,
    Booked,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::InvalidTime => "invalid_time",
            UnavailableReason::OutsideHours => "outside_hours",
            UnavailableReason::Booked => "booked",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub reason: Option<UnavailableReason>,
    pub conflicting_patient: Option<String>,
}

impl AvailabilityCheck {
    fn open() -> Self {
        Self {
            available: true,
            reason: None,
            conflicting_patient: None,
        }
    }

    fn closed(reason: UnavailableReason) -> Self {
        Self {
            available: false,
            reason: Some(reason),
            conflicting_patient: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid time format")]
    InvalidTime,

    #[error("{detail}")]
    SlotUnavailable {
        reason: UnavailableReason,
        detail: String,
    },
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::InvalidTime => "invalid_time",
            BookingError::SlotUnavailable { .. } => "slot_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CancelError {
    #[error("Invalid date format")]
    InvalidDate,

    #[error("No matching appointment found to cancel")]
    NotFound,
}

impl CancelError {
    pub fn code(&self) -> &'static str {
        match self {
            CancelError::InvalidDate => "invalid_date",
            CancelError::NotFound => "not_found",
        }
    }
}

/// Appointment repository used by the orchestrator.
///
/// Implementations must make `book_appointment` re-check the slot atomically
/// with the write; a caller's earlier `check_availability` proves nothing.
pub trait CalendarStore: Send + Sync {
    /// Confirmed appointments on `date` ordered by time, or every confirmed
    /// appointment from today onwards ordered by (date, time).
    fn list_appointments(&self, date: Option<NaiveDate>) -> Vec<Appointment>;

    /// Confirmed appointments with `start <= date <= end`, ordered by (date, time).
    fn list_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<Appointment>;

    fn check_availability(&self, date: NaiveDate, time: &str) -> AvailabilityCheck;

    fn book_appointment(
        &self,
        date: NaiveDate,
        time: &str,
        patient_name: &str,
        duration_minutes: u32,
    ) -> Result<Appointment, BookingError>;

    /// Soft-cancels the first match: exact date+time, then date+patient,
    /// then the patient's earliest upcoming appointment.
    fn cancel_appointment(
        &self,
        date: Option<&str>,
        time: Option<&str>,
        patient_name: Option<&str>,
    ) -> Result<Appointment, CancelError>;
}

struct CalendarData {
    appointments: Vec<Appointment>,
    next_id: u64,
}

pub struct InMemoryCalendar {
    data: Mutex<CalendarData>,
    hours: ClinicHours,
    clock: Arc<dyn Clock>,
}

impl InMemoryCalendar {
    pub fn new(hours: ClinicHours, clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Mutex::new(CalendarData {
                appointments: Vec::new(),
                next_id: 1,
            }),
            hours,
            clock,
        }
    }

    /// A calendar pre-filled with a few upcoming appointments for demos.
    pub fn with_demo_data(hours: ClinicHours, clock: Arc<dyn Clock>) -> Self {
        let calendar = Self::new(hours, clock);
        let today = calendar.clock.today();
        let tomorrow = today + Duration::days(1);
        let day_after = today + Duration::days(2);

        let seed = [
            (tomorrow, "09:00", "Alice Johnson"),
            (tomorrow, "10:30", "Bob Smith"),
            (tomorrow, "14:00", "Carol White"),
            (day_after, "11:00", "David Brown"),
        ];
        {
            let mut data = calendar.data.lock();
            for (date, time, patient) in seed {
                let Some(time) = normalize_time(time) else {
                    continue;
                };
                insert(&mut data, date, time, patient, 30);
            }
            tracing::info!(count = data.appointments.len(), "seeded demo appointments");
        }
        calendar
    }

    pub fn hours(&self) -> &ClinicHours {
        &self.hours
    }

    /// Every stored appointment, cancelled ones included.
    pub fn all_appointments(&self) -> Vec<Appointment> {
        self.data.lock().appointments.clone()
    }

    fn check_slot(&self, appointments: &[Appointment], date: NaiveDate, time: &str) -> AvailabilityCheck {
        let Some(time) = normalize_time(time) else {
            tracing::debug!(time, "could not parse requested time");
            return AvailabilityCheck::closed(UnavailableReason::InvalidTime);
        };

        if !self.hours.contains(time) {
            return AvailabilityCheck::closed(UnavailableReason::OutsideHours);
        }

        match appointments
            .iter()
            .find(|apt| apt.is_confirmed() && apt.date == date && apt.time == time)
        {
            Some(existing) => AvailabilityCheck {
                conflicting_patient: Some(existing.patient_name.clone()),
                ..AvailabilityCheck::closed(UnavailableReason::Booked)
            },
            None => AvailabilityCheck::open(),
        }
    }

    fn unavailable_detail(&self, check: &AvailabilityCheck) -> String {
        match (check.reason, &check.conflicting_patient) {
            (Some(UnavailableReason::Booked), Some(patient)) => {
                format!("That time slot is already booked with {patient}")
            }
            (Some(UnavailableReason::OutsideHours), _) => {
                format!("Clinic hours are {}", self.hours.to_human_readable())
            }
            _ => "Time slot is not available".to_string(),
        }
    }
}

fn insert(
    data: &mut CalendarData,
    date: NaiveDate,
    time: NaiveTime,
    patient_name: &str,
    duration_minutes: u32,
) -> Appointment {
    let appointment = Appointment {
        id: format!("apt-{}", data.next_id),
        date,
        time,
        patient_name: patient_name.to_string(),
        duration_minutes,
        status: AppointmentStatus::Confirmed,
    };
    data.next_id += 1;
    data.appointments.push(appointment.clone());
    appointment
}

fn same_patient(apt: &Appointment, name: &str) -> bool {
    apt.patient_name.to_lowercase() == name.trim().to_lowercase()
}

impl CalendarStore for InMemoryCalendar {
    fn list_appointments(&self, date: Option<NaiveDate>) -> Vec<Appointment> {
        let today = self.clock.today();
        let data = self.data.lock();
        let mut found: Vec<Appointment> = data
            .appointments
            .iter()
            .filter(|apt| apt.is_confirmed())
            .filter(|apt| match date {
                Some(date) => apt.date == date,
                None => apt.date >= today,
            })
            .cloned()
            .collect();
        found.sort_by_key(|apt| (apt.date, apt.time));

        tracing::debug!(date = ?date, count = found.len(), "listed appointments");
        found
    }

    fn list_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<Appointment> {
        let data = self.data.lock();
        let mut found: Vec<Appointment> = data
            .appointments
            .iter()
            .filter(|apt| apt.is_confirmed() && (start..=end).contains(&apt.date))
            .cloned()
            .collect();
        found.sort_by_key(|apt| (apt.date, apt.time));

        tracing::debug!(%start, %end, count = found.len(), "listed appointments in range");
        found
    }

    fn check_availability(&self, date: NaiveDate, time: &str) -> AvailabilityCheck {
        let data = self.data.lock();
        let check = self.check_slot(&data.appointments, date, time);
        tracing::info!(%date, time, available = check.available, reason = ?check.reason, "checked availability");
        check
    }

    fn book_appointment(
        &self,
        date: NaiveDate,
        time: &str,
        patient_name: &str,
        duration_minutes: u32,
    ) -> Result<Appointment, BookingError> {
        let parsed = normalize_time(time).ok_or(BookingError::InvalidTime)?;

        // Check and insert under one lock so two bookings cannot both see the slot free.
        let mut data = self.data.lock();
        let check = self.check_slot(&data.appointments, date, time);
        if !check.available {
            let reason = check.reason.unwrap_or(UnavailableReason::Booked);
            tracing::info!(%date, time, %reason, "slot not available for booking");
            return Err(BookingError::SlotUnavailable {
                reason,
                detail: self.unavailable_detail(&check),
            });
        }

        let appointment = insert(&mut data, date, parsed, patient_name.trim(), duration_minutes);
        tracing::info!(id = %appointment.id, patient = patient_name, %date, time = %parsed.format("%H:%M"), "appointment booked");
        Ok(appointment)
    }

    fn cancel_appointment(
        &self,
        date: Option<&str>,
        time: Option<&str>,
        patient_name: Option<&str>,
    ) -> Result<Appointment, CancelError> {
        let date = match date {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| CancelError::InvalidDate)?,
            ),
            None => None,
        };
        let time = time.and_then(normalize_time);
        let patient_name = patient_name.map(str::trim).filter(|n| !n.is_empty());
        let today = self.clock.today();

        let mut data = self.data.lock();
        let appointments = &mut data.appointments;

        let by_date_time = match (date, time) {
            (Some(date), Some(time)) => appointments
                .iter()
                .position(|apt| apt.is_confirmed() && apt.date == date && apt.time == time),
            _ => None,
        };

        let by_date_patient = || match (date, patient_name) {
            (Some(date), Some(name)) => appointments
                .iter()
                .position(|apt| apt.is_confirmed() && apt.date == date && same_patient(apt, name)),
            _ => None,
        };

        let by_patient = || {
            let name = patient_name?;
            appointments
                .iter()
                .enumerate()
                .filter(|(_, apt)| apt.is_confirmed() && apt.date >= today && same_patient(apt, name))
                .min_by_key(|(_, apt)| (apt.date, apt.time))
                .map(|(idx, _)| idx)
        };

        let Some(idx) = by_date_time.or_else(by_date_patient).or_else(by_patient) else {
            tracing::info!(date = ?date, time = ?time, patient = ?patient_name, "no matching appointment to cancel");
            return Err(CancelError::NotFound);
        };

        let appointment = &mut appointments[idx];
        appointment.status = AppointmentStatus::Cancelled;
        tracing::info!(id = %appointment.id, patient = %appointment.patient_name, status = appointment.status.as_str(), "appointment cancelled");
        Ok(appointment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn calendar() -> InMemoryCalendar {
        InMemoryCalendar::new(ClinicHours::default(), Arc::new(FixedClock(d("2025-10-31"))))
    }

    #[test]
    fn test_booked_slot_is_unavailable() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "09:00", "Alice Johnson", 30).unwrap();

        let check = cal.check_availability(d("2025-11-01"), "09:00");
        assert!(!check.available);
        assert_eq!(check.reason, Some(UnavailableReason::Booked));
        assert_eq!(check.conflicting_patient.as_deref(), Some("Alice Johnson"));
    }

    #[test]
    fn test_twelve_hour_input_matches_booked_slot() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "2 PM", "Alice", 30).unwrap();
        assert!(!cal.check_availability(d("2025-11-01"), "14:00").available);
    }

    #[test]
    fn test_outside_hours_regardless_of_occupancy() {
        let cal = calendar();
        for time in ["08:59", "18:00", "19:30", "7 AM"] {
            let check = cal.check_availability(d("2025-11-01"), time);
            assert_eq!(check.reason, Some(UnavailableReason::OutsideHours), "{time}");

            let err = cal.book_appointment(d("2025-11-01"), time, "Eve", 30).unwrap_err();
            assert_eq!(
                err,
                BookingError::SlotUnavailable {
                    reason: UnavailableReason::OutsideHours,
                    detail: "Clinic hours are 09:00 to 18:00".to_string(),
                }
            );
        }
    }

    #[test]
    fn test_invalid_time() {
        let cal = calendar();
        let check = cal.check_availability(d("2025-11-01"), "quarter past");
        assert_eq!(check.reason, Some(UnavailableReason::InvalidTime));
        assert_eq!(
            cal.book_appointment(d("2025-11-01"), "26:00", "Eve", 30),
            Err(BookingError::InvalidTime)
        );
    }

    #[test]
    fn test_second_booking_of_same_slot_fails() {
        let cal = calendar();
        let first = cal.book_appointment(d("2025-11-01"), "15:00", "John Doe", 30).unwrap();
        assert_eq!(first.time.format("%H:%M").to_string(), "15:00");
        assert_eq!(first.status, AppointmentStatus::Confirmed);

        let second = cal.book_appointment(d("2025-11-01"), "15:00", "Jane Doe", 30).unwrap_err();
        assert_eq!(second.code(), "slot_unavailable");
        assert_eq!(second.to_string(), "That time slot is already booked with John Doe");
    }

    #[test]
    fn test_ids_are_unique() {
        let cal = calendar();
        let a = cal.book_appointment(d("2025-11-01"), "09:00", "A", 30).unwrap();
        cal.cancel_appointment(Some("2025-11-01"), Some("09:00"), None).unwrap();
        let b = cal.book_appointment(d("2025-11-01"), "09:00", "B", 30).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_cancel_frees_slot_and_hides_from_listing() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "10:00", "Bob Smith", 30).unwrap();

        let cancelled = cal.cancel_appointment(Some("2025-11-01"), Some("10:00"), None).unwrap();
        assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
        assert!(cal.check_availability(d("2025-11-01"), "10:00").available);
        assert!(cal.list_appointments(Some(d("2025-11-01"))).is_empty());
        assert!(cal.list_appointments(None).is_empty());

        // Soft cancellation: the row stays.
        assert_eq!(cal.all_appointments().len(), 1);
    }

    #[test]
    fn test_cancelled_appointments_are_not_resurrected() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "10:00", "Bob", 30).unwrap();
        cal.cancel_appointment(Some("2025-11-01"), Some("10:00"), None).unwrap();
        assert_eq!(
            cal.cancel_appointment(Some("2025-11-01"), Some("10:00"), None),
            Err(CancelError::NotFound)
        );
    }

    #[test]
    fn test_list_sorted_by_time() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "14:00", "C", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "09:00", "A", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "10:30", "B", 30).unwrap();

        let names: Vec<String> = cal
            .list_appointments(Some(d("2025-11-01")))
            .into_iter()
            .map(|a| a.patient_name)
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_list_all_future_excludes_past() {
        let cal = calendar();
        cal.book_appointment(d("2025-10-30"), "09:00", "Past", 30).unwrap();
        cal.book_appointment(d("2025-11-02"), "09:00", "Later", 30).unwrap();
        cal.book_appointment(d("2025-10-31"), "11:00", "Today", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "09:00", "Soon", 30).unwrap();

        let names: Vec<String> = cal
            .list_appointments(None)
            .into_iter()
            .map(|a| a.patient_name)
            .collect();
        assert_eq!(names, vec!["Today", "Soon", "Later"]);
    }

    #[test]
    fn test_list_between_is_inclusive_and_skips_cancelled() {
        let cal = calendar();
        cal.book_appointment(d("2025-10-30"), "09:00", "Before", 30).unwrap();
        cal.book_appointment(d("2025-11-04"), "11:00", "End", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "14:00", "Start late", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "09:00", "Start", 30).unwrap();
        cal.book_appointment(d("2025-11-02"), "10:00", "Gone", 30).unwrap();
        cal.book_appointment(d("2025-11-05"), "09:00", "After", 30).unwrap();
        cal.cancel_appointment(Some("2025-11-02"), Some("10:00"), None).unwrap();

        let names: Vec<String> = cal
            .list_between(d("2025-11-01"), d("2025-11-04"))
            .into_iter()
            .map(|a| a.patient_name)
            .collect();
        assert_eq!(names, vec!["Start", "Start late", "End"]);
    }

    #[test]
    fn test_cancel_precedence() {
        let cal = calendar();
        cal.book_appointment(d("2025-11-01"), "09:00", "Alice", 30).unwrap();
        cal.book_appointment(d("2025-11-01"), "10:00", "Bob", 30).unwrap();

        // date+time wins over the patient name
        let cancelled = cal
            .cancel_appointment(Some("2025-11-01"), Some("10:00"), Some("Alice"))
            .unwrap();
        assert_eq!(cancelled.patient_name, "Bob");

        // date+patient, case-insensitive
        let cancelled = cal.cancel_appointment(Some("2025-11-01"), None, Some("alice")).unwrap();
        assert_eq!(cancelled.patient_name, "Alice");
    }

    #[test]
    fn test_cancel_by_patient_picks_earliest_upcoming() {
        let cal = calendar();
        cal.book_appointment(d("2025-10-20"), "09:00", "Dana", 30).unwrap();
        cal.book_appointment(d("2025-11-05"), "09:00", "Dana", 30).unwrap();
        cal.book_appointment(d("2025-11-03"), "15:00", "Dana", 30).unwrap();

        let cancelled = cal.cancel_appointment(None, None, Some("DANA")).unwrap();
        assert_eq!(cancelled.date, d("2025-11-03"));
    }

    #[test]
    fn test_cancel_errors() {
        let cal = calendar();
        assert_eq!(
            cal.cancel_appointment(Some("next week"), Some("10:00"), None),
            Err(CancelError::InvalidDate)
        );
        assert_eq!(
            cal.cancel_appointment(Some("2025-11-01"), Some("10:00"), None),
            Err(CancelError::NotFound)
        );
        assert_eq!(cal.cancel_appointment(None, None, None), Err(CancelError::NotFound));
    }

    #[test]
    fn test_demo_data_is_upcoming() {
        let cal = InMemoryCalendar::with_demo_data(
            ClinicHours::default(),
            Arc::new(FixedClock(d("2025-10-31"))),
        );
        let upcoming = cal.list_appointments(None);
        assert_eq!(upcoming.len(), 4);
        assert_eq!(upcoming[0].patient_name, "Alice Johnson");
        assert_eq!(upcoming[0].date, d("2025-11-01"));
        assert_eq!(upcoming[3].patient_name, "David Brown");
    }

    #[test]
    fn test_concurrent_bookings_only_one_wins() {
        let cal = Arc::new(calendar());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cal = Arc::clone(&cal);
                std::thread::spawn(move || {
                    cal.book_appointment(d("2025-11-01"), "11:00", &format!("Patient {i}"), 30)
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
