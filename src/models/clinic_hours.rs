use chrono::{Duration, NaiveTime};

/// Daily opening window. Bookable times satisfy `start <= t < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinicHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

pub const SLOT_STEP_MINUTES: i64 = 30;

impl ClinicHours {
    pub fn new(start: &str, end: &str) -> anyhow::Result<Self> {
        let start = parse_hhmm(start)?;
        let end = parse_hhmm(end)?;
        if start >= end {
            return Err(anyhow::anyhow!(
                "clinic opening time {} must be before closing time {}",
                start.format("%H:%M"),
                end.format("%H:%M")
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time < self.end
    }

    /// Slot start times from opening to closing in 30-minute steps.
    pub fn slots(&self) -> Vec<NaiveTime> {
        let mut slots = Vec::new();
        let mut current = self.start;
        while current < self.end {
            slots.push(current);
            let (next, wrapped) = current.overflowing_add_signed(Duration::minutes(SLOT_STEP_MINUTES));
            if wrapped != 0 || next <= current {
                break;
            }
            current = next;
        }
        slots
    }

    pub fn to_human_readable(&self) -> String {
        format!("{} to {}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl Default for ClinicHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

fn parse_hhmm(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| anyhow::anyhow!("invalid clinic time {s:?}: {e}"))
}
