pub mod appointment;
pub mod clinic_hours;
pub mod conversation;
pub mod intent;
pub mod turn;

pub use appointment::{Appointment, AppointmentStatus, AppointmentSummary};
pub use clinic_hours::ClinicHours;
pub use conversation::{ConversationHistory, ConversationTurn, HISTORY_LIMIT};
pub use intent::{ClassifiedIntent, Field, Intent, RawClassification};
pub use turn::{AlternativeSlot, ListScope, Outcome, ResponseContext, TurnContext};
