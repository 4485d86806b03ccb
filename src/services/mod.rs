pub mod ai;
pub mod calendar;
pub mod conversation;
pub mod orchestrator;
pub mod scheduling;
pub mod voice;
