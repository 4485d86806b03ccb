use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::clock::Clock;
use crate::models::{ClassifiedIntent, ConversationTurn, Intent, RawClassification};
use crate::services::ai::retry::RetryPolicy;
use crate::services::ai::{ChatOptions, LlmProvider, Message};

/// How many past turns are shown to the model.
const CONTEXT_TURNS: usize = 3;

const OPTIONS: ChatOptions = ChatOptions {
    temperature: 0.1,
    max_tokens: 500,
};

const SYSTEM_PROMPT: &str = r#"You are the intent parser of a scheduling assistant for a medical clinic. The person talking to you is a RECEPTIONIST managing appointments for many patients, not a patient.

Return ONLY valid JSON (no markdown, no explanation) with this structure:
{
  "intent": "list_appointments|book_appointment|check_availability|cancel_appointment|system_info|out_of_scope",
  "date": "YYYY-MM-DD or null",
  "start_date": "YYYY-MM-DD or null",
  "end_date": "YYYY-MM-DD or null",
  "time": "HH:MM (24-hour) or null",
  "patient_name": "name or null",
  "duration": 30,
  "clarification_needed": false,
  "missing_fields": [],
  "response": "only for system_info and out_of_scope"
}

Intent rules:
- "list_appointments": the receptionist wants to see the schedule ("show me", "what's on", "list").
  One day -> "date". A range -> "start_date" and "end_date". "From <day> onwards" -> only "start_date". Everything upcoming -> all date fields null.
- "book_appointment": create a new appointment. Needs date, time and patient_name; list whichever are missing in missing_fields and set clarification_needed=true.
- "check_availability": asks whether a slot is free.
- "cancel_appointment": cancel/remove an appointment. Patient name alone is enough.
- "system_info": questions about you. Put a short helpful answer in "response".
- "out_of_scope": anything unrelated to scheduling. Put a polite redirect in "response".

Use earlier turns of the conversation to fill in details the receptionist refers back to ("that one", "same time", "him").
Resolve relative dates ("tomorrow", "next Monday", "the 30th") against today's date given below.

Duration rules:
- Default duration is 30 minutes.
- Only set another value when the receptionist states one ("1 hour" -> 60).
- Never put "duration" in missing_fields and never ask for clarification because of it.
"#;

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Never fails: upstream problems come back as [`Intent::Error`].
    async fn classify(&self, utterance: &str, history: &[ConversationTurn]) -> ClassifiedIntent;
}

pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { llm, retry, clock }
    }

    fn system_prompt(&self) -> String {
        let today = self.clock.today();
        let tomorrow = today + Duration::days(1);
        format!(
            "{SYSTEM_PROMPT}\nToday is {} ({}). Tomorrow is {} ({}).",
            today.format("%Y-%m-%d"),
            today.format("%A"),
            tomorrow.format("%Y-%m-%d"),
            tomorrow.format("%A"),
        )
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, utterance: &str, history: &[ConversationTurn]) -> ClassifiedIntent {
        let system = self.system_prompt();
        let messages = [Message::user(user_prompt(utterance, history))];

        let response = self
            .retry
            .run("intent classification", || {
                self.llm.chat(&system, &messages, OPTIONS)
            })
            .await;

        match response {
            Ok(content) => {
                let classified = parse_classification(&content);
                tracing::info!(
                    intent = %classified.intent,
                    date = ?classified.date,
                    time = ?classified.time,
                    clarification = classified.clarification_needed,
                    "classified utterance"
                );
                classified
            }
            Err(e) => {
                tracing::error!(error = %e, "intent classification failed after retries");
                ClassifiedIntent::upstream_failure(e.to_string())
            }
        }
    }
}

fn user_prompt(utterance: &str, history: &[ConversationTurn]) -> String {
    let start = history.len().saturating_sub(CONTEXT_TURNS);
    let context = history[start..]
        .iter()
        .map(|turn| format!("User: {}\nAgent: {}", turn.user, turn.agent))
        .collect::<Vec<_>>()
        .join("\n");
    let context = if context.is_empty() { "None".to_string() } else { context };

    format!(
        "Previous conversation:\n{context}\n\nCurrent receptionist message: \"{utterance}\"\n\nParse this into JSON format."
    )
}

pub fn parse_classification(response: &str) -> ClassifiedIntent {
    // Try direct parse first
    if let Ok(raw) = serde_json::from_str::<RawClassification>(response) {
        return raw.into();
    }

    // Strip markdown code fences
    let cleaned = response
        .trim()
        .strip_prefix("```json")
        .or_else(|| response.trim().strip_prefix("```"))
        .unwrap_or(response.trim());
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    if let Ok(raw) = serde_json::from_str::<RawClassification>(cleaned) {
        return raw.into();
    }

    // Try to find JSON object in the response
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            if let Ok(raw) = serde_json::from_str::<RawClassification>(&cleaned[start..=end]) {
                return raw.into();
            }
        }
    }

    tracing::warn!("failed to parse classifier response as JSON, treating as unknown intent");
    ClassifiedIntent::new(Intent::Unknown)
}
