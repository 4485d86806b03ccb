use std::sync::Arc;

use serde::Serialize;

use crate::models::{ConversationHistory, ConversationTurn};
use crate::services::orchestrator::TurnOrchestrator;
use crate::services::voice::{VoiceInput, VoiceOutput};

/// What a caller gets back from one turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnResult {
    pub success: bool,
    pub reply: String,
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One ongoing conversation: its rolling history plus the shared orchestrator.
pub struct Session {
    id: String,
    history: ConversationHistory,
    orchestrator: Arc<TurnOrchestrator>,
    voice: Option<Arc<dyn VoiceOutput>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        orchestrator: Arc<TurnOrchestrator>,
        voice: Option<Arc<dyn VoiceOutput>>,
    ) -> Self {
        Self {
            id: id.into(),
            history: ConversationHistory::new(),
            orchestrator,
            voice,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Runs a turn. Without an explicit `history` the session's own window is used.
    pub async fn process_turn(
        &mut self,
        utterance: &str,
        history: Option<&[ConversationTurn]>,
    ) -> TurnResult {
        tracing::info!(session = %self.id, utterance, "processing turn");

        let own_history;
        let history: &[ConversationTurn] = match history {
            Some(history) => history,
            None => {
                own_history = self.history.turns();
                &own_history
            }
        };

        let ctx = self.orchestrator.run(utterance, history).await;
        let reply = ctx.reply().to_string();

        self.history.push(ConversationTurn::new(utterance, reply.clone()));

        let failure = ctx.error.as_ref().filter(|err| !err.is_recoverable());
        if let Some(err) = failure {
            tracing::warn!(session = %self.id, error = %err, "turn failed");
        } else if let Some(err) = &ctx.error {
            tracing::debug!(session = %self.id, error = %err, "turn recovered from error");
        }

        if let Some(voice) = &self.voice {
            if let Err(e) = voice.speak(&reply).await {
                tracing::warn!(session = %self.id, error = %e, "voice output failed");
            }
        }

        TurnResult {
            success: failure.is_none(),
            reply,
            intent: ctx.intent.map(|intent| intent.as_str().to_string()),
            error: failure.map(|err| err.to_string()),
        }
    }

    /// Captures one utterance and answers it. `None` when nothing was heard.
    pub async fn listen_and_respond(&mut self, input: &dyn VoiceInput) -> Option<TurnResult> {
        match input.listen().await {
            Ok(Some(utterance)) => Some(self.process_turn(&utterance, None).await),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "voice input failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::FixedClock;
    use crate::models::{ClassifiedIntent, ClinicHours, Intent, ResponseContext};
    use crate::services::ai::intent::IntentClassifier;
    use crate::services::ai::response::{ResponseSynthesizer, Synthesis, FALLBACK_REPLY};
    use crate::services::calendar::InMemoryCalendar;
    use crate::services::orchestrator::ClinicSettings;

    /// Echoes the utterance as the reply and records history lengths.
    struct EchoClassifier {
        seen: Mutex<Vec<Vec<ConversationTurn>>>,
        fail: bool,
    }

    #[async_trait]
    impl IntentClassifier for EchoClassifier {
        async fn classify(&self, utterance: &str, history: &[ConversationTurn]) -> ClassifiedIntent {
            self.seen.lock().push(history.to_vec());
            if self.fail {
                return ClassifiedIntent::upstream_failure("API error (503): busy");
            }
            let mut classified = ClassifiedIntent::new(Intent::SystemInfo);
            classified.response = Some(format!("echo {utterance}"));
            classified
        }
    }

    struct UnusedSynthesizer;

    #[async_trait]
    impl ResponseSynthesizer for UnusedSynthesizer {
        async fn synthesize(&self, _context: &ResponseContext) -> Synthesis {
            Synthesis {
                text: "synthesized".to_string(),
                error: None,
            }
        }
    }

    #[derive(Default)]
    struct RecordingVoice {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceOutput for RecordingVoice {
        async fn speak(&self, text: &str) -> anyhow::Result<()> {
            self.spoken.lock().push(text.to_string());
            Ok(())
        }
    }

    struct ScriptedMic {
        utterances: Mutex<VecDeque<Option<String>>>,
    }

    #[async_trait]
    impl VoiceInput for ScriptedMic {
        async fn listen(&self) -> anyhow::Result<Option<String>> {
            Ok(self.utterances.lock().pop_front().flatten())
        }
    }

    fn session(fail: bool, voice: Option<Arc<dyn VoiceOutput>>) -> (Session, Arc<EchoClassifier>) {
        let clock = Arc::new(FixedClock(NaiveDate::from_ymd_opt(2025, 10, 31).unwrap()));
        let classifier = Arc::new(EchoClassifier {
            seen: Mutex::new(Vec::new()),
            fail,
        });
        let orchestrator = TurnOrchestrator::new(
            ClinicSettings {
                name: "Test Clinic".to_string(),
                hours: ClinicHours::default(),
                default_duration_minutes: 30,
            },
            classifier.clone(),
            Arc::new(UnusedSynthesizer),
            Arc::new(InMemoryCalendar::new(ClinicHours::default(), clock.clone())),
            clock,
        );
        (Session::new("s-1", Arc::new(orchestrator), voice), classifier)
    }

    #[tokio::test]
    async fn test_history_keeps_last_five_turns() {
        let (mut session, _) = session(false, None);
        for i in 1..=6 {
            session.process_turn(&format!("turn {i}"), None).await;
        }
        let turns = session.history().turns();
        assert_eq!(turns.len(), 5);
        let users: Vec<&str> = turns.iter().map(|t| t.user.as_str()).collect();
        assert_eq!(users, vec!["turn 2", "turn 3", "turn 4", "turn 5", "turn 6"]);
        assert_eq!(turns[4].agent, "echo turn 6");
    }

    #[tokio::test]
    async fn test_own_history_is_forwarded_to_classifier() {
        let (mut session, classifier) = session(false, None);
        session.process_turn("first", None).await;
        session.process_turn("second", None).await;

        let seen = classifier.seen.lock();
        assert!(seen[0].is_empty());
        assert_eq!(seen[1], vec![ConversationTurn::new("first", "echo first")]);
    }

    #[tokio::test]
    async fn test_explicit_history_overrides_own() {
        let (mut session, classifier) = session(false, None);
        session.process_turn("first", None).await;
        let supplied = vec![ConversationTurn::new("elsewhere", "ok")];
        session.process_turn("second", Some(&supplied)).await;

        assert_eq!(classifier.seen.lock()[1], supplied);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_successful_turn_is_spoken() {
        let voice = Arc::new(RecordingVoice::default());
        let (mut session, _) = session(false, Some(voice.clone()));
        let result = session.process_turn("hello there", None).await;

        assert!(result.success);
        assert_eq!(result.reply, "echo hello there");
        assert_eq!(result.intent.as_deref(), Some("system_info"));
        assert!(result.error.is_none());
        assert_eq!(*voice.spoken.lock(), vec!["echo hello there".to_string()]);
    }

    #[tokio::test]
    async fn test_upstream_failure_reports_error() {
        let voice = Arc::new(RecordingVoice::default());
        let (mut session, _) = session(true, Some(voice.clone()));
        let result = session.process_turn("book John", None).await;

        assert!(!result.success);
        assert_eq!(result.reply, FALLBACK_REPLY);
        assert_eq!(result.intent.as_deref(), Some("error"));
        assert!(result.error.unwrap().contains("503"));
        assert_eq!(session.history().turns()[0].agent, FALLBACK_REPLY);
        assert_eq!(voice.spoken.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_is_a_recovered_turn() {
        let (mut session, classifier) = session(false, None);
        let result = session.process_turn(" ", None).await;
        assert!(result.success);
        assert!(result.error.is_none());
        assert!(classifier.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_listen_and_respond() {
        let (mut session, _) = session(false, None);
        let mic = ScriptedMic {
            utterances: Mutex::new(VecDeque::from([Some("who are you".to_string()), None])),
        };
        let first = session.listen_and_respond(&mic).await.unwrap();
        assert_eq!(first.reply, "echo who are you");
        assert!(session.listen_and_respond(&mic).await.is_none());
        assert_eq!(session.history().len(), 1);
    }
}
