use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::models::ClinicHours;
use crate::services::ai::intent::LlmIntentClassifier;
use crate::services::ai::response::LlmResponseSynthesizer;
use crate::services::ai::retry::RetryPolicy;
use crate::services::ai::LlmProvider;
use crate::services::calendar::{CalendarStore, InMemoryCalendar};
use crate::services::conversation::Session;
use crate::services::orchestrator::{ClinicSettings, TurnOrchestrator};
use crate::services::voice::{TracingVoice, VoiceOutput};

type SharedSession = Arc<tokio::sync::Mutex<Session>>;

struct SessionEntry {
    session: SharedSession,
    last_used: Instant,
}

impl SessionEntry {
    /// A turn (or a caller) still holds a handle to this session.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub calendar: Arc<dyn CalendarStore>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub voice: Option<Arc<dyn VoiceOutput>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl AppState {
    /// Wires the calendar, classifier, synthesizer and orchestrator from config.
    pub fn from_config(
        config: AppConfig,
        llm: Arc<dyn LlmProvider>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let hours = ClinicHours::new(&config.clinic_hours_start, &config.clinic_hours_end)?;

        let calendar = if config.seed_demo_appointments {
            InMemoryCalendar::with_demo_data(hours, Arc::clone(&clock))
        } else {
            InMemoryCalendar::new(hours, Arc::clone(&clock))
        };
        let calendar: Arc<dyn CalendarStore> = Arc::new(calendar);

        let classifier_retry = RetryPolicy {
            max_attempts: config.classifier_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.classifier_backoff_ms),
            backoff_multiplier: 2,
            attempt_timeout: Duration::from_secs(config.classifier_timeout_secs),
        };
        let classifier = LlmIntentClassifier::new(Arc::clone(&llm), classifier_retry, Arc::clone(&clock));
        let synthesizer = LlmResponseSynthesizer::new(
            llm,
            RetryPolicy::single_attempt(Duration::from_secs(config.synthesizer_timeout_secs)),
        );

        let settings = ClinicSettings {
            name: config.clinic_name.clone(),
            hours,
            default_duration_minutes: config.appointment_duration,
        };
        tracing::info!(
            clinic = %settings.name,
            hours = %settings.hours.to_human_readable(),
            duration = settings.default_duration_minutes,
            "clinic configured"
        );

        let orchestrator = TurnOrchestrator::new(
            settings,
            Arc::new(classifier),
            Arc::new(synthesizer),
            Arc::clone(&calendar),
            clock,
        );

        let voice: Option<Arc<dyn VoiceOutput>> = if config.voice_output {
            Some(Arc::new(TracingVoice))
        } else {
            None
        };

        Ok(Self {
            config,
            calendar,
            orchestrator: Arc::new(orchestrator),
            voice,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The session for `id`, created on first use.
    ///
    /// Creating a session first drops sessions idle for longer than
    /// `session_idle_secs`; at `max_sessions` the least recently used idle
    /// session makes room.
    pub fn session(&self, id: &str) -> SharedSession {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        if let Some(entry) = sessions.get_mut(id) {
            entry.last_used = now;
            return Arc::clone(&entry.session);
        }

        self.evict_idle(&mut sessions, now);
        if sessions.len() >= self.config.max_sessions.max(1) {
            let oldest = sessions
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                tracing::info!(session = %key, "session limit reached, dropping least recently used");
                sessions.remove(&key);
            }
        }

        tracing::info!(session = id, "starting session");
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(
            id,
            Arc::clone(&self.orchestrator),
            self.voice.clone(),
        )));
        sessions.insert(
            id.to_string(),
            SessionEntry {
                session: Arc::clone(&session),
                last_used: now,
            },
        );
        session
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn evict_idle(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        let idle = Duration::from_secs(self.config.session_idle_secs);
        let before = sessions.len();
        sessions.retain(|_, entry| entry.in_use() || now.duration_since(entry.last_used) < idle);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = sessions.len(), "dropped idle sessions");
        }
    }
}
