use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub clinic_name: String,
    pub clinic_hours_start: String,
    pub clinic_hours_end: String,
    pub appointment_duration: u32,
    pub llm_provider: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_base_url: Option<String>,
    pub ollama_url: String,
    pub classifier_timeout_secs: u64,
    pub classifier_max_attempts: u32,
    pub classifier_backoff_ms: u64,
    pub synthesizer_timeout_secs: u64,
    pub seed_demo_appointments: bool,
    pub voice_output: bool,
    pub session_idle_secs: u64,
    pub max_sessions: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_var("PORT", 3000),
            clinic_name: env::var("CLINIC_NAME").unwrap_or_else(|_| "HealthCare Clinic".to_string()),
            clinic_hours_start: env::var("CLINIC_HOURS_START")
                .unwrap_or_else(|_| "09:00".to_string()),
            clinic_hours_end: env::var("CLINIC_HOURS_END").unwrap_or_else(|_| "18:00".to_string()),
            appointment_duration: parse_var("APPOINTMENT_DURATION", 30),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "openrouter".to_string()),
            llm_api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: env::var("LLM_MODEL")
                .unwrap_or_else(|_| "qwen/qwen-2.5-72b-instruct".to_string()),
            llm_base_url: env::var("LLM_BASE_URL").ok().filter(|v| !v.is_empty()),
            ollama_url: env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            classifier_timeout_secs: parse_var("CLASSIFIER_TIMEOUT_SECS", 45),
            classifier_max_attempts: parse_var("CLASSIFIER_MAX_ATTEMPTS", 2),
            classifier_backoff_ms: parse_var("CLASSIFIER_BACKOFF_MS", 500),
            synthesizer_timeout_secs: parse_var("SYNTHESIZER_TIMEOUT_SECS", 20),
            seed_demo_appointments: parse_flag("SEED_DEMO_APPOINTMENTS", true),
            voice_output: parse_flag("VOICE_OUTPUT", true),
            session_idle_secs: parse_var("SESSION_IDLE_SECS", 1800),
            max_sessions: parse_var("MAX_SESSIONS", 10_000),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(key: &str, default: bool) -> bool {
    match env::var(key).map(|v| v.trim().to_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
