use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use clinicdesk::clock::SystemClock;
use clinicdesk::config::AppConfig;
use clinicdesk::errors::AppError;
use clinicdesk::handlers;
use clinicdesk::services::ai::ollama::OllamaProvider;
use clinicdesk::services::ai::openai::{OpenAiCompatibleProvider, GROQ_URL, OPENROUTER_URL};
use clinicdesk::services::ai::LlmProvider;
use clinicdesk::state::AppState;

fn build_llm(config: &AppConfig) -> Result<Arc<dyn LlmProvider>, AppError> {
    let hosted_default = match config.llm_provider.as_str() {
        "ollama" => {
            tracing::info!("using Ollama LLM provider (url: {}, model: {})", config.ollama_url, config.llm_model);
            return Ok(Arc::new(OllamaProvider::new(
                config.ollama_url.clone(),
                config.llm_model.clone(),
            )));
        }
        "groq" => GROQ_URL,
        "openrouter" => OPENROUTER_URL,
        other => {
            return Err(AppError::Config(format!(
                "unknown LLM_PROVIDER '{other}' (expected openrouter, groq or ollama)"
            )))
        }
    };

    if config.llm_api_key.is_empty() {
        return Err(AppError::Config(format!(
            "LLM_API_KEY must be set when LLM_PROVIDER={}",
            config.llm_provider
        )));
    }

    let base_url = config
        .llm_base_url
        .clone()
        .unwrap_or_else(|| hosted_default.to_string());
    tracing::info!(
        "using {} LLM provider (url: {base_url}, model: {})",
        config.llm_provider,
        config.llm_model
    );
    Ok(Arc::new(OpenAiCompatibleProvider::new(
        base_url,
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    let llm = build_llm(&config)?;
    let state = Arc::new(AppState::from_config(config.clone(), llm, Arc::new(SystemClock))?);

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
