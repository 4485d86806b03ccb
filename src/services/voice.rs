use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

/// Speaks a reply. Failures are the caller's to log; they never fail a turn.
#[async_trait]
pub trait VoiceOutput: Send + Sync {
    async fn speak(&self, text: &str) -> anyhow::Result<()>;
}

/// Captures one utterance. `Ok(None)` means nothing intelligible was heard.
#[async_trait]
pub trait VoiceInput: Send + Sync {
    async fn listen(&self) -> anyhow::Result<Option<String>>;
}

struct SpeechPatterns {
    bold: Regex,
    bullet: Regex,
    newlines: Regex,
    whitespace: Regex,
    space_before_punct: Regex,
}

fn patterns() -> &'static SpeechPatterns {
    static PATTERNS: OnceLock<SpeechPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SpeechPatterns {
        bold: Regex::new(r"\*\*").expect("valid bold regex"),
        bullet: Regex::new(r"(?m)^\s*[-*]\s+").expect("valid bullet regex"),
        newlines: Regex::new(r"\n+").expect("valid newline regex"),
        whitespace: Regex::new(r"\s+").expect("valid whitespace regex"),
        space_before_punct: Regex::new(r"\s+([.,!?])").expect("valid punctuation regex"),
    })
}

/// Strips markdown so a speech engine does not read it aloud.
pub fn clean_text_for_speech(text: &str) -> String {
    let p = patterns();
    let text = p.bold.replace_all(text, "");
    let text = p.bullet.replace_all(&text, "");
    let text = p.newlines.replace_all(&text, ". ");
    let text = p.whitespace.replace_all(&text, " ");
    let text = text.replace('_', " ").replace('#', "");
    let text = p.space_before_punct.replace_all(&text, "$1");
    text.trim().to_string()
}

/// Writes what would be spoken to the log. Stands in for an audio engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingVoice;

#[async_trait]
impl VoiceOutput for TracingVoice {
    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        let spoken = clean_text_for_speech(text);
        if spoken.is_empty() {
            anyhow::bail!("nothing to speak");
        }
        tracing::info!(text = %spoken, "speaking");
        Ok(())
    }
}
