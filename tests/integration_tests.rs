use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tower::ServiceExt;

use clinicdesk::clock::FixedClock;
use clinicdesk::config::AppConfig;
use clinicdesk::handlers;
use clinicdesk::services::ai::response::FALLBACK_REPLY;
use clinicdesk::services::ai::{ChatOptions, LlmProvider, Message, ProviderError};
use clinicdesk::state::AppState;

// ── Mock Provider ──

/// Classifies by keyword and "synthesizes" replies as `[<result>]`.
struct MockLlm;

fn current_message(prompt: &str) -> String {
    prompt
        .split("Current receptionist message: \"")
        .nth(1)
        .and_then(|rest| rest.split("\"\n").next())
        .unwrap_or("")
        .to_lowercase()
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn chat(
        &self,
        system_prompt: &str,
        messages: &[Message],
        _options: ChatOptions,
    ) -> Result<String, ProviderError> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");

        if !system_prompt.contains("intent parser") {
            if last.contains("Zed Failing") {
                return Err(ProviderError::Status {
                    status: 503,
                    body: "overloaded".to_string(),
                });
            }
            let context: Value = last
                .strip_prefix("Context: ")
                .and_then(|rest| rest.split("\nGenerate").next())
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            return Ok(format!("[{}]", context["result"].as_str().unwrap_or("none")));
        }

        let message = current_message(last);
        let reply = if message.contains("explode") {
            return Err(ProviderError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        } else if message.contains("who are you") {
            json!({"intent": "system_info", "response": "I'm the clinic scheduling assistant."})
        } else if message.contains("book john") {
            json!({"intent": "book_appointment", "date": "2025-11-03", "time": "2:00 PM", "patient_name": "John Doe", "duration": 30, "clarification_needed": false, "missing_fields": []})
        } else if message.contains("book jane") {
            json!({"intent": "book_appointment", "date": "2025-11-03", "time": "14:00", "patient_name": "Jane Doe", "duration": 30, "clarification_needed": false, "missing_fields": ["duration"]})
        } else if message.contains("book zed") {
            json!({"intent": "book_appointment", "date": "2025-11-03", "time": "2:00 PM", "patient_name": "Zed Failing"})
        } else if message.contains("cancel") {
            json!({"intent": "cancel_appointment", "date": null, "patient_name": null})
        } else if message.contains("show") {
            json!({"intent": "list_appointments", "date": "2025-11-03"})
        } else {
            json!({"intent": "something_else"})
        };
        Ok(format!("```json\n{reply}\n```"))
    }
}

// ── Helpers ──

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        clinic_name: "Test Clinic".to_string(),
        clinic_hours_start: "09:00".to_string(),
        clinic_hours_end: "18:00".to_string(),
        appointment_duration: 30,
        llm_provider: "openrouter".to_string(),
        llm_api_key: "test-key".to_string(),
        llm_model: "test-model".to_string(),
        llm_base_url: None,
        ollama_url: "http://localhost:11434".to_string(),
        classifier_timeout_secs: 5,
        classifier_max_attempts: 2,
        classifier_backoff_ms: 1,
        synthesizer_timeout_secs: 5,
        seed_demo_appointments: false,
        voice_output: false,
        session_idle_secs: 1800,
        max_sessions: 100,
    }
}

/// Today is Friday 2025-10-31.
fn test_state() -> Arc<AppState> {
    let clock = Arc::new(FixedClock(NaiveDate::from_ymd_opt(2025, 10, 31).unwrap()));
    Arc::new(AppState::from_config(test_config(), Arc::new(MockLlm), clock).unwrap())
}

fn chat_request(message: &str, session_id: Option<&str>) -> Request<Body> {
    let mut body = json!({ "message": message });
    if let Some(id) = session_id {
        body["session_id"] = json!(id);
    }
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(request).await.unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn appointments(app: &Router, date: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(format!("/api/appointments?date={date}"))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

// ── Tests ──

#[tokio::test]
async fn test_health() {
    let app = handlers::router(test_state());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_booking_flow() {
    let app = handlers::router(test_state());

    let (status, body) = send(&app, chat_request("Book John Doe on Monday at 2pm", Some("desk-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "desk-1");
    assert_eq!(body["success"], true);
    assert_eq!(body["intent"], "book_appointment");
    assert_eq!(body["reply"], "[booked]");
    assert!(body.get("error").is_none());

    let (status, list) = appointments(&app, "2025-11-03").await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["patient_name"], "John Doe");
    assert_eq!(list[0]["time"], "14:00");
    assert_eq!(list[0]["status"], "confirmed");
    assert_eq!(list[0]["duration_minutes"], 30);
}

#[tokio::test]
async fn test_second_booking_of_same_slot_is_refused() {
    let app = handlers::router(test_state());

    send(&app, chat_request("book john for monday 2pm", None)).await;
    let (_, body) = send(&app, chat_request("book jane for monday 2pm", None)).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["reply"], "[slot_taken]");

    let (_, list) = appointments(&app, "2025-11-03").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_bookings_only_one_wins() {
    let app = handlers::router(test_state());

    let mut handles = Vec::new();
    for i in 0..5 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let request = chat_request("book jane on monday at 2", Some(&format!("desk-{i}")));
            send(&app, request).await.1
        }));
    }

    let mut booked = 0;
    for handle in handles {
        if handle.await.unwrap()["reply"] == "[booked]" {
            booked += 1;
        }
    }
    assert_eq!(booked, 1);

    let (_, list) = appointments(&app, "2025-11-03").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_without_details_asks_for_more() {
    let app = handlers::router(test_state());
    let (_, body) = send(&app, chat_request("cancel the appointment", None)).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["intent"], "cancel_appointment");
    assert_eq!(body["reply"], "[cancel_needs_info]");
}

#[tokio::test]
async fn test_system_info_reply_is_verbatim() {
    let app = handlers::router(test_state());
    let (_, body) = send(&app, chat_request("Who are you?", None)).await;
    assert_eq!(body["intent"], "system_info");
    assert_eq!(body["reply"], "I'm the clinic scheduling assistant.");
}

#[tokio::test]
async fn test_unknown_intent_falls_back() {
    let app = handlers::router(test_state());
    let (_, body) = send(&app, chat_request("tell me something", None)).await;
    assert_eq!(body["intent"], "unknown");
    assert_eq!(body["reply"], "[fallback]");
}

#[tokio::test]
async fn test_upstream_failure_is_reported() {
    let app = handlers::router(test_state());
    let (status, body) = send(&app, chat_request("explode please", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["intent"], "error");
    assert_eq!(body["reply"], FALLBACK_REPLY);
    assert!(body["error"].as_str().unwrap().contains("500"));
}

#[tokio::test]
async fn test_reply_failure_after_conflict_is_reported() {
    let app = handlers::router(test_state());

    let (_, first) = send(&app, chat_request("book zed for monday 2pm", None)).await;
    assert_eq!(first["success"], false);
    assert_eq!(first["reply"], FALLBACK_REPLY);

    let (status, body) = send(&app, chat_request("book john for monday 2pm", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["reply"], FALLBACK_REPLY);
    assert!(body["error"].as_str().unwrap().contains("503"));

    let (_, list) = appointments(&app, "2025-11-03").await;
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["patient_name"], "Zed Failing");
}

#[tokio::test]
async fn test_sessions_are_created_and_reused() {
    let state = test_state();
    let app = handlers::router(Arc::clone(&state));

    let (_, first) = send(&app, chat_request("show monday", None)).await;
    let session_id = first["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());
    assert_eq!(first["reply"], "[no_appointments]");

    send(&app, chat_request("show monday", Some(&session_id))).await;
    assert_eq!(state.session_count(), 1);

    let session = state.session(&session_id);
    assert_eq!(session.lock().await.history().len(), 2);
}

#[tokio::test]
async fn test_empty_message_is_answered() {
    let app = handlers::router(test_state());
    let (_, body) = send(&app, chat_request("  ", None)).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["reply"], "I didn't catch that. Could you please speak again?");
}

#[tokio::test]
async fn test_appointments_rejects_bad_date() {
    let app = handlers::router(test_state());
    let (status, body) = appointments(&app, "next-tuesday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("next-tuesday"));
}

#[tokio::test]
async fn test_appointments_without_date_lists_upcoming() {
    let app = handlers::router(test_state());
    send(&app, chat_request("book john monday", None)).await;

    let request = Request::builder()
        .uri("/api/appointments")
        .body(Body::empty())
        .unwrap();
    let (status, list) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["date"], "2025-11-03");
}
