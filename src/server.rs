use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::engine::{EngineError, GenerateParams, ModelSession, TextGenerator};

/// Stop sequences passed to every generation. Output halts before any of
/// these, and the triggering string is excluded.
pub const STOP_SEQUENCES: [&str; 3] = ["User:", "System:", "\n\n"];

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn TextGenerator>,
    pub model_name: String,
    pub model_path: String,
    pub request_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(session: ModelSession, config: &GatewayConfig) -> Self {
        Self {
            engine: Arc::new(session),
            model_name: config.model_name.clone(),
            model_path: config.model.path.display().to_string(),
            request_timeout: config.request_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// A body without a `messages` key is treated as an empty list, which
    /// then falls through to the "no user message" rejection.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
    pub model_path: String,
}

/// Request-boundary error taxonomy. Each variant maps to exactly one HTTP
/// status; the body is always `{"error": <message>}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No user message found")]
    MissingUserMessage,
    #[error("invalid request body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingUserMessage => StatusCode::BAD_REQUEST,
            ApiError::MalformedBody(_) | ApiError::Engine(_) | ApiError::Timeout(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "chat completion failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model: state.model_name.clone(),
        model_path: state.model_path.clone(),
    })
}

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    // Parsed by hand so malformed JSON takes the 500 catch-all path instead
    // of axum's rejection
    let req: ChatCompletionRequest = serde_json::from_slice(&body)?;

    tracing::info!(
        message_count = req.messages.len(),
        max_tokens = req.max_tokens,
        temperature = req.temperature,
        "received chat completion request"
    );

    let (system_prompt, user_prompt) = extract_prompts(&req.messages);
    if user_prompt.is_empty() {
        return Err(ApiError::MissingUserMessage);
    }

    let prompt = build_prompt(&system_prompt, &user_prompt);
    tracing::debug!(prompt_length = prompt.len(), "assembled prompt");

    let params = GenerateParams {
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        stop: STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
    };

    let generation = state.engine.generate(&prompt, &params);
    let text = match state.request_timeout {
        Some(limit) => tokio::time::timeout(limit, generation)
            .await
            .map_err(|_| ApiError::Timeout(limit))??,
        None => generation.await?,
    };

    tracing::info!(response_length = text.len(), "completed generation");

    let created = unix_now();
    Ok(Json(ChatCompletionResponse {
        id: format!("chatcmpl-{created}"),
        object: "chat.completion",
        created,
        model: state.model_name.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: text,
            },
        }],
    }))
}

/// Scans all messages in order, unconditionally overwriting on each match:
/// the last `system` and last `user` message win, even if a later one is
/// empty. Assistant messages are ignored.
fn extract_prompts(messages: &[ChatMessage]) -> (String, String) {
    let mut system_prompt = String::new();
    let mut user_prompt = String::new();
    for message in messages {
        match message.role {
            Role::System => system_prompt = message.content.clone(),
            Role::User => user_prompt = message.content.clone(),
            Role::Assistant => {}
        }
    }
    (system_prompt, user_prompt)
}

/// The literal inference prompt template. The `"System: "` prefix and blank
/// line are emitted even when the system prompt is empty.
pub fn build_prompt(system_prompt: &str, user_prompt: &str) -> String {
    format!("System: {system_prompt}\n\nUser: {user_prompt}\n\nAssistant:")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves the gateway until the process exits.
pub async fn serve(state: AppState, port: u16) -> crate::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .context("Failed to bind to port")?;

    tracing::info!("Server listening on http://0.0.0.0:{port}");
    tracing::info!("OpenAI-compatible endpoint: http://localhost:{port}/v1/chat/completions");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_literal_even_with_empty_system_prompt() {
        assert_eq!(
            build_prompt("", "Hello"),
            "System: \n\nUser: Hello\n\nAssistant:"
        );
    }

    #[test]
    fn template_includes_system_prompt() {
        assert_eq!(
            build_prompt("Be terse.", "Hi"),
            "System: Be terse.\n\nUser: Hi\n\nAssistant:"
        );
    }

    #[test]
    fn last_user_and_system_messages_win() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "first system".to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: "first user".to_string(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "ignored".to_string(),
            },
            ChatMessage {
                role: Role::System,
                content: "second system".to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: "second user".to_string(),
            },
        ];
        let (system_prompt, user_prompt) = extract_prompts(&messages);
        assert_eq!(system_prompt, "second system");
        assert_eq!(user_prompt, "second user");
    }

    #[test]
    fn later_empty_user_message_overwrites_earlier_content() {
        let messages = vec![
            ChatMessage {
                role: Role::User,
                content: "real question".to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: String::new(),
            },
        ];
        let (_, user_prompt) = extract_prompts(&messages);
        assert!(user_prompt.is_empty());
    }

    #[test]
    fn request_defaults_apply() {
        let req: ChatCompletionRequest = serde_json::from_str(r#"{"messages":[]}"#).unwrap();
        assert_eq!(req.max_tokens, 256);
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_messages_key_means_empty_list() {
        let req: ChatCompletionRequest = serde_json::from_str("{}").unwrap();
        assert!(req.messages.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"whatever","stream":false,"messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn unknown_role_is_a_parse_error() {
        let result: Result<ChatCompletionRequest, _> =
            serde_json::from_str(r#"{"messages":[{"role":"tool","content":"x"}]}"#);
        assert!(result.is_err());
    }
}
