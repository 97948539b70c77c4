//! Canned-insight demo server.
//!
//! Serves hand-written monitoring "insights" behind the same OpenAI-compatible
//! surface as the real gateway, picked by substring checks against the user
//! prompt. Useful for integration demos when no GGUF model is on disk.
//!
//! Run with: cargo run --example mock_insights
//! Test with: curl http://localhost:8000/demo/test

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

#[derive(Debug, Clone, Serialize)]
struct Insight {
    title: &'static str,
    content: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    confidence: f64,
}

fn generate_insights(prompt: &str) -> Vec<Insight> {
    let prompt = prompt.to_lowercase();

    if prompt.contains("unhealthy") || prompt.contains("down") {
        return vec![
            Insight {
                title: "Critical Service Disruption Detected",
                content: "Multiple endpoints are experiencing downtime. Root cause analysis \
                          suggests network connectivity issues or upstream service dependencies. \
                          Immediate escalation to the infrastructure team is recommended.",
                kind: "alert",
                confidence: 0.94,
            },
            Insight {
                title: "Failure Pattern Analysis",
                content: "The outage pattern indicates a cascading failure starting with the \
                          delay endpoint. Consider implementing circuit breaker patterns.",
                kind: "warning",
                confidence: 0.87,
            },
        ];
    }

    if prompt.contains("slow") || prompt.contains("5000ms") || prompt.contains("delay") {
        return vec![
            Insight {
                title: "Severe Performance Degradation",
                content: "Response times have increased by over 300% from baseline. The delay \
                          endpoint is hitting 5-second timeouts, indicating either network \
                          latency issues or server overload.",
                kind: "warning",
                confidence: 0.91,
            },
            Insight {
                title: "Performance Optimization Strategy",
                content: "Implement request timeout controls and consider adding response \
                          caching for frequently accessed endpoints.",
                kind: "info",
                confidence: 0.78,
            },
        ];
    }

    if prompt.contains("healthy") && prompt.contains("200") {
        return vec![
            Insight {
                title: "Optimal System Performance",
                content: "All monitored endpoints are operating within expected parameters, \
                          with sub-250ms response times on the primary API.",
                kind: "success",
                confidence: 0.96,
            },
            Insight {
                title: "Proactive Monitoring Insights",
                content: "Current metrics indicate 99.8% availability over the monitoring \
                          period. Consider this baseline for SLA and capacity planning.",
                kind: "info",
                confidence: 0.83,
            },
        ];
    }

    vec![
        Insight {
            title: "System Health Overview",
            content: "Mixed performance indicators observed across monitored endpoints. Some \
                      services operate optimally while others show room for improvement in \
                      response time consistency.",
            kind: "info",
            confidence: 0.75,
        },
        Insight {
            title: "Monitoring Intelligence",
            content: "Recommend automated alerting at 95th percentile thresholds. The current \
                      15-second check interval balances responsiveness and resource usage.",
            kind: "info",
            confidence: 0.68,
        },
    ]
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    messages: Vec<Message>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "model": "gpt-oss-20b-demo",
        "type": "mock_ai_server",
        "capabilities": ["monitoring_insights", "pattern_analysis", "recommendations"],
        "timestamp": unix_now(),
    }))
}

async fn chat_completions(Json(req): Json<ChatCompletionRequest>) -> Response {
    // First user message wins here, unlike the real gateway: the demo mirrors
    // the original mock, which breaks on the first match
    let prompt = req
        .messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("");

    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "No user message found"})),
        )
            .into_response();
    }

    let insights = generate_insights(prompt);
    let content = serde_json::to_string_pretty(&insights).unwrap_or_else(|_| "[]".to_string());

    let created = unix_now();
    Json(serde_json::json!({
        "id": format!("chatcmpl-{created}"),
        "object": "chat.completion",
        "created": created,
        "model": "gpt-oss-20b",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content }
        }]
    }))
    .into_response()
}

async fn demo_test() -> Json<serde_json::Value> {
    let sample_prompt = "Current endpoint status:\n\
        - https://api.github.com/users/octocat: HEALTHY (Status: 200, Response Time: 245ms)\n\
        - https://httpbin.org/delay/2: UNHEALTHY (Status: 0, Response Time: 5000ms, Error: timeout)";

    Json(serde_json::json!({
        "test": "success",
        "sample_prompt": sample_prompt,
        "sample_insights": generate_insights(sample_prompt),
        "timestamp": unix_now(),
    }))
}

#[tokio::main]
async fn main() -> gguf_gateway::Result<()> {
    tracing_subscriber::fmt::init();

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/demo/test", get(demo_test))
        .layer(CorsLayer::permissive());

    let port = 8000;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!("Mock insight server listening on http://localhost:{port}");
    tracing::info!("Try: curl http://localhost:{port}/demo/test");

    axum::serve(listener, app).await?;
    Ok(())
}
