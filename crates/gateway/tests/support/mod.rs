//! Shared fixtures: a scripted model provider, a fake JSON-RPC tool
//! server, and a fully wired `AppState` served over an ephemeral port.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::config::{AgentConfig, Config, ToolServerConfig};
use pv_domain::error::{Error, Result};
use pv_domain::stream::{BoxStream, StreamEvent, Usage};
use pv_domain::tool::ToolCall;
use pv_providers::{Capabilities, ChatRequest, ChatResponse, LlmProvider, ProviderRegistry};
use pv_toolserver::ProxyManager;
use pv_transcript::TranscriptStore;

use pv_gateway::api;
use pv_gateway::runtime::awaiter::AwaiterRegistry;
use pv_gateway::runtime::cancel::CancelRegistry;
use pv_gateway::runtime::events::EventPublisher;
use pv_gateway::runtime::registry::ToolRegistry;
use pv_gateway::runtime::services::{self, ChildRunnerSlot};
use pv_gateway::runtime::OrchestratorRunner;
use pv_gateway::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One canned model response.
#[derive(Clone)]
pub struct Scripted {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub delay_ms: u64,
}

impl Scripted {
    pub fn answer(text: &str) -> Self {
        Self {
            content: text.into(),
            tool_calls: Vec::new(),
            delay_ms: 0,
        }
    }

    pub fn plan(calls: Vec<(&str, Value)>) -> Self {
        let tool_calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (tool, args))| ToolCall {
                call_id: format!("call_{i}"),
                tool_name: tool.into(),
                arguments: args,
            })
            .collect();
        Self {
            content: String::new(),
            tool_calls,
            delay_ms: 0,
        }
    }

    pub fn elicitation(message: &str, required: &[&str]) -> Self {
        Self {
            content: serde_json::json!({
                "type": "elicitation",
                "message": message,
                "requestedSchema": { "required": required },
            })
            .to_string(),
            tool_calls: Vec::new(),
            delay_ms: 0,
        }
    }

    pub fn with_content(mut self, text: &str) -> Self {
        self.content = text.into();
        self
    }

    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }
}

/// Replays canned responses and records every request it saw. In
/// streaming mode, responses are delivered as a stream of events the way
/// chat-completions providers emit them: token chunks, tool-call starts
/// with **index-keyed** argument deltas (and no finish event), then Done.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    counter: AtomicUsize,
    streaming: bool,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Self::with_mode(script, false)
    }

    pub fn streaming(script: Vec<Scripted>) -> Arc<Self> {
        Self::with_mode(script, true)
    }

    fn with_mode(script: Vec<Scripted>, streaming: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            streaming,
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    async fn next(&self, req: &ChatRequest) -> Result<(Scripted, usize)> {
        self.requests.lock().push(req.clone());
        let next = self
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Provider {
                provider: "scripted".into(),
                message: "script exhausted".into(),
            })?;
        if next.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(next.delay_ms)).await;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok((next, n))
    }

    fn usage() -> Usage {
        Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let (next, n) = self.next(req).await?;
        Ok(ChatResponse {
            content: next.content,
            tool_calls: next.tool_calls,
            usage: Some(Self::usage()),
            model: "test-model".into(),
            finish_reason: Some("stop".into()),
            response_id: Some(format!("resp_{n}")),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        if !self.streaming {
            return Err(Error::Provider {
                provider: "scripted".into(),
                message: "streaming not scripted".into(),
            });
        }

        let (next, n) = self.next(req).await?;
        let mut events: Vec<Result<StreamEvent>> = Vec::new();

        // Text arrives in two chunks so interim deltas are observable.
        if !next.content.is_empty() {
            let chars: Vec<char> = next.content.chars().collect();
            let mid = chars.len() / 2;
            for half in [&chars[..mid], &chars[mid..]] {
                if !half.is_empty() {
                    events.push(Ok(StreamEvent::Token {
                        text: half.iter().collect(),
                    }));
                }
            }
        }

        for (i, tc) in next.tool_calls.iter().enumerate() {
            events.push(Ok(StreamEvent::ToolCallStarted {
                call_id: tc.call_id.clone(),
                tool_name: tc.tool_name.clone(),
            }));
            // Deltas keyed by choice index, never by call id, and no
            // ToolCallFinished — the consumer has to assemble.
            events.push(Ok(StreamEvent::ToolCallDelta {
                call_id: i.to_string(),
                delta: tc.arguments.to_string(),
            }));
        }

        let finish = if next.tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        events.push(Ok(StreamEvent::Done {
            usage: Some(Self::usage()),
            finish_reason: Some(finish.into()),
            response_id: Some(format!("resp_{n}")),
        }));

        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: self.streaming,
            supports_continuation: false,
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake tool server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct FakeServerState {
    calls: Arc<AtomicUsize>,
    /// Fail the first `fail_calls` tools/call requests with an HTTP 500
    /// whose body reads as a reconnectable stream error.
    fail_calls: usize,
}

pub struct FakeToolServer {
    pub url: String,
    pub calls: Arc<AtomicUsize>,
}

async fn rpc_handler(
    State(state): State<FakeServerState>,
    Json(req): Json<Value>,
) -> axum::response::Response {
    let id = req.get("id").and_then(|i| i.as_u64()).unwrap_or(0);
    let method = req.get("method").and_then(|m| m.as_str()).unwrap_or("");

    let result = match method {
        "initialize" => serde_json::json!({ "serverInfo": { "name": "fake" } }),
        "tools/list" => serde_json::json!({
            "tools": [{
                "name": "ping",
                "description": "Ping the database.",
                "inputSchema": { "type": "object" }
            }]
        }),
        "tools/call" => {
            let n = state.calls.fetch_add(1, Ordering::SeqCst);
            if n < state.fail_calls {
                return (StatusCode::INTERNAL_SERVER_ERROR, "stream error: connection reset")
                    .into_response();
            }
            serde_json::json!({
                "content": [{ "type": "text", "text": "{\"ok\":true}" }],
                "structuredContent": { "ok": true }
            })
        }
        _ => {
            return Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("no such method {method}") }
            }))
            .into_response();
        }
    };

    Json(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
}

/// Spawn a JSON-RPC tool server on an ephemeral port.
pub async fn spawn_fake_tool_server(fail_calls: usize) -> FakeToolServer {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/rpc", post(rpc_handler))
        .with_state(FakeServerState {
            calls: calls.clone(),
            fail_calls,
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeToolServer {
        url: format!("http://{addr}/rpc"),
        calls,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AppState + HTTP fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Harness {
    pub state: AppState,
    pub provider: Arc<ScriptedProvider>,
    pub base_url: String,
    pub client: reqwest::Client,
    _dir: tempfile::TempDir,
}

/// Build a fully wired state around a scripted provider, refresh any tool
/// servers synchronously, and serve the API on an ephemeral port.
pub async fn harness(script: Vec<Scripted>, tool_servers: Vec<ToolServerConfig>) -> Harness {
    build_harness(ScriptedProvider::new(script), tool_servers).await
}

/// Same harness, but the provider streams its responses.
pub async fn streaming_harness(
    script: Vec<Scripted>,
    tool_servers: Vec<ToolServerConfig>,
) -> Harness {
    build_harness(ScriptedProvider::streaming(script), tool_servers).await
}

async fn build_harness(
    provider: Arc<ScriptedProvider>,
    tool_servers: Vec<ToolServerConfig>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.state.path = dir.path().to_path_buf();
    config.llm.default_model = Some("scripted/test-model".into());
    config.tool_servers = tool_servers.clone();
    config.interactive.elicitation_timeout_sec = 5;
    config.agents = vec![AgentConfig {
        id: "researcher".into(),
        description: "Looks things up".into(),
        model: None,
        system_prompt: Some("You are a focused research agent.".into()),
        tools: Vec::new(),
    }];
    let config = Arc::new(config);

    let store = Arc::new(
        TranscriptStore::new(dir.path(), config.limits.inline_payload_cap).unwrap(),
    );
    let mut providers_map: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers_map.insert("scripted".into(), provider.clone());
    let providers = Arc::new(ProviderRegistry::with_providers(
        providers_map,
        Some("scripted/test-model".into()),
    ));

    let proxies = Arc::new(ProxyManager::new(tool_servers.clone()));
    let tools = Arc::new(ToolRegistry::new(config.registry.clone(), proxies));
    let child_runner = Arc::new(ChildRunnerSlot::new());
    services::register_overlay(&tools, &config.agents, child_runner.clone());

    let state = AppState {
        config,
        store,
        providers,
        tools,
        cancels: Arc::new(CancelRegistry::new()),
        events: Arc::new(EventPublisher::new()),
        awaiters: Arc::new(AwaiterRegistry::new()),
        child_runner,
        api_token_hash: None,
        started_at: Utc::now(),
    };
    state
        .child_runner
        .install(Arc::new(OrchestratorRunner::new(state.clone())));

    // No background monitors in tests: refresh once, synchronously.
    for server in &tool_servers {
        state.tools.refresh_server(&server.name).await.unwrap();
    }

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        state,
        provider,
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl Harness {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// POST a user message and return `(conversationId, messageId)`.
    pub async fn post_message(&self, conversation_id: &str, content: &str) -> (String, String) {
        let resp = self
            .client
            .post(self.url(&format!("/v1/api/conversations/{conversation_id}/messages")))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        let body: Value = resp.json().await.unwrap();
        (
            body["data"]["conversationId"].as_str().unwrap().to_owned(),
            body["data"]["id"].as_str().unwrap().to_owned(),
        )
    }

    pub async fn create_conversation(&self, body: Value) -> String {
        let resp = self
            .client
            .post(self.url("/v1/api/conversations"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        body["data"]["id"].as_str().unwrap().to_owned()
    }

    /// Current stage of a conversation, via the messages endpoint.
    pub async fn stage(&self, conversation_id: &str) -> String {
        let resp = self
            .client
            .get(self.url(&format!("/v1/api/conversations/{conversation_id}/messages")))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        body["stage"].as_str().unwrap_or_default().to_owned()
    }

    /// Poll until `predicate` holds over the conversation's messages.
    pub async fn wait_for_messages<F>(&self, conversation_id: &str, predicate: F) -> Value
    where
        F: Fn(&[Value]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let resp = self
                .client
                .get(self.url(&format!(
                    "/v1/api/conversations/{conversation_id}/messages?interim=1"
                )))
                .send()
                .await
                .unwrap();
            let body: Value = resp.json().await.unwrap();
            let messages = body["data"]["messages"].as_array().cloned().unwrap_or_default();
            if predicate(&messages) {
                return body;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for messages: {body}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll the turn list until the conversation has no running turn.
    pub async fn wait_idle(&self, conversation_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.state.store.running_turns(conversation_id).is_empty() {
            if tokio::time::Instant::now() > deadline {
                panic!("turn never finished");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
