//! End-to-end turn scenarios against the HTTP surface, driven by a
//! scripted provider and a fake tool server.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use pv_domain::config::ToolServerConfig;
use pv_domain::error::Result;
use pv_domain::tool::{ToolDefinition, ToolOutcome};
use pv_gateway::runtime::events::EventType;
use pv_gateway::runtime::registry::{CallContext, ServiceHandler};

use support::{harness, spawn_fake_tool_server, streaming_harness, Scripted};

fn db_server(url: &str) -> ToolServerConfig {
    ToolServerConfig {
        name: "db".into(),
        url: url.into(),
        bearer_env: None,
        call_timeout_sec: Some(30),
    }
}

async fn long_poll(h: &support::Harness, conv: &str, since: u64) -> Value {
    let resp = h
        .client
        .get(h.url(&format!(
            "/v1/api/conversations/{conv}/events?wait=1&since={since}"
        )))
        .send()
        .await
        .unwrap();
    resp.json().await.unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S1 — happy path, no tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s1_happy_path_no_tools() {
    let h = harness(vec![Scripted::answer("Hello there!")], Vec::new()).await;

    let conv = h.create_conversation(serde_json::json!({ "title": "hi" })).await;
    let (conv_id, _msg_id) = h.post_message(&conv, "hello").await;
    assert_eq!(conv_id, conv);

    h.wait_idle(&conv).await;

    let body = long_poll(&h, &conv, 0).await;
    let events = body["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event"], "assistant_message");
    assert_eq!(events[0]["seq"], 1);
    assert_eq!(events[0]["message"]["role"], "user");
    assert_eq!(events[1]["event"], "assistant_message");
    assert_eq!(events[1]["seq"], 2);
    assert_eq!(events[1]["content"], "Hello there!");

    assert_eq!(h.stage(&conv).await, "done");

    // Usage flushed: one row for the scripted model.
    let totals = h.state.store.usage_totals(&conv);
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].provider, "scripted");
    assert_eq!(totals[0].total_tokens, 15);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S2 — tool call with retry on reconnectable error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s2_tool_retry_on_reconnectable_error() {
    let server = spawn_fake_tool_server(1).await;
    let h = harness(
        vec![
            Scripted::plan(vec![("db/ping", serde_json::json!({}))]),
            Scripted::answer("the database is up"),
        ],
        vec![db_server(&server.url)],
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "ping the db").await;
    h.wait_idle(&conv).await;

    // One tool message, completed, with a response payload.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| m["tool_call"].is_object())
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    let tool_msgs: Vec<&Value> = messages
        .iter()
        .filter(|m| m["tool_call"].is_object())
        .collect();
    assert_eq!(tool_msgs.len(), 1, "exactly one tool-call row: {body}");
    assert_eq!(tool_msgs[0]["tool_call"]["status"], "completed");
    assert!(tool_msgs[0]["tool_call"]["response_payload_id"].is_string());

    // Two proxy attempts: the failed one and the retry after reconnect.
    assert_eq!(server.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    // Event stream saw started then completed.
    let body = long_poll(&h, &conv, 0).await;
    let kinds: Vec<&str> = body["data"]["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"tool_call_completed"));
    assert!(!kinds.contains(&"tool_call_failed"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S3 — elicitation pause and resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s3_elicitation_pause_and_resume() {
    let h = harness(
        vec![
            Scripted::elicitation("need date", &["date"]),
            Scripted::answer("booked for 2025-01-02"),
        ],
        Vec::new(),
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "book it").await;

    // Wait until the prompt is recorded and open.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter()
                .any(|m| m["elicitation"].is_object() && m["status"] == "open")
        })
        .await;
    assert_eq!(body["stage"], "eliciting");
    let prompt_id = body["data"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["elicitation"].is_object())
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let resp = h
        .client
        .post(h.url(&format!("/v1/api/elicitation/{prompt_id}")))
        .json(&serde_json::json!({
            "action": "accept",
            "payload": { "date": "2025-01-02" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    h.wait_idle(&conv).await;

    // The resumed model call sees the payload in its binding.
    let requests = h.provider.requests.lock();
    assert_eq!(requests.len(), 2);
    let second = serde_json::to_string(&requests[1].messages).unwrap();
    assert!(second.contains("2025-01-02"), "binding: {second}");
    drop(requests);

    // The original prompt carries `done`; the turn succeeded.
    let prompt = h.state.store.get_message(&prompt_id).unwrap();
    assert_eq!(
        serde_json::to_value(prompt.status).unwrap(),
        serde_json::json!("done")
    );
    assert_eq!(h.stage(&conv).await, "done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Elicitation left unresolved
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// POST a user message and return the assigned turn id as well.
async fn post_message_with_turn(
    h: &support::Harness,
    conv: &str,
    content: &str,
) -> (String, uuid::Uuid) {
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/messages")))
        .json(&serde_json::json!({ "content": content }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let body: Value = resp.json().await.unwrap();
    (
        body["data"]["id"].as_str().unwrap().to_owned(),
        body["data"]["turnId"].as_str().unwrap().parse().unwrap(),
    )
}

async fn open_prompt_id(h: &support::Harness, conv: &str) -> String {
    let body = h
        .wait_for_messages(conv, |msgs| {
            msgs.iter()
                .any(|m| m["elicitation"].is_object() && m["status"] == "open")
        })
        .await;
    body["data"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["elicitation"].is_object())
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_owned()
}

#[tokio::test]
async fn unresolved_elicitation_times_out_and_fails_the_turn() {
    // The harness configures a 5 s elicitation timeout; nobody answers.
    let h = harness(
        vec![Scripted::elicitation("need date", &["date"])],
        Vec::new(),
    )
    .await;
    let conv = h.create_conversation(serde_json::json!({})).await;
    let (_msg_id, turn_id) = post_message_with_turn(&h, &conv, "book it").await;

    let prompt_id = open_prompt_id(&h, &conv).await;
    h.wait_idle(&conv).await;

    // The prompt is patched to failed and the turn closes as failed.
    let prompt = h.state.store.get_message(&prompt_id).unwrap();
    assert_eq!(
        serde_json::to_value(prompt.status).unwrap(),
        serde_json::json!("failed")
    );
    let turn = h.state.store.get_turn(turn_id).unwrap();
    assert_eq!(
        serde_json::to_value(turn.status).unwrap(),
        serde_json::json!("failed")
    );
    assert!(h.state.awaiters.list_pending().is_empty());
    assert_eq!(h.stage(&conv).await, "error");
}

#[tokio::test]
async fn terminate_while_awaiting_elicitation_cancels_the_turn() {
    let h = harness(
        vec![Scripted::elicitation("need date", &["date"])],
        Vec::new(),
    )
    .await;
    let conv = h.create_conversation(serde_json::json!({})).await;
    let (_msg_id, turn_id) = post_message_with_turn(&h, &conv, "book it").await;
    let prompt_id = open_prompt_id(&h, &conv).await;

    // Cancel the conversation while the turn is parked on the waiter.
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/terminate")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);

    h.wait_idle(&conv).await;

    let prompt = h.state.store.get_message(&prompt_id).unwrap();
    assert_eq!(
        serde_json::to_value(prompt.status).unwrap(),
        serde_json::json!("failed")
    );
    let turn = h.state.store.get_turn(turn_id).unwrap();
    assert_eq!(
        serde_json::to_value(turn.status).unwrap(),
        serde_json::json!("cancelled")
    );
    assert!(h.state.awaiters.list_pending().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S4 — cancellation mid-tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct HangForever;

#[async_trait::async_trait]
impl ServiceHandler for HangForever {
    async fn handle(&self, _ctx: &CallContext, _args: Value) -> Result<ToolOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ToolOutcome::text("never"))
    }
}

#[tokio::test]
async fn s4_cancellation_mid_tool() {
    let h = harness(
        vec![Scripted::plan(vec![("slow/hang", serde_json::json!({}))])],
        Vec::new(),
    )
    .await;
    h.state.tools.register_virtual(
        ToolDefinition {
            name: "slow/hang".into(),
            description: "hangs forever".into(),
            parameters: serde_json::json!({ "type": "object" }),
            timeout_sec: None,
        },
        Some(Arc::new(HangForever)),
    );

    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "do the slow thing").await;

    h.wait_for_messages(&conv, |msgs| {
        msgs.iter().any(|m| m["tool_call"]["status"] == "running")
    })
    .await;
    assert_eq!(h.stage(&conv).await, "executing");

    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/terminate")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["cancelled"], true);

    h.wait_idle(&conv).await;

    // The tool message failed with "cancelled"; no assistant answer after.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| m["tool_call"]["status"] == "failed")
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    let tool = messages
        .iter()
        .find(|m| m["tool_call"].is_object())
        .unwrap();
    assert_eq!(tool["tool_call"]["error"], "cancelled");
    let tool_seq = tool["seq"].as_u64().unwrap();
    assert!(!messages.iter().any(|m| {
        m["role"] == "assistant"
            && m["status"] == "done"
            && m["seq"].as_u64().unwrap_or(0) > tool_seq
    }));

    // Turn closed as cancelled, transcript retained.
    let turns = h.state.store.running_turns(&conv);
    assert!(turns.is_empty());

    // A second terminate finds nothing running.
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/terminate")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S5 — event replay from a cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s5_event_replay_from_cursor() {
    let h = harness(vec![Scripted::answer("fin")], Vec::new()).await;
    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "go").await;
    h.wait_idle(&conv).await;

    // Two finalized messages: resume past the first sees only the second.
    let body = long_poll(&h, &conv, 1).await;
    let events = body["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["seq"], 2);
    assert_eq!(body["data"]["latest"], 2);

    // Resume at the tip waits out the bound and returns an empty batch.
    let start = std::time::Instant::now();
    let body = long_poll(&h, &conv, 2).await;
    assert!(body["data"]["events"].as_array().unwrap().is_empty());
    assert!(start.elapsed() >= Duration::from_millis(900));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S6 — deduplication of identical calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s6_identical_calls_share_one_proxy_call() {
    let server = spawn_fake_tool_server(0).await;
    let h = harness(
        vec![
            Scripted::plan(vec![
                ("db/ping", serde_json::json!({})),
                ("db/ping", serde_json::json!({})),
            ]),
            Scripted::answer("pinged twice"),
        ],
        vec![db_server(&server.url)],
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "ping twice").await;
    h.wait_idle(&conv).await;

    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter()
                .filter(|m| m["tool_call"]["status"] == "completed")
                .count()
                == 2
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    let payload_ids: Vec<&str> = messages
        .iter()
        .filter(|m| m["tool_call"].is_object())
        .map(|m| m["tool_call"]["response_payload_id"].as_str().unwrap())
        .collect();
    assert_eq!(payload_ids.len(), 2);
    assert_eq!(payload_ids[0], payload_ids[1]);

    // Only one proxy call reached the server.
    assert_eq!(server.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming provider: interim deltas + index-keyed tool assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn streaming_turn_flows_interim_deltas_and_assembles_tools() {
    // The streaming provider emits token chunks and index-keyed argument
    // deltas with no finish event, like real chat-completions endpoints.
    let h = streaming_harness(
        vec![
            Scripted::plan(vec![("agent/list", serde_json::json!({}))])
                .with_content("Checking the roster."),
            Scripted::answer("researcher is available"),
        ],
        Vec::new(),
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    let mut rx = h.state.events.subscribe(&conv);
    h.post_message(&conv, "who's available?").await;
    h.wait_idle(&conv).await;

    // The index-keyed deltas assembled into a real call that executed.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| m["tool_call"]["status"] == "completed")
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    let tool = messages
        .iter()
        .find(|m| m["tool_call"].is_object())
        .unwrap();
    assert_eq!(tool["tool_call"]["tool_name"], "agent/list");
    assert!(messages
        .iter()
        .any(|m| m["role"] == "assistant" && m["content"] == "researcher is available"));

    // Streamed tokens arrived as unsequenced interim deltas.
    let mut interim = 0usize;
    let mut streamed_text = String::new();
    while let Ok(outbound) = rx.try_recv() {
        if outbound.event == EventType::InterimMessage {
            assert_eq!(outbound.envelope.seq, 0);
            interim += 1;
            if let Some(content) = &outbound.envelope.content {
                streamed_text.push_str(content);
            }
        }
    }
    assert!(interim >= 2, "expected streamed deltas, saw {interim}");
    assert!(streamed_text.contains("Checking the roster."));
    assert!(streamed_text.contains("researcher is available"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Overlapping turns conflict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn overlapping_turn_starts_conflict() {
    let h = harness(
        vec![Scripted::answer("slow answer").with_delay(800)],
        Vec::new(),
    )
    .await;
    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "first").await;

    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/messages")))
        .json(&serde_json::json!({ "content": "second" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    h.wait_idle(&conv).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent/run spawns a child conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn agent_run_delegates_to_child_conversation() {
    let h = harness(
        vec![
            Scripted::plan(vec![(
                "agent/run",
                serde_json::json!({ "agent_id": "researcher", "task": "look up the capital" }),
            )]),
            Scripted::answer("the capital is Oslo"), // child turn
            Scripted::answer("done: the capital is Oslo"), // parent resumes
        ],
        Vec::new(),
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "delegate this").await;
    h.wait_idle(&conv).await;

    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| m["tool_call"]["status"] == "completed")
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    let tool = messages
        .iter()
        .find(|m| m["tool_call"].is_object())
        .unwrap();
    assert_eq!(tool["content"], "the capital is Oslo");

    // The child ran in its own conversation.
    let conversations = h.state.store.list_conversations(true);
    assert_eq!(conversations.len(), 2);
    let child = conversations
        .iter()
        .find(|c| c.id != conv)
        .expect("child conversation");
    assert!(child.title.starts_with("agent:"));
    assert!(h.state.store.running_turns(&child.id).is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval gate (tool policy ask)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn ask_policy_gates_tool_on_approval() {
    let h = harness(
        vec![
            Scripted::plan(vec![("agent/list", serde_json::json!({}))]),
            Scripted::answer("the available agent is researcher"),
        ],
        Vec::new(),
    )
    .await;

    let conv = h.create_conversation(serde_json::json!({})).await;
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/conversations/{conv}/messages")))
        .json(&serde_json::json!({
            "content": "list agents",
            "context": { "toolPolicy": "ask" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);

    // The approval prompt appears as an open elicitation-style message.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| {
                m["elicitation"]["ui"]["kind"] == "approval" && m["status"] == "open"
            })
        })
        .await;
    let prompt_id = body["data"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["elicitation"]["ui"]["kind"] == "approval")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_owned();

    // "yes" maps to approved.
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/approval/{prompt_id}")))
        .json(&serde_json::json!({ "action": "yes" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    h.wait_idle(&conv).await;

    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter().any(|m| m["tool_call"]["status"] == "completed")
        })
        .await;
    let messages = body["data"]["messages"].as_array().unwrap();
    assert!(messages
        .iter()
        .any(|m| m["role"] == "assistant" && m["content"] == "the available agent is researcher"));

    // The prompt itself resolved to done.
    let prompt = h.state.store.get_message(&prompt_id).unwrap();
    assert_eq!(
        serde_json::to_value(prompt.status).unwrap(),
        serde_json::json!("done")
    );

    // Cancel on a finished prompt acks without resolving anything.
    let resp = h
        .client
        .post(h.url(&format!("/v1/api/approval/{prompt_id}")))
        .json(&serde_json::json!({ "action": "cancel" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn status bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn provider_failure_fails_the_turn_with_a_terminal_message() {
    // Empty script: the first model call errors out.
    let h = harness(Vec::new(), Vec::new()).await;
    let conv = h.create_conversation(serde_json::json!({})).await;
    h.post_message(&conv, "hello").await;
    h.wait_idle(&conv).await;

    // The failure is visible as a failed assistant message and the stage
    // reads error until a new turn supersedes it.
    let body = h
        .wait_for_messages(&conv, |msgs| {
            msgs.iter()
                .any(|m| m["role"] == "assistant" && m["status"] == "failed")
        })
        .await;
    assert_eq!(body["stage"], "error");
}
