//! In-process services and the virtual overlay.
//!
//! Each internal service declares its input shape in a schema table at
//! compile time; the registry composes these with the federated catalog
//! without any runtime type inspection. The overlay is pre-registered and
//! always visible: sub-agent delegation (`agent/run`, `agent/list`) and the
//! orchestrator plan tool.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use pv_domain::config::AgentConfig;
use pv_domain::error::{Error, Result};
use pv_domain::tool::{ToolDefinition, ToolOutcome};

use super::registry::{CallContext, ServiceHandler, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child-runner capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The capability `agent/run` needs from the orchestrator: run a child
/// conversation to completion and return its final answer. Passed as a
/// narrow interface to break the registry ↔ orchestrator cycle.
#[async_trait::async_trait]
pub trait ChildRunner: Send + Sync {
    async fn run_child(
        &self,
        ctx: &CallContext,
        agent_id: Option<&str>,
        task: &str,
        model: Option<&str>,
    ) -> Result<String>;
}

/// Late-bound slot for the child runner. The orchestrator installs the
/// implementation at bootstrap; tests may override it with another
/// non-null value.
#[derive(Default)]
pub struct ChildRunnerSlot {
    inner: RwLock<Option<Arc<dyn ChildRunner>>>,
}

impl ChildRunnerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, runner: Arc<dyn ChildRunner>) {
        *self.inner.write() = Some(runner);
    }

    fn get(&self) -> Result<Arc<dyn ChildRunner>> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| Error::Config("agent runner is not initialized".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent/run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AgentRunService {
    slot: Arc<ChildRunnerSlot>,
    agents: Vec<AgentConfig>,
}

#[async_trait::async_trait]
impl ServiceHandler for AgentRunService {
    async fn handle(&self, ctx: &CallContext, args: Value) -> Result<ToolOutcome> {
        let task = args
            .get("task")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Validation("agent/run requires 'task'".into()))?;
        let agent_id = args.get("agent_id").and_then(|a| a.as_str());
        let model = args.get("model").and_then(|m| m.as_str());

        if let Some(id) = agent_id {
            if !self.agents.iter().any(|a| a.id == id) {
                return Err(Error::NotFound(format!("agent '{id}'")));
            }
        }

        let answer = self.slot.get()?.run_child(ctx, agent_id, task, model).await?;
        Ok(ToolOutcome::text(answer))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agent/list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AgentListService {
    agents: Vec<AgentConfig>,
}

#[async_trait::async_trait]
impl ServiceHandler for AgentListService {
    async fn handle(&self, _ctx: &CallContext, _args: Value) -> Result<ToolOutcome> {
        let listing: Vec<Value> = self
            .agents
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "description": a.description,
                    "model": a.model,
                })
            })
            .collect();
        Ok(ToolOutcome::structured(Value::Array(listing)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// orchestrator/plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PlanService;

#[async_trait::async_trait]
impl ServiceHandler for PlanService {
    async fn handle(&self, _ctx: &CallContext, args: Value) -> Result<ToolOutcome> {
        let steps = args
            .get("steps")
            .and_then(|s| s.as_array())
            .ok_or_else(|| Error::Validation("orchestrator/plan requires 'steps'".into()))?;
        if steps.is_empty() {
            return Err(Error::Validation("plan has no steps".into()));
        }
        Ok(ToolOutcome::structured(serde_json::json!({
            "accepted": true,
            "steps": steps.len(),
        })))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Overlay registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pre-register the virtual overlay into the registry.
pub fn register_overlay(
    registry: &ToolRegistry,
    agents: &[AgentConfig],
    slot: Arc<ChildRunnerSlot>,
) {
    registry.register_virtual(
        ToolDefinition {
            name: "agent/run".into(),
            description: "Delegate a task to a sub-agent. The agent runs in its own conversation with scoped tools and returns its final answer.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string", "description": "Agent to run (see agent/list). Omit for the default agent." },
                    "task": { "type": "string", "description": "The task or question for the agent" },
                    "model": { "type": "string", "description": "Optional model override (provider/model)" }
                },
                "required": ["task"]
            }),
            timeout_sec: Some(600),
        },
        Some(Arc::new(AgentRunService {
            slot,
            agents: agents.to_vec(),
        })),
    );

    registry.register_virtual(
        ToolDefinition {
            name: "agent/list".into(),
            description: "List the configured sub-agents and their capabilities.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            timeout_sec: Some(5),
        },
        Some(Arc::new(AgentListService {
            agents: agents.to_vec(),
        })),
    );

    registry.register_virtual(
        ToolDefinition {
            name: "orchestrator/plan".into(),
            description: "Record a multi-step plan before executing it. Each step names a tool and its arguments.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "tool": { "type": "string", "description": "Canonical service/method name" },
                                "args": { "type": "object" },
                                "rationale": { "type": "string" }
                            },
                            "required": ["tool"]
                        }
                    }
                },
                "required": ["steps"]
            }),
            timeout_sec: Some(5),
        },
        Some(Arc::new(PlanService)),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cancel::CancelToken;
    use pv_domain::config::RegistryConfig;
    use pv_toolserver::ProxyManager;

    fn overlay_registry(agents: Vec<AgentConfig>) -> (Arc<ToolRegistry>, Arc<ChildRunnerSlot>) {
        let registry = Arc::new(ToolRegistry::new(
            RegistryConfig::default(),
            Arc::new(ProxyManager::new(Vec::new())),
        ));
        let slot = Arc::new(ChildRunnerSlot::new());
        register_overlay(&registry, &agents, slot.clone());
        (registry, slot)
    }

    fn ctx() -> CallContext {
        CallContext {
            conversation_id: "c1".into(),
            bearer: None,
            deadline: None,
            cancel: CancelToken::new(),
        }
    }

    fn agents() -> Vec<AgentConfig> {
        vec![AgentConfig {
            id: "researcher".into(),
            description: "Looks things up".into(),
            model: None,
            system_prompt: None,
            tools: Vec::new(),
        }]
    }

    struct EchoRunner;

    #[async_trait::async_trait]
    impl ChildRunner for EchoRunner {
        async fn run_child(
            &self,
            _ctx: &CallContext,
            agent_id: Option<&str>,
            task: &str,
            _model: Option<&str>,
        ) -> Result<String> {
            Ok(format!("{}:{task}", agent_id.unwrap_or("default")))
        }
    }

    #[test]
    fn overlay_is_always_visible() {
        let (registry, _) = overlay_registry(agents());
        let all = registry.match_pattern("*");
        let names: Vec<&str> = all.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"agent/run"));
        assert!(names.contains(&"agent/list"));
        assert!(names.contains(&"orchestrator/plan"));
    }

    #[tokio::test]
    async fn agent_run_requires_installed_runner() {
        let (registry, slot) = overlay_registry(agents());
        let args = serde_json::json!({ "task": "find the answer" });

        let err = registry.execute(&ctx(), "agent/run", &args).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        slot.install(Arc::new(EchoRunner));
        let result = registry.execute(&ctx(), "agent/run", &args).await.unwrap();
        assert_eq!(result.outcome.render(), "default:find the answer");
    }

    #[tokio::test]
    async fn agent_run_rejects_unknown_agent() {
        let (registry, slot) = overlay_registry(agents());
        slot.install(Arc::new(EchoRunner));

        let err = registry
            .execute(
                &ctx(),
                "agent/run",
                &serde_json::json!({ "agent_id": "ghost", "task": "x" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn agent_list_returns_catalog() {
        let (registry, _) = overlay_registry(agents());
        let result = registry
            .execute(&ctx(), "agent/list", &serde_json::json!({}))
            .await
            .unwrap();
        let listing = result.outcome.structured.unwrap();
        assert_eq!(listing[0]["id"], "researcher");
    }

    #[tokio::test]
    async fn plan_tool_validates_steps() {
        let (registry, _) = overlay_registry(Vec::new());

        let ok = registry
            .execute(
                &ctx(),
                "orchestrator/plan",
                &serde_json::json!({ "steps": [{ "tool": "db/ping" }] }),
            )
            .await
            .unwrap();
        assert_eq!(ok.outcome.structured.unwrap()["steps"], 1);

        let err = registry
            .execute(&ctx(), "orchestrator/plan", &serde_json::json!({ "steps": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
