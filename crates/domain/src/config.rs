use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Remote tool servers to federate into the catalog.
    #[serde(default, rename = "tool_server")]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub interactive: InteractiveConfig,
    /// Sub-agents exposed through the virtual `agent/run` tool.
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentConfig>,
}

impl Config {
    /// Load a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Validate the config, returning a list of issues. Errors are fatal
    /// to startup; warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue::warning(
                "no [llm] providers configured — model endpoints will reject requests",
            ));
        }
        for p in &self.llm.providers {
            if p.id.is_empty() {
                issues.push(ConfigIssue::error("provider with empty id"));
            }
            if p.base_url.is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "provider '{}' has no base_url",
                    p.id
                )));
            }
        }
        for s in &self.tool_servers {
            if s.name.is_empty() {
                issues.push(ConfigIssue::error("tool server with empty name"));
            }
            if s.url.is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "tool server '{}' has no url",
                    s.name
                )));
            }
        }
        for a in &self.agents {
            if a.id.is_empty() {
                issues.push(ConfigIssue::error("agent with empty id"));
            }
        }
        if self.registry.memo_ttl_ms == 0 {
            issues.push(ConfigIssue::warning(
                "registry.memo_ttl_ms = 0 disables tool-call deduplication",
            ));
        }
        if self.limits.inline_error_cap == 0 {
            issues.push(ConfigIssue::warning(
                "limits.inline_error_cap = 0 forces every tool error into a payload",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Env var holding the API bearer token. Unset/empty = dev mode.
    #[serde(default = "d_token_env")]
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8650,
            host: "127.0.0.1".into(),
            api_token_env: d_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for transcripts, payloads and usage records.
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default model in `provider/model` form.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default, rename = "provider")]
    pub providers: Vec<ProviderConfig>,
    /// Allow continuation-by-response-id when the provider advertises it.
    #[serde(default = "d_true")]
    pub continuation: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            providers: Vec::new(),
            continuation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id, the prefix of `provider/model` strings.
    pub id: String,
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    /// Env var holding the provider API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models served by this provider. First entry is the provider default.
    #[serde(default)]
    pub models: Vec<String>,
    /// Whether the endpoint supports continuation by response id.
    #[serde(default)]
    pub supports_continuation: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Server name; tools federate as `<name>/<method>` unless the server
    /// already prefixes them.
    pub name: String,
    /// JSON-RPC endpoint URL.
    pub url: String,
    /// Env var holding a bearer token sent with every call. A token on the
    /// invocation context takes precedence.
    #[serde(default)]
    pub bearer_env: Option<String>,
    /// Per-call timeout for this server's tools.
    #[serde(default)]
    pub call_timeout_sec: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Steady catalog refresh cadence when a server is healthy.
    #[serde(default = "d_refresh_sec")]
    pub refresh_interval_sec: u64,
    /// TTL of the per-conversation (tool, args) memoization.
    #[serde(default = "d_memo_ttl")]
    pub memo_ttl_ms: u64,
    /// Deadline imposed on a tool call when neither the caller nor the tool
    /// provides one.
    #[serde(default = "d_call_timeout")]
    pub default_call_timeout_sec: u64,
    /// Idle proxy clients older than this are reaped.
    #[serde(default = "d_idle_ttl")]
    pub idle_client_ttl_sec: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_sec: d_refresh_sec(),
            memo_ttl_ms: d_memo_ttl(),
            default_call_timeout_sec: d_call_timeout(),
            idle_client_ttl_sec: d_idle_ttl(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Payload bodies above this are written to a file and stored by
    /// reference.
    #[serde(default = "d_inline_payload")]
    pub inline_payload_cap: usize,
    /// Tool error strings up to this length are inlined into the tool
    /// message; larger ones become payload references.
    #[serde(default = "d_inline_error")]
    pub inline_error_cap: usize,
    /// Maximum attachments a single plan step may produce.
    #[serde(default = "d_attachment_cap")]
    pub attachment_cap: usize,
    /// Maximum planner loop iterations per turn.
    #[serde(default = "d_max_loops")]
    pub max_plan_loops: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            inline_payload_cap: d_inline_payload(),
            inline_error_cap: d_inline_error(),
            attachment_cap: d_attachment_cap(),
            max_plan_loops: d_max_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interactive prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveConfig {
    /// How long a turn stays suspended on an elicitation or approval before
    /// it fails. The system never blocks indefinitely.
    #[serde(default = "d_elicitation_timeout")]
    pub elicitation_timeout_sec: u64,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            elicitation_timeout_sec: d_elicitation_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Model override for this agent, `provider/model` form.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool patterns this agent may use. Empty = everything.
    #[serde(default)]
    pub tools: Vec<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8650
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_token_env() -> String {
    "PV_API_TOKEN".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_true() -> bool {
    true
}
fn d_refresh_sec() -> u64 {
    30
}
fn d_memo_ttl() -> u64 {
    5_000
}
fn d_call_timeout() -> u64 {
    15 * 60
}
fn d_idle_ttl() -> u64 {
    10 * 60
}
fn d_inline_payload() -> usize {
    64 * 1024
}
fn d_inline_error() -> usize {
    160
}
fn d_attachment_cap() -> usize {
    16
}
fn d_max_loops() -> usize {
    25
}
fn d_elicitation_timeout() -> u64 {
    60 * 60
}
