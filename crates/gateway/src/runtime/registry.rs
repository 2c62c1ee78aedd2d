//! The federated tool registry.
//!
//! One catalog, keyed by canonical `service/method` name, covering every
//! remote tool server plus the in-process services and the virtual overlay
//! (sub-agents, `agent/run`, `orchestrator/plan`). The registry resolves
//! pattern matches, executes calls with reconnect-retry and per-call
//! deadlines, applies `|selector` post-processing, and memoizes identical
//! calls per conversation to damp tight loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use pv_domain::config::RegistryConfig;
use pv_domain::error::{Error, Result};
use pv_domain::tool::{canonical_tool_name, split_selector, ToolDefinition, ToolOutcome};
use pv_domain::trace::TraceEvent;
use pv_toolserver::manager::CATALOG_SCOPE;
use pv_toolserver::{ProxyManager, RemoteToolDef};

use super::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call context and results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call invocation context, derived from the turn.
#[derive(Clone)]
pub struct CallContext {
    pub conversation_id: String,
    /// Bearer token from the request, forwarded to proxy calls.
    pub bearer: Option<String>,
    /// Caller-provided deadline. Absent one, the tool's or the default
    /// deadline applies.
    pub deadline: Option<Duration>,
    pub cancel: CancelToken,
}

/// Result of one registry execution.
#[derive(Debug)]
pub struct ExecResult {
    pub outcome: ToolOutcome,
    /// Served from the per-conversation memo.
    pub memo_hit: bool,
    /// Payload id recorded for the memoized response, if any.
    pub memoized_payload: Option<String>,
    /// Which server handled the call (None for in-process services).
    pub server: Option<String>,
}

/// An in-process service method.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext, args: Value) -> Result<ToolOutcome>;
}

/// One catalog entry: a definition plus where it executes.
#[derive(Clone)]
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    /// The schema as published by the source, before composition.
    pub raw_schema: Value,
    /// Owning server; `None` for in-process/virtual entries.
    pub server: Option<String>,
    pub handler: Option<Arc<dyn ServiceHandler>>,
    /// Pre-registered overlay entries are always visible and searched
    /// first.
    pub overlay: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memoization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct MemoEntry {
    outcome: ToolOutcome,
    payload_id: Option<String>,
    server: Option<String>,
    expires: Instant,
}

type MemoKey = (String, String, String); // (conversation, tool+selector, args)

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    config: RegistryConfig,
    proxies: Arc<ProxyManager>,
    catalog: RwLock<HashMap<String, CatalogEntry>>,
    /// Overlay names in registration order (searched before the catalog).
    overlay_order: RwLock<Vec<String>>,
    memo: Mutex<HashMap<MemoKey, MemoEntry>>,
}

impl ToolRegistry {
    pub fn new(config: RegistryConfig, proxies: Arc<ProxyManager>) -> Self {
        Self {
            config,
            proxies,
            catalog: RwLock::new(HashMap::new()),
            overlay_order: RwLock::new(Vec::new()),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ── Registration and federation ──────────────────────────────────

    /// Pre-register a virtual overlay entry (in-process service or
    /// synthetic tool). Overlay entries survive every refresh.
    pub fn register_virtual(
        &self,
        definition: ToolDefinition,
        handler: Option<Arc<dyn ServiceHandler>>,
    ) {
        let name = canonical_tool_name(&definition.name);
        let raw_schema = definition.parameters.clone();
        self.catalog.write().insert(
            name.clone(),
            CatalogEntry {
                definition,
                raw_schema,
                server: None,
                handler,
                overlay: true,
            },
        );
        let mut order = self.overlay_order.write();
        if !order.contains(&name) {
            order.push(name);
        }
    }

    /// Fetch a server's tool list and apply it. Cached entries survive
    /// outages: a failed or empty refresh never evicts.
    pub async fn refresh_server(&self, server: &str) -> Result<usize> {
        let client = self.proxies.acquire(CATALOG_SCOPE, server).await?;
        let tools = client.list_tools().await?;
        Ok(self.apply_refresh(server, tools))
    }

    /// Apply a fetched tool list. A non-empty list atomically replaces
    /// every entry for that server; an empty list is ignored.
    pub fn apply_refresh(&self, server: &str, tools: Vec<RemoteToolDef>) -> usize {
        if tools.is_empty() {
            return 0;
        }

        let timeout_sec = self
            .proxies
            .server_config(server)
            .and_then(|c| c.call_timeout_sec);

        let mut catalog = self.catalog.write();
        catalog.retain(|_, entry| entry.server.as_deref() != Some(server));
        let mut count = 0;
        for tool in tools {
            let name = if tool.name.contains('/') {
                canonical_tool_name(&tool.name)
            } else {
                format!("{server}/{}", tool.name)
            };
            catalog.insert(
                name.clone(),
                CatalogEntry {
                    definition: ToolDefinition {
                        name,
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                        timeout_sec,
                    },
                    raw_schema: tool.input_schema,
                    server: Some(server.to_owned()),
                    handler: None,
                    overlay: false,
                },
            );
            count += 1;
        }
        drop(catalog);

        TraceEvent::CatalogRefreshed {
            server: server.to_owned(),
            tool_count: count,
        }
        .emit();
        count
    }

    // ── Lookup and pattern matching ──────────────────────────────────

    pub fn get(&self, name: &str) -> Option<CatalogEntry> {
        let canonical = canonical_tool_name(split_selector(name).0);
        self.catalog.read().get(&canonical).cloned()
    }

    /// Every matching definition for a pattern, overlay first. Accepted
    /// forms: exact (`service/method`, `service:method`), `service/*`,
    /// `service:*`, a bare service name, or a wildcard suffix. A
    /// `|selector` suffix is stripped before matching.
    pub fn match_pattern(&self, pattern: &str) -> Vec<ToolDefinition> {
        let pattern = split_selector(pattern).0;
        let catalog = self.catalog.read();
        let overlay_order = self.overlay_order.read();

        let matches: Box<dyn Fn(&str) -> bool> = if pattern == "*" {
            Box::new(|_| true)
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            let prefix = if prefix.is_empty() {
                String::new()
            } else {
                canonical_tool_name(prefix.trim_end_matches([':', '/']))
            };
            // `service*` matches the service; `service/me*` matches the
            // method prefix.
            if pattern.ends_with("/*") || pattern.ends_with(":*") {
                let service_prefix = format!("{prefix}/");
                Box::new(move |name: &str| name.starts_with(&service_prefix))
            } else {
                Box::new(move |name: &str| name.starts_with(&prefix))
            }
        } else if pattern.contains('/') || pattern.contains(':') || pattern.contains('-') {
            let exact = canonical_tool_name(pattern);
            Box::new(move |name: &str| name == exact)
        } else {
            // Bare service name.
            let service_prefix = format!("{pattern}/");
            Box::new(move |name: &str| name.starts_with(&service_prefix))
        };

        let mut seen: Vec<String> = Vec::new();
        let mut out: Vec<ToolDefinition> = Vec::new();

        for name in overlay_order.iter() {
            if matches(name) {
                if let Some(entry) = catalog.get(name) {
                    seen.push(name.clone());
                    out.push(entry.definition.clone());
                }
            }
        }

        let mut rest: Vec<&CatalogEntry> = catalog
            .values()
            .filter(|e| !e.overlay && matches(&e.definition.name))
            .collect();
        rest.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        for entry in rest {
            if !seen.contains(&entry.definition.name) {
                out.push(entry.definition.clone());
            }
        }
        out
    }

    /// The definitions a caller with these patterns may see. Empty
    /// patterns mean everything.
    pub fn definitions_for(&self, patterns: &[String]) -> Vec<ToolDefinition> {
        if patterns.is_empty() {
            return self.match_pattern("*");
        }
        let mut out: Vec<ToolDefinition> = Vec::new();
        for pattern in patterns {
            for def in self.match_pattern(pattern) {
                if !out.iter().any(|d| d.name == def.name) {
                    out.push(def);
                }
            }
        }
        out
    }

    /// Snapshot of the whole catalog (introspection).
    pub fn list_catalog(&self) -> Vec<(ToolDefinition, Option<String>, bool)> {
        let mut out: Vec<(ToolDefinition, Option<String>, bool)> = self
            .catalog
            .read()
            .values()
            .map(|e| (e.definition.clone(), e.server.clone(), e.overlay))
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        out
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Execute a tool call: resolve, dispatch (with reconnect-retry for
    /// proxied calls), apply the selector, memoize.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        raw_tool: &str,
        args: &Value,
    ) -> Result<ExecResult> {
        let (name, selector) = split_selector(raw_tool);
        let canonical = canonical_tool_name(name);
        let memo_tool = match selector {
            Some(s) => format!("{canonical}|{s}"),
            None => canonical.clone(),
        };
        let memo_key: MemoKey = (
            ctx.conversation_id.clone(),
            memo_tool,
            serde_json::to_string(args)?,
        );

        if let Some(hit) = self.memo_lookup(&memo_key) {
            return Ok(ExecResult {
                outcome: hit.outcome,
                memo_hit: true,
                memoized_payload: hit.payload_id,
                server: hit.server,
            });
        }

        let entry = self
            .catalog
            .read()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(canonical.clone()))?;

        let timeout = ctx
            .deadline
            .or(entry.definition.timeout_sec.map(Duration::from_secs))
            .unwrap_or(Duration::from_secs(self.config.default_call_timeout_sec));

        let started = Instant::now();
        let dispatched = if let Some(handler) = &entry.handler {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
                r = tokio::time::timeout(timeout, handler.handle(ctx, args.clone())) => {
                    r.unwrap_or_else(|_| {
                        Err(Error::Timeout(format!("{canonical} exceeded {timeout:?}")))
                    })
                }
            }
        } else if let Some(server) = &entry.server {
            self.call_proxy(ctx, server, &canonical, args, timeout).await
        } else {
            Err(Error::Permanent(format!(
                "virtual tool {canonical} has no handler"
            )))
        };

        TraceEvent::ToolDispatched {
            conversation_id: ctx.conversation_id.clone(),
            tool_name: canonical.clone(),
            server: entry.server.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            is_error: dispatched.is_err(),
            memo_hit: false,
        }
        .emit();

        let outcome = dispatched?;
        let outcome = match selector {
            Some(selector) => apply_selector(outcome, selector)?,
            None => outcome,
        };

        self.memo.lock().insert(
            memo_key,
            MemoEntry {
                outcome: outcome.clone(),
                payload_id: None,
                server: entry.server.clone(),
                expires: Instant::now() + Duration::from_millis(self.config.memo_ttl_ms),
            },
        );

        Ok(ExecResult {
            outcome,
            memo_hit: false,
            memoized_payload: None,
            server: entry.server,
        })
    }

    /// Attach the recorded response payload to a fresh memo entry so
    /// deduplicated calls share it.
    pub fn record_payload(
        &self,
        conversation_id: &str,
        raw_tool: &str,
        args: &Value,
        payload_id: &str,
    ) {
        let (name, selector) = split_selector(raw_tool);
        let canonical = canonical_tool_name(name);
        let memo_tool = match selector {
            Some(s) => format!("{canonical}|{s}"),
            None => canonical,
        };
        let Ok(args_json) = serde_json::to_string(args) else {
            return;
        };
        let key: MemoKey = (conversation_id.to_owned(), memo_tool, args_json);
        if let Some(entry) = self.memo.lock().get_mut(&key) {
            entry.payload_id = Some(payload_id.to_owned());
        }
    }

    /// Drop expired memo entries.
    pub fn prune_memo(&self) {
        let now = Instant::now();
        self.memo.lock().retain(|_, entry| entry.expires > now);
    }

    fn memo_lookup(&self, key: &MemoKey) -> Option<MemoEntry> {
        let memo = self.memo.lock();
        let entry = memo.get(key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.clone())
    }

    async fn call_proxy(
        &self,
        ctx: &CallContext,
        server: &str,
        canonical: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let local = ProxyManager::local_name(server, canonical);
        let mut attempt = 0u32;
        loop {
            let client = self.proxies.acquire(&ctx.conversation_id, server).await?;
            let call = client.call_tool(local, args.clone(), ctx.bearer.as_deref());
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                r = tokio::time::timeout(timeout, call) => r.unwrap_or_else(|_| {
                    Err(Error::Timeout(format!("{canonical} exceeded {timeout:?}")))
                }),
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < 2 => {
                    attempt += 1;
                    tracing::warn!(
                        tool = %canonical,
                        server = %server,
                        attempt,
                        error = %e,
                        "reconnectable proxy failure, retrying"
                    );
                    self.proxies
                        .reconnect(&ctx.conversation_id, server, attempt)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selector post-processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply a `|selector` transformation: the tool's textual result is parsed
/// as JSON and walked by dot-path (object keys and array indices).
fn apply_selector(outcome: ToolOutcome, selector: &str) -> Result<ToolOutcome> {
    let text = outcome.render();
    let value: Value = serde_json::from_str(&text).map_err(|e| {
        Error::Permanent(format!("selector '{selector}' applied to non-JSON result: {e}"))
    })?;

    let mut current = &value;
    for segment in selector.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Array(arr) => segment.parse::<usize>().ok().and_then(|i| arr.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        }
        .ok_or_else(|| {
            Error::Permanent(format!("selector '{selector}': nothing at '{segment}'"))
        })?;
    }

    Ok(match current {
        Value::String(s) => ToolOutcome::text(s.clone()),
        other => ToolOutcome::structured(other.clone()),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
