//! Background catalog monitors — one task per known tool server.
//!
//! A healthy server is refreshed on a steady cadence; failures back off
//! exponentially (1 s → 60 s) with ±200 ms jitter to spread refresh storms.
//! A separate reaper drops idle proxy clients and expired memo entries.

use std::sync::Arc;
use std::time::Duration;

use super::registry::ToolRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backoff policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RefreshBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Steady cadence while the server is healthy.
    pub steady: Duration,
}

impl RefreshBackoff {
    pub fn new(steady: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            steady,
        }
    }

    /// Delay before the next attempt after `attempt` consecutive failures
    /// (0-indexed), jittered ±200 ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * 2f64.powi(attempt.min(16) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        jittered(capped_ms, attempt)
    }

    /// The healthy-cadence delay, jittered ±200 ms.
    pub fn steady_delay(&self, tick: u32) -> Duration {
        jittered(self.steady.as_millis() as f64, tick)
    }
}

/// Apply ±200 ms of deterministic jitter. Uses a multiplicative hash of
/// the counter rather than an RNG; just enough to spread refresh storms.
fn jittered(base_ms: f64, counter: u32) -> Duration {
    let hash = counter.wrapping_mul(2654435761);
    let fraction = (hash as f64) / (u32::MAX as f64);
    let jitter_ms = fraction * 400.0 - 200.0;
    Duration::from_millis((base_ms + jitter_ms).max(0.0) as u64)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn one refresh task per configured server plus the idle reaper.
pub fn spawn_monitors(registry: Arc<ToolRegistry>) {
    let steady = Duration::from_secs(registry.config().refresh_interval_sec);

    for server in registry.proxies().server_names() {
        let registry = registry.clone();
        let backoff = RefreshBackoff::new(steady);
        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut tick = 0u32;
            loop {
                match registry.refresh_server(&server).await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::debug!(server = %server, tools = count, "catalog refreshed");
                        }
                        failures = 0;
                    }
                    Err(e) => {
                        tracing::warn!(
                            server = %server,
                            failures,
                            error = %e,
                            "catalog refresh failed"
                        );
                        failures = failures.saturating_add(1);
                    }
                }

                tick = tick.wrapping_add(1);
                let delay = if failures == 0 {
                    backoff.steady_delay(tick)
                } else {
                    backoff.delay_for_attempt(failures - 1)
                };
                tokio::time::sleep(delay).await;
            }
        });
    }

    // Reaper: idle proxy clients and expired memo entries.
    let idle_ttl = Duration::from_secs(registry.config().idle_client_ttl_sec);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(steady).await;
            let reaped = registry.proxies().reap_idle(idle_ttl);
            if reaped > 0 {
                tracing::debug!(reaped, "reaped idle tool-server clients");
            }
            registry.prune_memo();
        }
    });
}
