//! Background health monitor.
//!
//! Probes every non-dead agent on a fixed interval. Three consecutive probe
//! failures mark an agent degraded; a single success restores it (the
//! executor applies the restore when the probe lands). The monitor is
//! advisory only: it never spawns or kills processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::AgentState;
use super::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub degraded_after: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            degraded_after: 3,
        }
    }
}

pub fn spawn_health_monitor(
    orchestrator: Arc<Orchestrator>,
    cfg: HealthMonitorConfig,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for slot in orchestrator.slots() {
                if slot.is_disabled() {
                    continue;
                }
                let Some(instance) = slot.instance().await else {
                    continue;
                };
                if instance.state() == AgentState::Dead {
                    failures.remove(&slot.spec.name);
                    continue;
                }
                match instance.health(cfg.probe_timeout).await {
                    Ok(()) => {
                        failures.remove(&slot.spec.name);
                    }
                    Err(err) => {
                        let count = failures.entry(slot.spec.name.clone()).or_insert(0);
                        *count += 1;
                        tracing::warn!(
                            agent = %slot.spec.name,
                            consecutive = *count,
                            error = %err,
                            "health probe failed"
                        );
                        if *count >= cfg.degraded_after {
                            instance.mark_degraded();
                        }
                    }
                }
            }
        }
    });
}
