//! Switchboard
//!
//! A multi-tenant, OpenAI-compatible chat-completions gateway. Inbound
//! requests are authenticated against a chain of methods (static key,
//! database-backed API key, JWT), rate limited per caller, and executed by
//! locally-spawned agent subprocesses that are supervised, health-checked,
//! and protected by per-agent circuit breakers. Responses stream back as
//! SSE or buffer into a single JSON object, and every accepted request
//! leaves exactly one audit record.
//!
//! # Modules
//!
//! - [`auth`]: caller identity resolution
//! - [`agent`]: subprocess executor, breaker, orchestrator, health monitor
//! - [`api`]: the HTTP surface
//! - [`audit`]: append-only request audit trail
//! - [`ratelimit`]: per-caller token buckets
//! - [`persistence`]: Postgres-backed keys, admins, and audit storage

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::map_err_ignore)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod persistence;
pub mod ratelimit;
pub mod server;
pub mod telemetry;
pub mod usage;

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use agent::orchestrator::Orchestrator;
use audit::AuditRecorder;
use auth::Authenticator;
use config::AppConfig;
use persistence::PersistenceLayer;
use ratelimit::CallerRateLimiter;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Credential resolution chain
    pub authenticator: Arc<Authenticator>,
    /// Agent selection, fail-over, and supervision
    pub orchestrator: Arc<Orchestrator>,
    /// Request audit queue
    pub audit: AuditRecorder,
    /// Per-caller rate limiter
    pub limiter: Arc<CallerRateLimiter>,
    /// Persistence Layer (keys, admins, audit rows)
    pub persistence: Option<Arc<dyn PersistenceLayer>>,
    /// Prometheus exposition handle, when metrics are enabled
    pub metrics: Option<PrometheusHandle>,
    /// Cancelled on shutdown; stops all background tasks
    pub shutdown: CancellationToken,
    /// Process start, for `/status` uptime
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("agents", &self.orchestrator.agent_names())
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}
