//! Append-only audit trail of authenticated requests and their outcomes.
//!
//! Records go through a bounded in-memory queue drained by a single writer
//! task that batches into the configured sinks (database, file, both, or
//! none). Records never contain message content or credentials; requests are
//! summarized by a content-free fingerprint. On overflow the oldest
//! non-auth-failure record is dropped first and a counter is incremented.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::BreakerSignal;
use crate::auth::{AuthMethod, CallerIdentity};
use crate::persistence::PersistenceLayer;

/// Terminal outcome of an accepted (or auth-rejected) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    AuthFail,
    NoAgent,
    BreakerOpen,
    AgentError,
    ClientCancel,
    UpstreamTimeout,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AuthFail => "auth_fail",
            Self::NoAgent => "no_agent",
            Self::BreakerOpen => "breaker_open",
            Self::AgentError => "agent_error",
            Self::ClientCancel => "client_cancel",
            Self::UpstreamTimeout => "upstream_timeout",
        }
    }

    /// How this outcome counts against the serving agent's breaker.
    pub fn breaker_signal(self) -> BreakerSignal {
        match self {
            Self::Ok => BreakerSignal::Success,
            Self::AgentError | Self::UpstreamTimeout => BreakerSignal::Failure,
            Self::AuthFail | Self::NoAgent | Self::BreakerOpen | Self::ClientCancel => {
                BreakerSignal::Neutral
            }
        }
    }
}

/// One immutable audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub auth_method: Option<AuthMethod>,
    pub agent: Option<String>,
    pub outcome: Outcome,
    pub latency_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub fingerprint: Option<String>,
}

/// Content-free request summary: model, message count, and a token estimate,
/// never the payload itself.
pub fn request_fingerprint(model: &str, message_count: usize, token_estimate: u32) -> String {
    let digest = Sha256::digest(format!("{model}:{message_count}:{token_estimate}").as_bytes());
    hex::encode(digest)
}

/// Where finished records land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSinkKind {
    Db,
    File,
    Both,
    None,
}

impl AuditSinkKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "db" => Some(Self::Db),
            "file" => Some(Self::File),
            "both" => Some(Self::Both),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn wants_db(self) -> bool {
        matches!(self, Self::Db | Self::Both)
    }

    pub fn wants_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    pub file_path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub batch_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::None,
            file_path: None,
            queue_capacity: 4096,
            batch_max: 128,
            batch_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
struct QueueInner {
    queue: StdMutex<VecDeque<AuditRecord>>,
    notify: Notify,
    capacity: usize,
}

/// Handle for enqueuing records; cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    inner: Arc<QueueInner>,
}

impl AuditRecorder {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: StdMutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Enqueue a finished record. Never blocks; on overflow an existing
    /// record is evicted — the oldest non-auth-failure one if any, else the
    /// oldest outright. Priority decides which record loses, never whether
    /// the new record is admitted.
    pub fn record(&self, record: AuditRecord) {
        {
            let mut queue = self.inner.queue.lock().expect("audit queue lock");
            if queue.len() >= self.inner.capacity {
                let victim = queue
                    .iter()
                    .position(|r| r.outcome != Outcome::AuthFail)
                    .unwrap_or(0);
                let _ = queue.remove(victim);
                metrics::counter!("gateway_audit_dropped_total").increment(1);
            }
            queue.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    /// Record an authentication failure (no identity available).
    pub fn record_auth_failure(&self) {
        self.record(AuditRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            user_id: None,
            org_id: None,
            auth_method: None,
            agent: None,
            outcome: Outcome::AuthFail,
            latency_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            fingerprint: None,
        });
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().expect("audit queue lock").len()
    }

    fn drain(&self, max: usize) -> Vec<AuditRecord> {
        let mut queue = self.inner.queue.lock().expect("audit queue lock");
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }
}

/// Spawn the single writer task draining the queue into the sinks.
pub fn spawn_writer(
    recorder: AuditRecorder,
    config: AuditConfig,
    db: Option<Arc<dyn PersistenceLayer>>,
    shutdown: CancellationToken,
) {
    let db = if config.sink.wants_db() { db } else { None };
    let file_path = if config.sink.wants_file() {
        config.file_path.clone()
    } else {
        None
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let mut flush = true;
            let mut shutting_down = false;
            tokio::select! {
                () = shutdown.cancelled() => shutting_down = true,
                _ = ticker.tick() => {}
                () = recorder.inner.notify.notified() => {
                    // A full batch flushes immediately; otherwise wait out
                    // the interval.
                    flush = recorder.queue_depth() >= config.batch_max;
                }
            }
            if flush || shutting_down {
                loop {
                    let batch = recorder.drain(config.batch_max);
                    if batch.is_empty() {
                        break;
                    }
                    write_batch(&batch, db.as_deref(), file_path.as_deref()).await;
                }
            }
            if shutting_down {
                break;
            }
        }
    });
}

async fn write_batch(
    batch: &[AuditRecord],
    db: Option<&dyn PersistenceLayer>,
    file_path: Option<&std::path::Path>,
) {
    if let Some(db) = db {
        if let Err(err) = db.insert_audit_batch(batch).await {
            tracing::error!(error = %err, records = batch.len(), "audit db write failed");
        }
    }
    if let Some(path) = file_path {
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                let mut buf = String::new();
                for record in batch {
                    if let Ok(line) = serde_json::to_string(record) {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
                if let Err(err) = file.write_all(buf.as_bytes()).await {
                    tracing::error!(error = %err, "audit file write failed");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "audit file open failed");
            }
        }
    }
}

/// Per-request audit bookkeeping.
///
/// A ticket is opened once the request is accepted (parsed past auth) and
/// must produce exactly one record. Finalizing writes the record; dropping an
/// unfinalized ticket writes it as a client cancellation, which also covers
/// mid-stream disconnects.
#[derive(Debug)]
pub struct AuditTicket {
    recorder: AuditRecorder,
    started: Instant,
    user_id: String,
    org_id: String,
    auth_method: AuthMethod,
    fingerprint: String,
    agent: Option<String>,
    tokens_in: u32,
    tokens_out: u32,
    finalized: bool,
}

impl AuditTicket {
    pub fn open(recorder: AuditRecorder, identity: &CallerIdentity, fingerprint: String) -> Self {
        Self {
            recorder,
            started: Instant::now(),
            user_id: identity.user_id.clone(),
            org_id: identity.org_id.clone(),
            auth_method: identity.auth_method,
            fingerprint,
            agent: None,
            tokens_in: 0,
            tokens_out: 0,
            finalized: false,
        }
    }

    pub fn set_agent(&mut self, agent: &str) {
        self.agent = Some(agent.to_owned());
    }

    pub fn set_tokens(&mut self, tokens_in: u32, tokens_out: u32) {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
    }

    pub fn finalize(mut self, outcome: Outcome) {
        self.emit(outcome);
    }

    fn emit(&mut self, outcome: Outcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        metrics::counter!("gateway_requests_total", "outcome" => outcome.as_str()).increment(1);
        self.recorder.record(AuditRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            user_id: Some(self.user_id.clone()),
            org_id: Some(self.org_id.clone()),
            auth_method: Some(self.auth_method),
            agent: self.agent.clone(),
            outcome,
            latency_ms: self.started.elapsed().as_millis() as u64,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            fingerprint: Some(self.fingerprint.clone()),
        });
    }
}

impl Drop for AuditTicket {
    fn drop(&mut self) {
        self.emit(Outcome::ClientCancel);
    }
}
