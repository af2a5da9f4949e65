//! One [`AgentInstance`] per agent subprocess.
//!
//! The executor owns the child process and its IO. Three background workers
//! run per instance: a stdout reader that parses framed output, a stderr
//! drain that keeps the last 64 KiB for diagnostics, and a waiter that
//! observes exit. Requests are written to stdin by a single writer task, so
//! stdin is never interleaved.
//!
//! Polite shutdown closes stdin first (agents must exit within their grace
//! period on stdin close), then hard-kills.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::framing::{
    Banner, MAX_FRAME_BYTES, RequestFrame, ReplyFrame, SseLine, parse_banner, parse_reply_line,
    parse_sse_line,
};
use super::{AgentEvent, AgentSpec, AgentState, Transport};

const STDERR_TAIL_BYTES: usize = 64 * 1024;
const DEGRADED_AFTER_FAILURES: u32 = 3;
const DEAD_AFTER_FAILURES: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Concurrency admission happens before `invoke` via the semaphore
    /// permits, so the only pre-IO failure left is an unusable instance.
    #[error("agent is not ready")]
    NotReady,
    #[error("agent io error: {0}")]
    Io(String),
}

/// An in-flight invocation: a stream of [`AgentEvent`]s plus the guard that
/// releases the concurrency slot and cancels the agent-side work on drop.
#[derive(Debug)]
pub struct Invocation {
    receiver: mpsc::UnboundedReceiver<AgentEvent>,
    guard: InvokeGuard,
}

impl Invocation {
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.receiver.recv().await
    }

    /// Mark the invocation cleanly finished so dropping the guard does not
    /// send a cancel frame to the agent.
    pub fn mark_finished(&self) {
        self.guard.finished.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct InvokeGuard {
    shared: Arc<Shared>,
    correlation_id: String,
    transport: Transport,
    finished: Arc<AtomicBool>,
    invocation_cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InvokeGuard {
    fn drop(&mut self) {
        self.invocation_cancel.cancel();
        if self.transport == Transport::StdioJsonlines {
            let had_entry = {
                let mut pending = self.shared.pending.lock().expect("pending lock");
                pending.remove(&self.correlation_id).is_some()
            };
            if had_entry && !self.finished.load(Ordering::SeqCst) {
                let line = RequestFrame::cancel(&self.correlation_id).to_line();
                let _ = self.shared.writer_tx.send(line);
            }
        }
        // For chunk transports the session is released by the stdout reader
        // once the agent emits its terminator; events simply stop being
        // observed here.
    }
}

struct ChunkSession {
    tx: mpsc::UnboundedSender<AgentEvent>,
    _session: OwnedMutexGuard<()>,
}

struct Shared {
    spec: Arc<AgentSpec>,
    state: StdMutex<AgentState>,
    consecutive_failures: AtomicU32,
    last_health_ok: StdMutex<Option<Instant>>,
    pid: Option<u32>,
    in_flight: Arc<Semaphore>,
    writer_tx: mpsc::UnboundedSender<String>,
    pending: StdMutex<HashMap<String, mpsc::UnboundedSender<AgentEvent>>>,
    chunk_lock: Arc<Mutex<()>>,
    chunk_active: StdMutex<Option<ChunkSession>>,
    stderr_tail: StdMutex<VecDeque<u8>>,
    banner_ready: AtomicBool,
    http_port: watch::Sender<Option<u16>>,
    exited: watch::Sender<bool>,
    shutdown: CancellationToken,
    kill: CancellationToken,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("agent", &self.spec.name)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Handle to one running agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentInstance {
    shared: Arc<Shared>,
}

impl AgentInstance {
    /// Spawn the subprocess and its IO workers. The instance starts in
    /// `spawning`; call [`AgentInstance::wait_ready`] to drive it to `ready`.
    pub async fn spawn(
        spec: Arc<AgentSpec>,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&spec.binary_path);
        cmd.args(&spec.argv)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("failed to spawn agent '{}' from {:?}: {e}", spec.name, spec.binary_path)
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent '{}' missing stdin pipe", spec.name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent '{}' missing stdout pipe", spec.name))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent '{}' missing stderr pipe", spec.name))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        let (http_port_tx, _) = watch::channel(None);
        let (exited_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: StdMutex::new(AgentState::Spawning),
            consecutive_failures: AtomicU32::new(0),
            last_health_ok: StdMutex::new(None),
            pid: child.id(),
            in_flight: Arc::new(Semaphore::new(spec.max_concurrent_invocations)),
            writer_tx,
            pending: StdMutex::new(HashMap::new()),
            chunk_lock: Arc::new(Mutex::new(())),
            chunk_active: StdMutex::new(None),
            stderr_tail: StdMutex::new(VecDeque::new()),
            banner_ready: AtomicBool::new(false),
            http_port: http_port_tx,
            exited: exited_tx,
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
            http_client: reqwest::Client::new(),
            spec: Arc::clone(&spec),
        });

        tracing::info!(agent = %spec.name, pid = ?shared.pid, "agent spawned");

        // Writer: one task owns stdin. Closing it (via the shutdown token)
        // is the polite termination signal.
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut stdin = stdin;
                let mut rx = writer_rx;
                loop {
                    tokio::select! {
                        () = shared.shutdown.cancelled() => break,
                        line = rx.recv() => {
                            let Some(line) = line else { break };
                            if stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                            if stdin.write_all(b"\n").await.is_err() {
                                break;
                            }
                            let _ = stdin.flush().await;
                        }
                    }
                }
                // stdin drops here, closing the agent's input.
            });
        }

        // Stdout reader: parses banners and framed output. The codec's max
        // line length enforces the frame cap at read time.
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut lines =
                    FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
                let mut first_line = true;
                while let Some(read) = lines.next().await {
                    let line = match read {
                        Ok(line) => line,
                        Err(LinesCodecError::MaxLineLengthExceeded) => {
                            tracing::warn!(agent = %shared.spec.name, "oversized frame on agent stdout");
                            shared.note_framing_error();
                            continue;
                        }
                        Err(LinesCodecError::Io(_)) => break,
                    };
                    if first_line {
                        first_line = false;
                        if let Some(banner) = parse_banner(&line) {
                            shared.note_banner(banner);
                            continue;
                        }
                    } else if let Some(banner @ Banner::Listen { .. }) = parse_banner(&line) {
                        // Port announcements are honored whenever they appear.
                        shared.note_banner(banner);
                        continue;
                    }
                    shared.route_stdout_line(&line);
                }
            });
        }

        // Stderr drain: keep the last N KiB for diagnostics.
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut tail = shared.stderr_tail.lock().expect("stderr lock");
                    tail.extend(&buf[..n]);
                    while tail.len() > STDERR_TAIL_BYTES {
                        tail.pop_front();
                    }
                }
            });
        }

        // Waiter: observes exit, fails outstanding invocations, reports up.
        {
            let shared = Arc::clone(&shared);
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut kill_requested = false;
                let status = loop {
                    if kill_requested {
                        let _ = child.start_kill();
                        break child.wait().await;
                    }
                    tokio::select! {
                        status = child.wait() => break status,
                        () = shared.kill.cancelled() => {
                            kill_requested = true;
                        }
                    }
                };
                tracing::warn!(agent = %name, status = ?status.as_ref().ok(), "agent subprocess exited");
                shared.set_state(AgentState::Dead);
                shared.fail_all_pending("agent subprocess exited");
                let _ = shared.exited.send(true);
                let _ = exit_tx.send(name);
            });
        }

        Ok(Self { shared })
    }

    pub fn spec(&self) -> &Arc<AgentSpec> {
        &self.shared.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Current state; `ready` is reported as `busy` while the concurrency
    /// limit is saturated.
    pub fn state(&self) -> AgentState {
        let stored = *self.shared.state.lock().expect("state lock");
        if stored == AgentState::Ready && self.shared.in_flight.available_permits() == 0 {
            AgentState::Busy
        } else {
            stored
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .spec
            .max_concurrent_invocations
            .saturating_sub(self.shared.in_flight.available_permits())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_health_ok(&self) -> Option<Instant> {
        *self.shared.last_health_ok.lock().expect("health lock")
    }

    pub fn is_alive(&self) -> bool {
        !*self.shared.exited.subscribe().borrow()
    }

    pub fn stderr_tail(&self) -> String {
        let tail = self.shared.stderr_tail.lock().expect("stderr lock");
        String::from_utf8_lossy(&tail.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    /// Drive `spawning -> ready`: succeed on the first successful health
    /// probe (or READY banner) within the configured startup timeout.
    pub async fn wait_ready(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.shared.spec.startup_timeout;
        loop {
            if !self.is_alive() {
                anyhow::bail!(
                    "agent '{}' exited during startup; stderr tail: {}",
                    self.shared.spec.name,
                    self.stderr_tail()
                );
            }
            if self.shared.banner_ready.load(Ordering::SeqCst)
                || self.health(Duration::from_secs(1)).await.is_ok()
            {
                self.shared.mark_healthy();
                self.shared.set_state(AgentState::Ready);
                tracing::info!(agent = %self.shared.spec.name, "agent ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "agent '{}' did not become ready within {:?}",
                    self.shared.spec.name,
                    self.shared.spec.startup_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Probe the agent. A success refreshes `last_health_ok` and restores a
    /// degraded instance to ready.
    pub async fn health(&self, timeout: Duration) -> anyhow::Result<()> {
        if !self.is_alive() {
            anyhow::bail!("agent '{}' is not running", self.shared.spec.name);
        }
        match self.shared.spec.transport {
            Transport::StdioJsonlines => {
                let id = format!("health-{}", Uuid::new_v4());
                let (tx, mut rx) = mpsc::unbounded_channel();
                self.shared
                    .pending
                    .lock()
                    .expect("pending lock")
                    .insert(id.clone(), tx);
                let sent = self
                    .shared
                    .writer_tx
                    .send(RequestFrame::ping(&id).to_line())
                    .is_ok();
                let result = if sent {
                    tokio::time::timeout(timeout, rx.recv())
                        .await
                        .map_err(|_| anyhow::anyhow!("health probe timed out"))
                        .and_then(|reply| {
                            reply.map(|_| ()).ok_or_else(|| anyhow::anyhow!("probe channel closed"))
                        })
                } else {
                    Err(anyhow::anyhow!("agent stdin closed"))
                };
                self.shared.pending.lock().expect("pending lock").remove(&id);
                result?;
            }
            Transport::StdioOpenaiChunks => {
                // No in-band probe exists for this framing; a live process
                // that produced its banner is considered healthy.
                if !self.is_alive() {
                    anyhow::bail!("agent '{}' is not running", self.shared.spec.name);
                }
            }
            Transport::HttpLocal => {
                let port = (*self.shared.http_port.subscribe().borrow())
                    .ok_or_else(|| anyhow::anyhow!("agent has not announced its port yet"))?;
                let url = format!("http://127.0.0.1:{port}/health");
                // Reaching the socket is what matters; any HTTP status counts.
                tokio::time::timeout(timeout, self.shared.http_client.get(&url).send())
                    .await
                    .map_err(|_| anyhow::anyhow!("health probe timed out"))??;
            }
        }
        self.shared.mark_healthy();
        Ok(())
    }

    /// Try to take a concurrency slot without waiting.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.shared.in_flight).try_acquire_owned().ok()
    }

    /// Wait up to `timeout` for a concurrency slot.
    pub async fn admit_within(&self, timeout: Duration) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(timeout, Arc::clone(&self.shared.in_flight).acquire_owned())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// Start an invocation using a previously acquired slot.
    pub async fn invoke(
        &self,
        correlation_id: String,
        model: &str,
        body: serde_json::Value,
        stream: bool,
        permit: OwnedSemaphorePermit,
    ) -> Result<Invocation, InvokeError> {
        match self.state() {
            AgentState::Ready | AgentState::Busy | AgentState::Degraded => {}
            AgentState::Spawning | AgentState::Dead => return Err(InvokeError::NotReady),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let invocation_cancel = CancellationToken::new();

        match self.shared.spec.transport {
            Transport::StdioJsonlines => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending lock")
                    .insert(correlation_id.clone(), tx);
                let line = RequestFrame::chat(&correlation_id, model, &body).to_line();
                if self.shared.writer_tx.send(line).is_err() {
                    self.shared
                        .pending
                        .lock()
                        .expect("pending lock")
                        .remove(&correlation_id);
                    return Err(InvokeError::Io("agent stdin closed".into()));
                }
            }
            Transport::StdioOpenaiChunks => {
                // No correlation ids on this framing: one invocation owns the
                // process output until the agent emits its terminator.
                let session = Arc::clone(&self.shared.chunk_lock).lock_owned().await;
                if !self.is_alive() {
                    return Err(InvokeError::NotReady);
                }
                *self.shared.chunk_active.lock().expect("chunk lock") = Some(ChunkSession {
                    tx,
                    _session: session,
                });
                let line = serde_json::to_string(&body)
                    .map_err(|e| InvokeError::Io(e.to_string()))?
                    .replace('\n', "");
                if self.shared.writer_tx.send(line).is_err() {
                    self.shared.chunk_active.lock().expect("chunk lock").take();
                    return Err(InvokeError::Io("agent stdin closed".into()));
                }
            }
            Transport::HttpLocal => {
                let port =
                    (*self.shared.http_port.subscribe().borrow()).ok_or(InvokeError::NotReady)?;
                let client = self.shared.http_client.clone();
                let cancel = invocation_cancel.clone();
                let url = format!("http://127.0.0.1:{port}/v1/chat/completions");
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = pump_http_invocation(client, url, body, stream, tx) => {}
                    }
                });
            }
        }

        Ok(Invocation {
            receiver: rx,
            guard: InvokeGuard {
                shared: Arc::clone(&self.shared),
                correlation_id,
                transport: self.shared.spec.transport,
                finished,
                invocation_cancel,
                _permit: permit,
            },
        })
    }

    /// Record an invocation-level success (resets the failure streak).
    pub fn note_invoke_success(&self) {
        self.shared.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Record an invocation-level failure; repeated failures degrade and
    /// eventually kill the instance.
    pub fn note_invoke_failure(&self) {
        self.shared.note_failure();
    }

    /// Advisory: mark degraded (health monitor decision).
    pub fn mark_degraded(&self) {
        let mut state = self.shared.state.lock().expect("state lock");
        if matches!(*state, AgentState::Ready) {
            *state = AgentState::Degraded;
            tracing::warn!(agent = %self.shared.spec.name, "agent degraded");
        }
    }

    /// Close stdin, wait `grace` for a voluntary exit, then hard-kill.
    pub async fn stop(&self, grace: Duration) {
        self.shared.shutdown.cancel();
        if self.wait_exited(grace).await {
            return;
        }
        tracing::warn!(agent = %self.shared.spec.name, "agent ignored stdin close, killing");
        self.shared.kill.cancel();
        let _ = self.wait_exited(Duration::from_secs(5)).await;
    }

    /// Wait for the waiter task to observe exit.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.exited.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }
}

impl Shared {
    fn set_state(&self, next: AgentState) {
        let mut state = self.state.lock().expect("state lock");
        if *state != AgentState::Dead {
            *state = next;
        }
    }

    fn mark_healthy(&self) {
        *self.last_health_ok.lock().expect("health lock") = Some(Instant::now());
        let mut state = self.state.lock().expect("state lock");
        if *state == AgentState::Degraded {
            *state = AgentState::Ready;
            tracing::info!(agent = %self.spec.name, "agent recovered");
        }
    }

    fn note_banner(&self, banner: Banner) {
        match banner {
            Banner::Ready { name, version } => {
                tracing::info!(agent = %self.spec.name, banner_name = %name, banner_version = %version, "agent banner");
                self.banner_ready.store(true, Ordering::SeqCst);
                *self.last_health_ok.lock().expect("health lock") = Some(Instant::now());
            }
            Banner::Listen { port } => {
                tracing::info!(agent = %self.spec.name, port, "agent announced loopback port");
                let _ = self.http_port.send(Some(port));
                self.banner_ready.store(true, Ordering::SeqCst);
            }
        }
    }

    fn route_stdout_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match self.spec.transport {
            Transport::StdioJsonlines => match parse_reply_line(line) {
                Ok(frame) => self.route_reply(frame),
                Err(err) => {
                    tracing::warn!(agent = %self.spec.name, error = %err, "framing error on agent stdout");
                    self.note_framing_error();
                }
            },
            Transport::StdioOpenaiChunks => match parse_sse_line(line) {
                Ok(SseLine::Data(value)) => {
                    if let Some(session) = &*self.chunk_active.lock().expect("chunk lock") {
                        let _ = session.tx.send(AgentEvent::Chunk(value));
                    }
                }
                Ok(SseLine::Done) => {
                    if let Some(session) = self.chunk_active.lock().expect("chunk lock").take() {
                        let _ = session.tx.send(AgentEvent::Done {
                            finish_reason: None,
                            usage: None,
                        });
                    }
                }
                Ok(SseLine::Ignored) => {}
                Err(err) => {
                    tracing::warn!(agent = %self.spec.name, error = %err, "framing error on agent stdout");
                    self.note_framing_error();
                    if let Some(session) = self.chunk_active.lock().expect("chunk lock").take() {
                        let _ = session.tx.send(AgentEvent::Failed {
                            message: format!("framing error: {err}"),
                        });
                    }
                }
            },
            Transport::HttpLocal => {
                tracing::debug!(agent = %self.spec.name, line = %line, "agent stdout");
            }
        }
    }

    fn route_reply(&self, frame: ReplyFrame) {
        let pending = self.pending.lock().expect("pending lock");
        let Some(tx) = pending.get(&frame.id) else {
            tracing::debug!(agent = %self.spec.name, id = %frame.id, "reply for unknown correlation id");
            return;
        };
        if let Some(message) = frame.error {
            let _ = tx.send(AgentEvent::Failed { message });
            return;
        }
        if let Some(delta) = frame.delta {
            let _ = tx.send(AgentEvent::Delta { content: delta });
        } else if let Some(content) = frame.content {
            let _ = tx.send(AgentEvent::Delta { content });
        }
        if frame.is_final {
            let _ = tx.send(AgentEvent::Done {
                finish_reason: frame.finish_reason,
                usage: frame.usage.map(Into::into),
            });
        }
    }

    fn note_framing_error(&self) {
        // A framing error can only be attributed when a single invocation is
        // outstanding; either way it counts against the agent.
        let single = {
            let pending = self.pending.lock().expect("pending lock");
            if pending.len() == 1 {
                pending.values().next().cloned()
            } else {
                None
            }
        };
        if let Some(tx) = single {
            let _ = tx.send(AgentEvent::Failed {
                message: "agent produced an unparseable frame".into(),
            });
        }
        self.note_failure();
    }

    fn note_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().expect("state lock");
        match *state {
            AgentState::Ready if count >= DEGRADED_AFTER_FAILURES => {
                *state = AgentState::Degraded;
                tracing::warn!(agent = %self.spec.name, failures = count, "agent degraded");
            }
            AgentState::Degraded if count >= DEAD_AFTER_FAILURES => {
                drop(state);
                tracing::error!(agent = %self.spec.name, failures = count, "agent failing persistently, killing");
                self.kill.cancel();
            }
            _ => {}
        }
    }

    fn fail_all_pending(&self, message: &str) {
        let entries: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        for (_, tx) in entries {
            let _ = tx.send(AgentEvent::Failed {
                message: message.to_owned(),
            });
        }
        if let Some(session) = self.chunk_active.lock().expect("chunk lock").take() {
            let _ = session.tx.send(AgentEvent::Failed {
                message: message.to_owned(),
            });
        }
    }
}

/// Drive one `http_local` invocation and forward its output as events.
async fn pump_http_invocation(
    client: reqwest::Client,
    url: String,
    body: serde_json::Value,
    stream: bool,
    tx: mpsc::UnboundedSender<AgentEvent>,
) {
    let response = match client.post(&url).json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(AgentEvent::Failed {
                message: format!("agent http request failed: {e}"),
            });
            return;
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let _ = tx.send(AgentEvent::Failed {
            message: format!("agent returned {status}: {text}"),
        });
        return;
    }

    if stream {
        let mut buf = String::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let Ok(chunk) = chunk else {
                let _ = tx.send(AgentEvent::Failed {
                    message: "agent stream interrupted".into(),
                });
                return;
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_owned();
                buf.drain(..=pos);
                match parse_sse_line(&line) {
                    Ok(SseLine::Data(value)) => {
                        let _ = tx.send(AgentEvent::Chunk(value));
                    }
                    Ok(SseLine::Done) => {
                        let _ = tx.send(AgentEvent::Done {
                            finish_reason: None,
                            usage: None,
                        });
                        return;
                    }
                    Ok(SseLine::Ignored) => {}
                    Err(err) => {
                        let _ = tx.send(AgentEvent::Failed {
                            message: format!("framing error: {err}"),
                        });
                        return;
                    }
                }
            }
        }
        // Stream ended without a terminator.
        let _ = tx.send(AgentEvent::Done {
            finish_reason: None,
            usage: None,
        });
    } else {
        match response.json::<serde_json::Value>().await {
            Ok(value) => {
                let _ = tx.send(AgentEvent::Completion(value));
                let _ = tx.send(AgentEvent::Done {
                    finish_reason: None,
                    usage: None,
                });
            }
            Err(e) => {
                let _ = tx.send(AgentEvent::Failed {
                    message: format!("agent returned unparseable completion: {e}"),
                });
            }
        }
    }
}
