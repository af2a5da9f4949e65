//! Agent subprocess orchestration.
//!
//! An *agent* is a locally-spawned binary that executes chat completions.
//! This module owns the full lifecycle: spawning and supervising the
//! subprocess ([`executor`]), wire framing per transport ([`framing`]),
//! per-agent failure gating ([`breaker`]), candidate selection and fail-over
//! ([`orchestrator`]), and background liveness probing ([`health`]).

pub mod breaker;
pub mod executor;
pub mod framing;
pub mod health;
pub mod orchestrator;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// IO discipline used to talk to an agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// One JSON object per line both ways, matched by correlation id.
    StdioJsonlines,
    /// The agent emits OpenAI-shaped chunks verbatim as `data:` lines.
    StdioOpenaiChunks,
    /// The agent exposes a loopback HTTP endpoint announced on stdout.
    HttpLocal,
}

impl Transport {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio_jsonlines" | "jsonlines" => Some(Self::StdioJsonlines),
            "stdio_openai_chunks" | "openai_chunks" => Some(Self::StdioOpenaiChunks),
            "http_local" | "http" => Some(Self::HttpLocal),
            _ => None,
        }
    }
}

/// Static configuration for one agent, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent name across the running process.
    pub name: String,
    pub binary_path: PathBuf,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub transport: Transport,
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
    pub max_concurrent_invocations: usize,
    pub models_advertised: BTreeSet<String>,
    #[serde(default)]
    pub primary: bool,
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Runtime state of an [`executor::AgentInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawning,
    Ready,
    Busy,
    Degraded,
    Dead,
}

/// One unit of agent output, normalized across transports.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental content from a jsonlines agent.
    Delta { content: String },
    /// A verbatim OpenAI `chat.completion.chunk` object.
    Chunk(serde_json::Value),
    /// A complete OpenAI `chat.completion` object (non-streaming HTTP agents).
    Completion(serde_json::Value),
    /// The invocation finished cleanly.
    Done {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// The invocation failed; no further events follow.
    Failed { message: String },
}

/// Terminal classification of an invocation, as seen by the breaker.
///
/// Invocation failures (timeouts, subprocess errors, framing errors) count
/// against the agent; business outcomes from the model are successes; client
/// cancellations count as neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSignal {
    Success,
    Failure,
    Neutral,
}
