//! Layered gateway configuration.
//!
//! Priority, lowest to highest: built-in defaults, an optional YAML config
//! file (`CONFIG_FILE`, `./config.yaml`), `GW_`-prefixed environment
//! variables (`GW_SERVER__PORT=8081`), the bare environment names the
//! deployment contract uses (`PORT`, `AUTH_STATIC_KEY`, ...), and finally
//! CLI flags. Agent definitions are dynamic (`AGENT_<N>_*`) and parsed
//! separately from the process environment.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::agent::breaker::BreakerConfig;
use crate::agent::health::HealthMonitorConfig;
use crate::agent::orchestrator::OrchestratorConfig;
use crate::agent::{AgentSpec, Transport};
use crate::audit::{AuditConfig, AuditSinkKind};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Postgres connection string for keys, admins, and audit
    #[arg(long, env = "DB_URL")]
    pub db_url: Option<String>,

    /// Enable fail-over across agents
    #[arg(long, env = "FAILOVER_ENABLED")]
    pub failover_enabled: Option<bool>,

    /// Audit sink: db, file, both, or none
    #[arg(long, env = "AUDIT_SINK")]
    pub audit_sink: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    pub limits: LimitsConfig,
    pub resilience: ResilienceConfig,
    pub audit: AuditSettings,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub metrics_enabled: bool,
    pub cors_enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub static_key: Option<String>,
    #[serde(default)]
    pub static_user_id: Option<String>,
    #[serde(default)]
    pub static_org_id: Option<String>,
    #[serde(default)]
    pub static_email: Option<String>,
    #[serde(default)]
    pub static_name: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default)]
    pub jwt_default_org: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub request_timeout_ms: u64,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    pub breaker_failure_threshold: usize,
    pub breaker_open_ms: u64,
    pub admission_queue_timeout_ms: u64,
    pub failover_enabled: bool,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditSettings {
    /// db | file | both | none; empty string picks db when a database is
    /// configured, none otherwise.
    pub sink: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        if env::var("GW_TEST_MODE").is_ok() {
            Self::load_from_args(vec!["switchboard".to_owned()])
        } else {
            Self::load_from_args(env::args())
        }
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse CLI args: {e}");
            Cli {
                config: None,
                port: None,
                db_url: None,
                failover_enabled: None,
                audit_sink: None,
            }
        });

        let mut builder = Config::builder()
            .set_default("server.port", 8080)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.metrics_enabled", true)?
            .set_default("server.cors_enabled", false)?
            .set_default("limits.rate_limit_rpm", 60)?
            .set_default("limits.rate_limit_burst", 10)?
            .set_default("limits.request_timeout_ms", 120_000)?
            .set_default("limits.body_limit_bytes", 1_048_576)?
            .set_default("resilience.breaker_failure_threshold", 5)?
            .set_default("resilience.breaker_open_ms", 30_000)?
            .set_default("resilience.admission_queue_timeout_ms", 500)?
            .set_default("resilience.failover_enabled", true)?
            .set_default("resilience.health_interval_ms", 30_000)?
            .set_default("resilience.health_timeout_ms", 5_000)?
            .set_default("audit.sink", "")?
            .set_default("audit.queue_capacity", 4096)?;

        let explicit_config = cli.config.clone().or_else(|| env::var("CONFIG_FILE").ok());
        let config_path = explicit_config.or_else(|| {
            std::path::Path::new("config.yaml")
                .exists()
                .then(|| "config.yaml".to_owned())
        });
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(&path));
        }

        builder = builder.add_source(
            Environment::with_prefix("GW")
                .separator("__")
                .try_parsing(true),
        );

        // Bare environment names from the deployment contract.
        for (var, key) in [
            ("AUTH_STATIC_KEY", "auth.static_key"),
            ("AUTH_STATIC_USER_ID", "auth.static_user_id"),
            ("AUTH_STATIC_ORG_ID", "auth.static_org_id"),
            ("AUTH_STATIC_EMAIL", "auth.static_email"),
            ("AUTH_STATIC_NAME", "auth.static_name"),
            ("AUTH_JWKS_URL", "auth.jwks_url"),
            ("AUTH_JWT_ISSUER", "auth.jwt_issuer"),
            ("AUTH_JWT_DEFAULT_ORG", "auth.jwt_default_org"),
            ("DB_URL", "persistence.db_url"),
            ("REDIS_URL", "persistence.redis_url"),
            ("AUDIT_FILE_PATH", "audit.file_path"),
        ] {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }
        for (var, key) in [
            ("RATE_LIMIT_RPM", "limits.rate_limit_rpm"),
            ("RATE_LIMIT_BURST", "limits.rate_limit_burst"),
            ("REQUEST_TIMEOUT_MS", "limits.request_timeout_ms"),
            (
                "BREAKER_FAILURE_THRESHOLD",
                "resilience.breaker_failure_threshold",
            ),
            ("BREAKER_OPEN_MS", "resilience.breaker_open_ms"),
        ] {
            if let Ok(value) = env::var(var) {
                if let Ok(parsed) = value.parse::<i64>() {
                    builder = builder.set_override(key, parsed)?;
                }
            }
        }

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(db_url) = cli.db_url {
            builder = builder.set_override("persistence.db_url", db_url)?;
        }
        if let Some(failover) = cli.failover_enabled {
            builder = builder.set_override("resilience.failover_enabled", failover)?;
        }
        if let Some(sink) = cli.audit_sink {
            builder = builder.set_override("audit.sink", sink)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.request_timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.resilience.breaker_failure_threshold,
            open_for: Duration::from_millis(self.resilience.breaker_open_ms),
            ..BreakerConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            failover_enabled: self.resilience.failover_enabled,
            admission_queue_timeout: Duration::from_millis(
                self.resilience.admission_queue_timeout_ms,
            ),
            breaker: self.breaker_config(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn health_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_millis(self.resilience.health_interval_ms),
            probe_timeout: Duration::from_millis(self.resilience.health_timeout_ms),
            ..HealthMonitorConfig::default()
        }
    }

    pub fn audit_config(&self) -> AuditConfig {
        let sink = match AuditSinkKind::parse(&self.audit.sink) {
            Some(sink) => sink,
            None if self.persistence.db_url.is_some() => AuditSinkKind::Db,
            None => AuditSinkKind::None,
        };
        AuditConfig {
            sink,
            file_path: self.audit.file_path.clone().map(Into::into),
            queue_capacity: self.audit.queue_capacity,
            ..AuditConfig::default()
        }
    }

    /// Model alias map: config-file entries plus `MODEL_ALIASES`
    /// (`alias=canonical,alias2=canonical2`).
    pub fn model_aliases(&self) -> HashMap<String, String> {
        let mut aliases = self.agents.model_aliases.clone();
        if let Ok(raw) = env::var("MODEL_ALIASES") {
            aliases.extend(parse_model_aliases(&raw));
        }
        aliases
    }

    /// Agent specs from the process environment (`AGENT_<N>_*`).
    pub fn agent_specs(&self) -> Vec<AgentSpec> {
        agent_specs_from_vars(&env::vars().collect())
    }
}

pub fn parse_model_aliases(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (alias, canonical) = pair.split_once('=')?;
            let alias = alias.trim();
            let canonical = canonical.trim();
            (!alias.is_empty() && !canonical.is_empty())
                .then(|| (alias.to_owned(), canonical.to_owned()))
        })
        .collect()
}

/// Parse `AGENT_<N>_NAME`, `_PATH`, `_ARGS`, `_TRANSPORT`, `_MODELS`,
/// `_MAX_CONCURRENT`, `_PRIMARY`, `_WORKDIR`, `_STARTUP_TIMEOUT_MS`, and
/// `_ENV_<KEY>` passthrough variables into agent specs. Incomplete
/// definitions are skipped with a log line rather than failing startup.
pub fn agent_specs_from_vars(vars: &BTreeMap<String, String>) -> Vec<AgentSpec> {
    let mut specs: Vec<AgentSpec> = Vec::new();
    for n in 0..=99u32 {
        let prefix = format!("AGENT_{n}_");
        let Some(name) = vars.get(&format!("{prefix}NAME")) else {
            continue;
        };
        let Some(path) = vars.get(&format!("{prefix}PATH")) else {
            tracing::error!(agent = %name, index = n, "agent PATH missing, skipping definition");
            continue;
        };
        if specs.iter().any(|s| &s.name == name) {
            tracing::error!(agent = %name, "duplicate agent name, keeping the first definition");
            continue;
        }

        let argv = vars
            .get(&format!("{prefix}ARGS"))
            .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        let transport = vars
            .get(&format!("{prefix}TRANSPORT"))
            .and_then(|raw| Transport::parse(raw))
            .unwrap_or(Transport::StdioJsonlines);
        let models_advertised: BTreeSet<String> = vars
            .get(&format!("{prefix}MODELS"))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let max_concurrent_invocations = vars
            .get(&format!("{prefix}MAX_CONCURRENT"))
            .and_then(|raw| raw.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(4);
        let primary = vars
            .get(&format!("{prefix}PRIMARY"))
            .is_some_and(|raw| matches!(raw.trim(), "1" | "true" | "TRUE" | "yes"));
        let startup_timeout = vars
            .get(&format!("{prefix}STARTUP_TIMEOUT_MS"))
            .and_then(|raw| raw.parse().ok())
            .map_or(Duration::from_secs(10), Duration::from_millis);
        let working_dir = vars.get(&format!("{prefix}WORKDIR")).map(Into::into);

        let env_prefix = format!("{prefix}ENV_");
        let env: HashMap<String, String> = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&env_prefix)
                    .map(|name| (name.to_owned(), value.clone()))
            })
            .collect();

        specs.push(AgentSpec {
            name: name.clone(),
            binary_path: path.into(),
            argv,
            env,
            working_dir,
            transport,
            startup_timeout,
            max_concurrent_invocations,
            models_advertised,
            primary,
        });
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parses_a_full_agent_definition() {
        let specs = agent_specs_from_vars(&vars(&[
            ("AGENT_0_NAME", "codex"),
            ("AGENT_0_PATH", "/usr/local/bin/codex-agent"),
            ("AGENT_0_ARGS", "--mode serve --quiet"),
            ("AGENT_0_TRANSPORT", "stdio_jsonlines"),
            ("AGENT_0_MODELS", "gpt-x, gpt-x-mini"),
            ("AGENT_0_MAX_CONCURRENT", "8"),
            ("AGENT_0_PRIMARY", "true"),
            ("AGENT_0_ENV_API_MODE", "local"),
            ("AGENT_0_STARTUP_TIMEOUT_MS", "2500"),
        ]));
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "codex");
        assert_eq!(spec.argv, vec!["--mode", "serve", "--quiet"]);
        assert_eq!(spec.transport, Transport::StdioJsonlines);
        assert!(spec.models_advertised.contains("gpt-x-mini"));
        assert_eq!(spec.max_concurrent_invocations, 8);
        assert!(spec.primary);
        assert_eq!(spec.env.get("API_MODE").map(String::as_str), Some("local"));
        assert_eq!(spec.startup_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn skips_incomplete_and_duplicate_definitions() {
        let specs = agent_specs_from_vars(&vars(&[
            ("AGENT_0_NAME", "a"),
            ("AGENT_0_PATH", "/bin/a"),
            ("AGENT_1_NAME", "missing-path"),
            ("AGENT_2_NAME", "a"),
            ("AGENT_2_PATH", "/bin/other"),
        ]));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].binary_path, std::path::PathBuf::from("/bin/a"));
    }

    #[test]
    fn defaults_apply_for_optional_fields() {
        let specs = agent_specs_from_vars(&vars(&[
            ("AGENT_3_NAME", "sparse"),
            ("AGENT_3_PATH", "/bin/sparse"),
        ]));
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.transport, Transport::StdioJsonlines);
        assert_eq!(spec.max_concurrent_invocations, 4);
        assert!(!spec.primary);
        assert!(spec.models_advertised.is_empty());
        assert_eq!(spec.startup_timeout, Duration::from_secs(10));
    }

    #[test]
    fn model_alias_string_parses() {
        let aliases = parse_model_aliases("gpt-x-latest=gpt-x, fast =mini-model,broken");
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases["gpt-x-latest"], "gpt-x");
        assert_eq!(aliases["fast"], "mini-model");
    }
}
