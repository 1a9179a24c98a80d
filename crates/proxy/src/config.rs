//! Destination registry and process settings.
//!
//! Destinations load once at startup from a YAML file and are immutable for
//! the process lifetime. Validation is fail-fast: a bad entry aborts startup
//! rather than surfacing at request time.

use crate::error::ProxyError;
use palisade_scan::ScanPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Characters that indicate a shell-injection attempt (or a misconfigured
/// entry). Commands are tokenized without a shell, so none of these are ever
/// legitimate.
const SHELL_METACHARS: &[char] = &[';', '&', '|', '$', '<', '>', '(', ')', '`', '\n', '\r'];

/// Parent env vars a stdio subprocess may inherit. Secrets reach subprocesses
/// exclusively through per-destination env, never from the parent environment.
pub const SAFE_ENV_KEYS: &[&str] = &["PATH", "HOME", "USER", "LANG", "TMPDIR", "NPM_CONFIG_CACHE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Sse,
    StreamableHttp,
    Stdio,
}

/// One configured upstream, immutable after load.
#[derive(Debug, Clone)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
    /// Base URL for `sse`, full endpoint URL for `streamable_http`.
    pub url: Option<reqwest::Url>,
    /// Tokenized argv for `stdio`.
    pub argv: Vec<String>,
    /// Extra env for `stdio` subprocesses (config `env` block merged with the
    /// secrets file at spawn time).
    pub env: HashMap<String, String>,
    pub scan: ScanPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    /// Flat `name: url` shorthand for an SSE destination.
    Url(String),
    Table(RawDestination),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDestination {
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    url: Option<String>,
    command: Option<String>,
    #[serde(default)]
    env: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    scan: ScanPolicy,
}

fn default_kind() -> String {
    "sse".to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    destinations: HashMap<String, RawEntry>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_url(name: &str, raw: &str) -> Result<reqwest::Url, ProxyError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ProxyError::Config(format!(
            "destination '{name}' requires a non-empty 'url'"
        )));
    }
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| ProxyError::Config(format!("destination '{name}' has an invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::Config(format!(
            "destination '{name}' url must use http or https scheme, got '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

fn parse_command(name: &str, raw: &str) -> Result<Vec<String>, ProxyError> {
    let command = raw.trim();
    if command.is_empty() {
        return Err(ProxyError::Config(format!(
            "stdio destination '{name}' requires a non-empty 'command'"
        )));
    }
    if let Some(bad) = command.chars().find(|c| SHELL_METACHARS.contains(c)) {
        return Err(ProxyError::Config(format!(
            "destination '{name}' command contains disallowed character {bad:?}"
        )));
    }
    let argv = shlex::split(command).ok_or_else(|| {
        ProxyError::Config(format!("destination '{name}' command fails to tokenize"))
    })?;
    if argv.is_empty() {
        return Err(ProxyError::Config(format!(
            "stdio destination '{name}' has an empty command"
        )));
    }
    if which::which(&argv[0]).is_err() {
        return Err(ProxyError::Config(format!(
            "stdio destination '{name}': executable '{}' not found on PATH",
            argv[0]
        )));
    }
    Ok(argv)
}

fn coerce_env(name: &str, raw: HashMap<String, serde_yaml::Value>) -> Result<HashMap<String, String>, ProxyError> {
    // YAML-parsed ints and bools pass cleanly to subprocess env as strings.
    raw.into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                other => {
                    return Err(ProxyError::Config(format!(
                        "destination '{name}' env '{k}' must be a scalar, got {other:?}"
                    )));
                }
            };
            Ok((k, s))
        })
        .collect()
}

/// Immutable name → destination table.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, Arc<Destination>>,
}

impl Registry {
    /// Load and validate a destinations YAML file.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let bytes = std::fs::read(path).map_err(|e| {
            ProxyError::Config(format!("read destinations config {}: {e}", path.display()))
        })?;
        let raw: RawConfig = serde_yaml::from_slice(&bytes).map_err(|e| {
            ProxyError::Config(format!("parse destinations config {}: {e}", path.display()))
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ProxyError> {
        let mut by_name = HashMap::with_capacity(raw.destinations.len());
        for (name, entry) in raw.destinations {
            if !valid_name(&name) {
                return Err(ProxyError::Config(format!(
                    "destination name '{name}' must match [A-Za-z0-9_-]{{1,64}}"
                )));
            }
            let dest = match entry {
                RawEntry::Url(url) => Destination {
                    name: name.clone(),
                    kind: DestinationKind::Sse,
                    url: Some(parse_url(&name, &url)?),
                    argv: Vec::new(),
                    env: HashMap::new(),
                    scan: ScanPolicy::default(),
                },
                RawEntry::Table(table) => {
                    let env = coerce_env(&name, table.env)?;
                    match table.kind.as_str() {
                        "sse" => Destination {
                            name: name.clone(),
                            kind: DestinationKind::Sse,
                            url: Some(parse_url(&name, table.url.as_deref().unwrap_or_default())?),
                            argv: Vec::new(),
                            env,
                            scan: table.scan,
                        },
                        "streamable_http" => Destination {
                            name: name.clone(),
                            kind: DestinationKind::StreamableHttp,
                            url: Some(parse_url(&name, table.url.as_deref().unwrap_or_default())?),
                            argv: Vec::new(),
                            env,
                            scan: table.scan,
                        },
                        "stdio" => Destination {
                            name: name.clone(),
                            kind: DestinationKind::Stdio,
                            url: None,
                            argv: parse_command(&name, table.command.as_deref().unwrap_or_default())?,
                            env,
                            scan: table.scan,
                        },
                        other => {
                            return Err(ProxyError::Config(format!(
                                "destination '{name}' has unknown type '{other}' \
                                 (accepted: sse, stdio, streamable_http)"
                            )));
                        }
                    }
                }
            };
            by_name.insert(name, Arc::new(dest));
        }
        Ok(Self { by_name })
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<Destination>> {
        self.by_name.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Destination>> {
        self.by_name.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Per-destination secrets: `destination → {ENV: value}`. A missing file is
/// fine (no secrets configured yet); values are coerced to strings.
pub fn load_secrets(path: Option<&Path>) -> Result<HashMap<String, HashMap<String, String>>, ProxyError> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Config(format!("read secrets {}: {e}", path.display())))?;
    let raw: HashMap<String, HashMap<String, serde_yaml::Value>> = serde_yaml::from_slice(&bytes)
        .map_err(|e| ProxyError::Config(format!("parse secrets {}: {e}", path.display())))?;
    raw.into_iter()
        .map(|(dest, vars)| Ok((dest.clone(), coerce_env(&dest, vars)?)))
        .collect()
}

/// Build a subprocess environment: allowlisted parent vars, then destination
/// env, then secrets (later wins).
#[must_use]
pub fn subprocess_env(
    dest: &Destination,
    secrets: &HashMap<String, HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| SAFE_ENV_KEYS.contains(&k.as_str()))
        .collect();
    env.extend(dest.env.clone());
    if let Some(extra) = secrets.get(&dest.name) {
        env.extend(extra.clone());
    }
    env
}

/// Process-wide settings resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_file: PathBuf,
    pub audit_log_bodies: bool,
    pub max_stdio_connections: usize,
    pub max_body_bytes: usize,
    pub max_sessions: usize,
    pub rpc_response_timeout: Duration,
    pub ai_injection_threshold: f64,
    pub patterns_dir: PathBuf,
}

impl Settings {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            log_file: std::env::var_os("LOG_FILE")
                .map_or_else(|| PathBuf::from("/var/log/palisade/proxy.log"), PathBuf::from),
            audit_log_bodies: env_flag_default_true("AUDIT_LOG_BODIES"),
            max_stdio_connections: env_positive_usize("MAX_STDIO_CONNECTIONS").unwrap_or(10),
            max_body_bytes: env_positive_usize("MAX_BODY_BYTES").unwrap_or(32 * 1024),
            max_sessions: env_positive_usize("MAX_SESSIONS").unwrap_or(1024),
            rpc_response_timeout: Duration::from_secs(
                env_positive_usize("RPC_RESPONSE_TIMEOUT_SECONDS").unwrap_or(30) as u64,
            ),
            ai_injection_threshold: env_f64("AI_INJECTION_THRESHOLD").unwrap_or(0.85),
            patterns_dir: std::env::var_os("PATTERNS_DIR")
                .map_or_else(|| PathBuf::from("/etc/palisade/patterns.d"), PathBuf::from),
        }
    }
}

/// Boolean env var that defaults to true; only explicit falsy values disable.
fn env_flag_default_true(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => true,
    }
}

fn env_positive_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
}
