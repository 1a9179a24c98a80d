//! Request/response inspection for the proxy.
//!
//! Two engines share a four-mode policy (`off`, `monitor`, `redact`, `block`):
//! a deterministic regex engine loaded from flat pattern files, and an
//! optional semantic classifier behind the [`AiEngine`] trait. When both
//! engines trigger on the same body, the stricter mode wins.
//!
//! Pattern files are hot-reloadable; the proxy's admin plane calls
//! [`PatternSet::load_dir`] again and swaps the compiled set atomically.

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Replacement text substituted for redacted content.
pub const REDACTION_PLACEHOLDER: &str = "**REDACTED**";

/// What a destination wants done when an engine triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Off,
    Monitor,
    Redact,
    Block,
}

impl Mode {
    fn severity(self) -> u8 {
        match self {
            Mode::Off => 0,
            Mode::Monitor => 1,
            Mode::Redact => 2,
            Mode::Block => 3,
        }
    }
}

/// Which side of the proxied exchange a body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Per-destination scan settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanPolicy {
    #[serde(default)]
    pub regex_mode: Mode,
    #[serde(default)]
    pub ai_mode: Mode,
    /// Overrides the process-wide threshold when set.
    #[serde(default)]
    pub ai_threshold: Option<f64>,
    #[serde(default = "default_ai_max_chars")]
    pub ai_max_chars: usize,
}

fn default_ai_max_chars() -> usize {
    8192
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            regex_mode: Mode::Off,
            ai_mode: Mode::Off,
            ai_threshold: None,
            ai_max_chars: default_ai_max_chars(),
        }
    }
}

/// Outcome of scanning one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pass,
    Monitor,
    Redact,
    Block,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Pass => "pass",
            Action::Monitor => "monitor",
            Action::Redact => "redact",
            Action::Block => "block",
        }
    }
}

fn action_for(mode: Mode) -> Action {
    match mode {
        Mode::Off => Action::Pass,
        Mode::Monitor => Action::Monitor,
        Mode::Redact => Action::Redact,
        Mode::Block => Action::Block,
    }
}

/// Result of [`Scanner::scan`]. `body` is what should be forwarded: the
/// original text, or the substituted text when the action is `redact`.
#[derive(Debug, Clone)]
pub struct Detection {
    pub action: Action,
    pub engine: Option<&'static str>,
    pub detail: Option<String>,
    pub body: String,
}

impl Detection {
    fn pass(body: &str) -> Self {
        Self {
            action: Action::Pass,
            engine: None,
            detail: None,
            body: body.to_string(),
        }
    }
}

/// Semantic classifier seam. Implementations run inference off the async
/// runtime (`spawn_blocking` or a dedicated pool) and return an injection
/// confidence in `[0.0, 1.0]`.
#[async_trait::async_trait]
pub trait AiEngine: Send + Sync {
    async fn score(&self, text: &str) -> f64;
}

/// Compiled regex patterns, swappable under a read lock.
pub struct PatternSet {
    patterns: RwLock<Arc<Vec<Regex>>>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Load `*.txt` / `*.conf` files from `dir`, one pattern per line.
    ///
    /// Blank lines and `#` comments are skipped; patterns compile
    /// case-insensitively; invalid patterns are warned about and skipped. A
    /// missing directory clears the set and returns 0.
    ///
    /// Returns the number of compiled patterns now active.
    pub fn load_dir(&self, dir: &Path) -> usize {
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "patterns directory does not exist; regex engine has 0 patterns");
            *self.patterns.write() = Arc::new(Vec::new());
            return 0;
        }

        let mut files: Vec<_> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("txt" | "conf")
                    )
                })
                .collect(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read patterns directory");
                return self.patterns.read().len();
            }
        };
        files.sort();

        let mut compiled = Vec::new();
        for path in files {
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "cannot read pattern file");
                    continue;
                }
            };
            for (lineno, line) in text.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match RegexBuilder::new(trimmed).case_insensitive(true).build() {
                    Ok(re) => compiled.push(re),
                    Err(e) => {
                        tracing::warn!(
                            file = %path.display(),
                            line = lineno + 1,
                            pattern = trimmed,
                            error = %e,
                            "invalid regex pattern skipped"
                        );
                    }
                }
            }
        }

        let n = compiled.len();
        *self.patterns.write() = Arc::new(compiled);
        tracing::info!(count = n, dir = %dir.display(), "loaded regex patterns");
        n
    }

    /// Snapshot of the active set. Matching happens outside the lock.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Regex>> {
        self.patterns.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The scanner facade the proxy handlers call.
pub struct Scanner {
    patterns: PatternSet,
    ai: Option<Arc<dyn AiEngine>>,
    default_threshold: f64,
}

impl Scanner {
    #[must_use]
    pub fn new(default_threshold: f64) -> Self {
        Self {
            patterns: PatternSet::new(),
            ai: None,
            default_threshold,
        }
    }

    #[must_use]
    pub fn with_ai_engine(mut self, engine: Arc<dyn AiEngine>) -> Self {
        self.ai = Some(engine);
        self
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Reload patterns from `dir`; returns the active pattern count.
    pub fn reload(&self, dir: &Path) -> usize {
        self.patterns.load_dir(dir)
    }

    /// Scan `body` under `policy`. `_direction` does not change the engines
    /// today but is part of the hook contract so callers report which side
    /// triggered.
    pub async fn scan(&self, body: &str, policy: &ScanPolicy, _direction: Direction) -> Detection {
        if body.is_empty() || (policy.regex_mode == Mode::Off && policy.ai_mode == Mode::Off) {
            return Detection::pass(body);
        }

        let mut best_action = Action::Pass;
        let mut best_severity = 0u8;
        let mut best_engine: Option<&'static str> = None;
        let mut best_detail: Option<String> = None;
        let mut result_body = body.to_string();

        if policy.regex_mode != Mode::Off {
            let patterns = self.patterns.snapshot();
            // Stop on first match.
            if let Some(re) = patterns.iter().find(|re| re.is_match(body)) {
                let sev = policy.regex_mode.severity();
                if sev > best_severity {
                    best_action = action_for(policy.regex_mode);
                    best_severity = sev;
                    best_engine = Some("regex");
                    best_detail = Some(re.as_str().to_string());
                    if policy.regex_mode == Mode::Redact {
                        result_body = re.replace_all(body, REDACTION_PLACEHOLDER).into_owned();
                    }
                }
            }
        }

        if policy.ai_mode != Mode::Off && best_action != Action::Block {
            match &self.ai {
                None => {}
                Some(_) if body.len() > policy.ai_max_chars => {
                    tracing::warn!(
                        len = body.len(),
                        max = policy.ai_max_chars,
                        "ai scan skipped: body exceeds ai_max_chars"
                    );
                }
                Some(engine) => {
                    let score = engine.score(body).await;
                    let threshold = policy.ai_threshold.unwrap_or(self.default_threshold);
                    if score >= threshold {
                        let sev = policy.ai_mode.severity();
                        if sev > best_severity {
                            best_action = action_for(policy.ai_mode);
                            best_engine = Some("ai");
                            best_detail = Some(format!("score={score:.3}"));
                            if policy.ai_mode == Mode::Redact {
                                result_body = REDACTION_PLACEHOLDER.to_string();
                            }
                        }
                    }
                }
            }
        }

        match best_action {
            Action::Pass => Detection::pass(body),
            // A blocked body is never forwarded; hand the original back so
            // the caller can log length metadata without the substitution.
            Action::Block => Detection {
                action: Action::Block,
                engine: best_engine,
                detail: best_detail,
                body: body.to_string(),
            },
            action => Detection {
                action,
                engine: best_engine,
                detail: best_detail,
                body: result_body,
            },
        }
    }
}
