//! Arena configuration stored in `arena.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "arena.toml";

/// Arena configuration (TOML).
///
/// Intended to be edited by operators. Missing fields fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArenaConfig {
    pub orchestrator: OrchestratorConfig,
    pub sandbox: SandboxConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of simultaneously live matches.
    pub max_live_matches: usize,

    /// Time an admitted match waits for its agent before expiring.
    pub connect_timeout_secs: u64,

    /// Length of the betting window (only used with a wagering collaborator).
    pub betting_window_secs: u64,

    /// Countdown length; one `countdown_tick` is broadcast per second.
    pub countdown_secs: u32,

    /// Hard cap on an active match's wall-clock length.
    pub match_duration_secs: u64,

    /// Grace period after a disconnect before the agent forfeits.
    pub reconnect_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Per-invocation wall-clock deadline in milliseconds.
    pub deadline_ms: u64,

    /// Memory ceiling for one agent's data, in bytes.
    pub memory_limit_bytes: usize,

    /// Maximum nested function call depth inside agent code.
    pub max_call_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of pairings running at once.
    pub max_concurrent: usize,

    /// Upper bound on one side of a pairing before the job fails.
    pub side_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_live_matches: 10,
            connect_timeout_secs: 60,
            betting_window_secs: 30,
            countdown_secs: 3,
            match_duration_secs: 5 * 60,
            reconnect_grace_secs: 10,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 100,
            memory_limit_bytes: 128 * 1024 * 1024,
            max_call_depth: 64,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            side_timeout_secs: 5 * 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn betting_window(&self) -> Duration {
        Duration::from_secs(self.betting_window_secs)
    }

    pub fn match_duration(&self) -> Duration {
        Duration::from_secs(self.match_duration_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}

impl SandboxConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl SchedulerConfig {
    pub fn side_timeout(&self) -> Duration {
        Duration::from_secs(self.side_timeout_secs)
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        let orch = &self.orchestrator;
        if orch.max_live_matches == 0 {
            return Err(anyhow!("orchestrator.max_live_matches must be > 0"));
        }
        if orch.connect_timeout_secs == 0 {
            return Err(anyhow!("orchestrator.connect_timeout_secs must be > 0"));
        }
        if orch.match_duration_secs == 0 {
            return Err(anyhow!("orchestrator.match_duration_secs must be > 0"));
        }
        if orch.reconnect_grace_secs == 0 {
            return Err(anyhow!("orchestrator.reconnect_grace_secs must be > 0"));
        }
        if self.sandbox.deadline_ms == 0 {
            return Err(anyhow!("sandbox.deadline_ms must be > 0"));
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(anyhow!("sandbox.memory_limit_bytes must be > 0"));
        }
        if self.sandbox.max_call_depth == 0 {
            return Err(anyhow!("sandbox.max_call_depth must be > 0"));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(anyhow!("scheduler.max_concurrent must be > 0"));
        }
        if self.scheduler.side_timeout_secs == 0 {
            return Err(anyhow!("scheduler.side_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ArenaConfig::default()`.
pub fn load_config(path: &Path) -> Result<ArenaConfig> {
    if !path.exists() {
        let cfg = ArenaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ArenaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ArenaConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
