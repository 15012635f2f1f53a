//! Engine configuration: one typed record with defaults and env overrides.
//!
//! Every tunable the engine consults lives here. Defaults are hard-coded,
//! `CDBSH_*` environment variables override them at startup, and the record
//! is validated once at load. Components receive the config by `Arc`; nothing
//! re-reads the environment at runtime.

use crate::error::{EngineError, EngineResult};
use std::path::PathBuf;
use std::time::Duration;

/// Default installation roots probed for cdb.exe when no explicit path is
/// configured. These are the Windows SDK / Windows Kits debugger locations.
const DEFAULT_INSTALL_ROOTS: &[&str] = &[
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers",
    r"C:\Program Files\Windows Kits\10\Debuggers",
    r"C:\Program Files (x86)\Windows Kits\8.1\Debuggers",
];

/// Command prefixes that are never merged into a batch. `!analyze` runs for
/// minutes and would starve everything merged behind it; the quit and restart
/// meta-commands change process state and must run alone.
const DEFAULT_BATCH_EXCLUSIONS: &[&str] = &["!analyze", ".restart", ".reload", "q", "qd"];

/// Typed engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit path to cdb.exe. When set and present on disk it wins over
    /// the install-root probe.
    pub cdb_path: Option<PathBuf>,
    /// Ordered installation roots probed by the tool locator.
    pub install_roots: Vec<PathBuf>,
    /// Default symbol search string passed to new sessions (`-y`).
    pub symbols_path: Option<String>,
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Sessions idle longer than this (with no non-terminal commands) are closed.
    pub session_idle_timeout: Duration,
    /// Cadence of the idle sweep and server-health snapshot.
    pub idle_sweep_interval: Duration,
    /// How long to wait for the readiness echo after spawning cdb.
    pub startup_timeout: Duration,
    /// Per-command execution deadline, measured from dispatch.
    pub command_timeout: Duration,
    /// Cadence of heartbeat notifications while a command is executing.
    pub heartbeat_interval: Duration,
    /// After an interrupt, how long to wait for the end sentinel before the
    /// process is declared hung.
    pub interrupt_grace: Duration,
    /// After a graceful `q`, how long to wait for exit before killing.
    pub stop_grace: Duration,
    /// Soft cap on pending (non-terminal) commands per session.
    pub queue_capacity: usize,
    /// Per-command output cap in bytes; exceeding it fails the command.
    pub max_output_bytes: usize,
    /// Minimum number of queued commands worth merging into a batch.
    pub min_batch_size: usize,
    /// Maximum number of commands merged into one batch.
    pub max_batch_size: usize,
    /// Command prefixes excluded from batching.
    pub batch_exclusions: Vec<String>,
    /// How many times the recovery supervisor retries a restart before
    /// marking the session failed.
    pub max_restart_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cdb_path: None,
            install_roots: DEFAULT_INSTALL_ROOTS.iter().map(PathBuf::from).collect(),
            symbols_path: None,
            max_sessions: 8,
            session_idle_timeout: Duration::from_secs(30 * 60),
            idle_sweep_interval: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
            interrupt_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            queue_capacity: 100,
            max_output_bytes: 8 * 1024 * 1024,
            min_batch_size: 2,
            max_batch_size: 5,
            batch_exclusions: DEFAULT_BATCH_EXCLUSIONS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_restart_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overridden by `CDBSH_*` environment
    /// variables, then validate it.
    pub fn from_env() -> EngineResult<Self> {
        let mut cfg = Self::default();

        if let Some(path) = env_string("CDBSH_CDB_PATH") {
            cfg.cdb_path = Some(PathBuf::from(path));
        }
        if let Some(roots) = env_string("CDBSH_INSTALL_ROOTS") {
            cfg.install_roots = split_list(&roots).map(PathBuf::from).collect();
        }
        if let Some(sym) = env_string("CDBSH_SYMBOL_PATH") {
            cfg.symbols_path = Some(sym);
        }
        if let Some(n) = env_parse("CDBSH_MAX_SESSIONS")? {
            cfg.max_sessions = n;
        }
        if let Some(secs) = env_parse("CDBSH_IDLE_TIMEOUT_SECONDS")? {
            cfg.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_SWEEP_INTERVAL_SECONDS")? {
            cfg.idle_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_STARTUP_TIMEOUT_SECONDS")? {
            cfg.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_COMMAND_TIMEOUT_SECONDS")? {
            cfg.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_HEARTBEAT_INTERVAL_SECONDS")? {
            cfg.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_INTERRUPT_GRACE_SECONDS")? {
            cfg.interrupt_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CDBSH_STOP_GRACE_SECONDS")? {
            cfg.stop_grace = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("CDBSH_QUEUE_CAPACITY")? {
            cfg.queue_capacity = n;
        }
        if let Some(n) = env_parse("CDBSH_MAX_OUTPUT_BYTES")? {
            cfg.max_output_bytes = n;
        }
        if let Some(n) = env_parse("CDBSH_MIN_BATCH_SIZE")? {
            cfg.min_batch_size = n;
        }
        if let Some(n) = env_parse("CDBSH_MAX_BATCH_SIZE")? {
            cfg.max_batch_size = n;
        }
        if let Some(list) = env_string("CDBSH_BATCH_EXCLUSIONS") {
            cfg.batch_exclusions = split_list(&list).map(str::to_string).collect();
        }
        if let Some(n) = env_parse("CDBSH_MAX_RESTART_ATTEMPTS")? {
            cfg.max_restart_attempts = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_sessions == 0 {
            return Err(EngineError::InvalidConfig("max_sessions must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_capacity must be > 0".into(),
            ));
        }
        if self.min_batch_size < 2 {
            return Err(EngineError::InvalidConfig(
                "min_batch_size must be at least 2".into(),
            ));
        }
        if self.max_batch_size < self.min_batch_size {
            return Err(EngineError::InvalidConfig(format!(
                "max_batch_size ({}) must be >= min_batch_size ({})",
                self.max_batch_size, self.min_batch_size
            )));
        }
        for (name, d) in [
            ("session_idle_timeout", self.session_idle_timeout),
            ("idle_sweep_interval", self.idle_sweep_interval),
            ("startup_timeout", self.startup_timeout),
            ("command_timeout", self.command_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("interrupt_grace", self.interrupt_grace),
            ("stop_grace", self.stop_grace),
        ] {
            if d.is_zero() {
                return Err(EngineError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.max_output_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "max_output_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> EngineResult<Option<T>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            EngineError::InvalidConfig(format!("{name}: cannot parse '{raw}'"))
        }),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
