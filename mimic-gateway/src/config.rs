use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use regex::Regex;

/// Which side of the record/replay tool this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Record,
    Test,
}

/// A single pass-through rule as read from configuration, before its
/// regexes are compiled (see [`CompiledBypassRule`]).
#[derive(Debug, Clone)]
pub struct BypassRule {
    pub host: Option<String>,
    pub path: Option<String>,
    pub port: u16,
}

/// `BypassRule` with its patterns compiled once at session start.
///
/// Bypass rules are immutable for the session's lifetime (see the
/// concurrency model); compiling here rather than per-evaluation keeps
/// `isPassThrough` a cheap pure function.
#[derive(Debug, Clone)]
pub struct CompiledBypassRule {
    pub host: Option<Regex>,
    pub path: Option<Regex>,
    pub port: u16,
}

impl CompiledBypassRule {
    pub fn compile(rule: &BypassRule) -> anyhow::Result<Self> {
        Ok(Self {
            host: rule.host.as_deref().map(Regex::new).transpose()?,
            path: rule.path.as_deref().map(Regex::new).transpose()?,
            port: rule.port,
        })
    }
}

/// Process-wide immutable configuration snapshot (A1).
///
/// Built once at startup from whatever external configuration source the
/// host process supplies. The CLI/config-file format itself is out of
/// scope for this core; callers construct a `Conf` directly or through
/// [`Conf::from_parts`].
#[derive(Debug, Clone)]
pub struct Conf {
    pub run_mode: RunMode,
    pub listen_addr: SocketAddr,
    pub idle_read_deadline: Duration,
    pub tracker_sweep_interval: Duration,
    pub tracker_inactivity_threshold: Duration,
    pub buffer_cap_bytes: usize,
    pub bypass_rules: Vec<CompiledBypassRule>,
    pub log_file: Utf8PathBuf,
    pub log_filter: String,
}

impl Conf {
    pub const DEFAULT_IDLE_READ_DEADLINE: Duration = Duration::from_secs(5);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(60);
    pub const DEFAULT_BUFFER_CAP_BYTES: usize = 16 * 1024 * 1024;

    /// Builds a `Conf` from already-parsed parts, compiling bypass rules
    /// once. This is the constructor the out-of-scope CLI/config-file
    /// layer is expected to call after it has done its own parsing.
    pub fn from_parts(
        run_mode: RunMode,
        listen_addr: SocketAddr,
        bypass_rules: &[BypassRule],
        log_file: Utf8PathBuf,
        log_filter: String,
    ) -> anyhow::Result<Self> {
        let bypass_rules = bypass_rules
            .iter()
            .map(CompiledBypassRule::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            run_mode,
            listen_addr,
            idle_read_deadline: Self::DEFAULT_IDLE_READ_DEADLINE,
            tracker_sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            tracker_inactivity_threshold: Self::DEFAULT_INACTIVITY_THRESHOLD,
            buffer_cap_bytes: Self::DEFAULT_BUFFER_CAP_BYTES,
            bypass_rules,
            log_file,
            log_filter,
        })
    }
}
