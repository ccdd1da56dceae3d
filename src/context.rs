//! `AppContext`: the explicit carrier for cancellation, the repository
//! secret and process identity, passed into every long-running operation
//! instead of process-wide globals (spec §9 "Global state").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token. Long-running loops over
/// snapshots/blobs/paths poll `is_cancelled()` between items, as
/// required by spec §5.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::RepoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Environment toggles recognized by the core (spec §6 "Environment
/// toggles"). Read once at `AppContext` construction so call sites don't
/// re-read the environment mid-operation.
#[derive(Clone, Debug)]
pub struct EnvToggles {
    pub agentless: bool,
    pub grace_period: Option<std::time::Duration>,
    pub do_deletion: bool,
    pub lockless: bool,
}

impl EnvToggles {
    pub fn from_env() -> Self {
        Self {
            agentless: env_flag("PLAKAR_AGENTLESS"),
            grace_period: std::env::var("PLAKAR_GRACEPERIOD")
                .ok()
                .and_then(|v| parse_duration(&v)),
            do_deletion: env_flag("PLAKAR_DODELETION"),
            lockless: env_flag("PLAKAR_LOCKLESS"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Parses simple duration strings like "30d", "12h", "5m", "10s".
fn parse_duration(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let value: u64 = num.parse().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => s.parse().ok()?,
    };
    Some(std::time::Duration::from_secs(secs))
}

/// Carries everything an operation needs that is not part of its
/// explicit arguments: cancellation, concurrency limits and environment
/// toggles. Never a global/thread-local; always threaded through calls.
#[derive(Clone)]
pub struct AppContext {
    pub cancel: CancelToken,
    pub max_concurrency: usize,
    pub env: EnvToggles,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            max_concurrency: default_concurrency(),
            env: EnvToggles::from_env(),
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// `cpus * 2 + 1`, matching the packer channel backpressure bound from
/// spec §5.
fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 2 + 1
}
