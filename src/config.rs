use std::env;
use std::time::Duration;

use crate::error::{ManagerError, Result};

const DEFAULT_CAS_MAX_ANCHOR_WORKERS: i64 = 1;
const DEFAULT_CAS_MIN_ANCHOR_WORKERS: i64 = 0;

/// Deployment environment the manager is scheduling for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvType {
    Dev,
    Qa,
    Tnet,
    Prod,
}

impl EnvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvType::Dev => "dev",
            EnvType::Qa => "qa",
            EnvType::Tnet => "tnet",
            EnvType::Prod => "prod",
        }
    }

    /// The source branch deployed to this environment.
    pub fn branch(&self) -> &'static str {
        match self {
            EnvType::Dev | EnvType::Qa => "develop",
            EnvType::Tnet => "release-candidate",
            EnvType::Prod => "main",
        }
    }
}

impl std::str::FromStr for EnvType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(EnvType::Dev),
            "qa" => Ok(EnvType::Qa),
            "tnet" => Ok(EnvType::Tnet),
            "prod" => Ok(EnvType::Prod),
            other => Err(ManagerError::InvalidEnv(other.to_string())),
        }
    }
}

impl std::fmt::Display for EnvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Manager configuration, read from the environment at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub env: EnvType,
    pub paused: bool,
    /// Maximum concurrent v2 anchor workers; -1 means unbounded.
    pub max_anchor_jobs: i64,
    /// Minimum v2 anchor workers the queue is topped up to.
    pub min_anchor_jobs: i64,
    /// Enqueue a fresh E2E test when none has been queued for this long.
    pub e2e_test_interval: Option<Duration>,
    /// Enqueue a fresh smoke test when none has been queued for this long.
    pub smoke_test_interval: Option<Duration>,
}

impl ManagerConfig {
    /// Read configuration from `ENV`, `PAUSED`, `CAS_MAX_ANCHOR_WORKERS`,
    /// `CAS_MIN_ANCHOR_WORKERS`, `E2E_TEST_INTERVAL` and `SMOKE_TEST_INTERVAL`.
    pub fn from_env() -> Result<Self> {
        let env: EnvType = env::var("ENV").unwrap_or_default().parse()?;
        let paused = env::var("PAUSED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);
        let max_anchor_jobs = parse_int_var("CAS_MAX_ANCHOR_WORKERS", DEFAULT_CAS_MAX_ANCHOR_WORKERS);
        let min_anchor_jobs = parse_int_var("CAS_MIN_ANCHOR_WORKERS", DEFAULT_CAS_MIN_ANCHOR_WORKERS);
        Self::new(env, paused, max_anchor_jobs, min_anchor_jobs)
            .map(|c| Self {
                e2e_test_interval: parse_interval_var("E2E_TEST_INTERVAL"),
                smoke_test_interval: parse_interval_var("SMOKE_TEST_INTERVAL"),
                ..c
            })
    }

    pub fn new(env: EnvType, paused: bool, max_anchor_jobs: i64, min_anchor_jobs: i64) -> Result<Self> {
        if min_anchor_jobs > max_anchor_jobs {
            return Err(ManagerError::InvalidAnchorConfig {
                min: min_anchor_jobs,
                max: max_anchor_jobs,
            });
        }
        Ok(Self {
            env,
            paused,
            max_anchor_jobs,
            min_anchor_jobs,
            e2e_test_interval: None,
            smoke_test_interval: None,
        })
    }
}

fn parse_int_var(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

/// Intervals are given in seconds; unparseable values disable the interval.
fn parse_interval_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
