//! Environment-driven configuration
//!
//! All configuration is loaded from environment variables, following
//! `spec.md` §6's naming exactly for the variables it enumerates. A handful
//! of additional variables (HTTP bind address, allowed IMAP provider hosts)
//! are specific to this crate's concrete deployment and documented inline.

use std::env;
use std::env::VarError;
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Environment name, affecting log verbosity only (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "development" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    /// Default `tracing` filter directive for this environment.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Staging => "info",
            Self::Production => "info,mail_grant_bridge=info",
        }
    }
}

/// Server-wide configuration, built once in `main` and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub environment: Environment,

    /// SQLite connection string (`DATABASE_HOST`/`DATABASE_NAME`). Persistence
    /// engine choice is out of scope per `spec.md` §1; the variable names are
    /// kept, their value is interpreted as a `sqlite:` URL.
    pub database_url: String,
    pub database_min_pool_size: u32,
    pub database_max_pool_size: u32,

    /// Listener-supervisor count (`WORKERS_NUM`).
    pub workers_num: usize,
    /// Upper bound passed to the pool's per-provider cap (`WORKER_MAX_CONNECTIONS_PER_PROVIDER`).
    pub worker_max_connections_per_provider: usize,

    /// Per-command deadline (`IMAP_TIMEOUT`).
    pub imap_timeout: Duration,
    /// IDLE wake interval, kept under the RFC 2177 29-minute guideline
    /// (`IMAP_IDLE_TIMEOUT`).
    pub imap_idle_timeout: Duration,

    /// HTTP listen address for `/auth`, `/process`, `/token`.
    pub http_bind_addr: String,

    /// Hard-coded allow-list of IMAP provider hosts (`spec.md` §9 Open
    /// Question: resolved as rejection with a distinct `upstream_unavailable`
    /// on mismatch rather than silently accepting arbitrary hosts).
    pub allowed_imap_hosts: Vec<String>,

    /// Authorization code lifetime, default 10 minutes (`spec.md` §3).
    pub auth_code_ttl: Duration,

    /// Consecutive IDLE failures before an account transitions to `failed`
    /// (`spec.md` §4.C, default 20).
    pub max_consecutive_failures: u32,

    /// `cleanup_idle` threshold for the connection pool (`spec.md` §4.B,
    /// default 600s).
    pub pool_max_idle_seconds: u64,
}

/// Liveness probe deadline — fixed at 5s by `spec.md` §4.B/§5, not
/// configurable.
pub const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Listener cancellation grace period — fixed at 10s by `spec.md` §5.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(10);
/// Backoff ceiling for the IDLE Listener — fixed at 300s by `spec.md` §4.C.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Default per-provider concurrency cap (`spec.md` §4.B).
pub const DEFAULT_PROVIDER_CAP: usize = 10;

impl ServerConfig {
    /// Load all configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if a variable is present but malformed.
    pub fn load_from_env() -> AppResult<Self> {
        let environment = match env::var("ENVIRONMENT") {
            Ok(v) => Environment::parse(&v).ok_or_else(|| {
                AppError::InvalidRequest(format!("invalid ENVIRONMENT value: '{v}'"))
            })?,
            Err(VarError::NotPresent) => Environment::Development,
            Err(VarError::NotUnicode(_)) => {
                return Err(AppError::InvalidRequest(
                    "ENVIRONMENT contains non-unicode data".to_owned(),
                ));
            }
        };

        let database_host = env::var("DATABASE_HOST")
            .unwrap_or_else(|_| "mail_grant_bridge.sqlite3".to_owned());
        let database_name = env::var("DATABASE_NAME").unwrap_or_else(|_| "nolas".to_owned());
        let database_url = build_database_url(&database_host, &database_name);

        let allowed_imap_hosts = match env::var("IMAP_ALLOWED_HOSTS") {
            Ok(v) => v
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => vec!["imap.purelymail.com".to_owned()],
        };

        Ok(Self {
            environment,
            database_url,
            database_min_pool_size: parse_u32_env("DATABASE_MIN_POOL_SIZE", 5)?,
            database_max_pool_size: parse_u32_env("DATABASE_MAX_POOL_SIZE", 20)?,
            workers_num: parse_usize_env("WORKERS_NUM", 2)?,
            worker_max_connections_per_provider: parse_usize_env(
                "WORKER_MAX_CONNECTIONS_PER_PROVIDER",
                50,
            )?,
            imap_timeout: Duration::from_secs(parse_u64_env("IMAP_TIMEOUT", 300)?),
            imap_idle_timeout: Duration::from_secs(parse_u64_env("IMAP_IDLE_TIMEOUT", 1740)?),
            http_bind_addr: env::var("BRIDGE_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_owned()),
            allowed_imap_hosts,
            auth_code_ttl: Duration::from_secs(parse_u64_env("AUTH_CODE_TTL_SECONDS", 600)?),
            max_consecutive_failures: parse_u32_env("MAX_CONSECUTIVE_FAILURES", 20)?,
            pool_max_idle_seconds: parse_u64_env("POOL_MAX_IDLE_SECONDS", 600)?,
        })
    }

    /// Whether `host` is allowed to be used as an IMAP provider.
    ///
    /// Resolves the `spec.md` §9 Open Question: hosts outside the allow-list
    /// are rejected rather than silently accepted.
    pub fn is_allowed_provider(&self, host: &str) -> bool {
        self.allowed_imap_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

fn build_database_url(host: &str, name: &str) -> String {
    if host.contains("://") || host == ":memory:" {
        // Caller already supplied a full connection string, or asked for an
        // in-process database (e.g. `sqlite::memory:`).
        if host == ":memory:" {
            "sqlite::memory:".to_owned()
        } else {
            host.to_owned()
        }
    } else {
        format!("sqlite:{host}-{name}.sqlite3")
    }
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u32>()
            .map_err(|_| AppError::InvalidRequest(format!("invalid u32 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidRequest(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::InvalidRequest(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidRequest(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|_| AppError::InvalidRequest(format!("invalid usize environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidRequest(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_memory_database_url() {
        assert_eq!(build_database_url(":memory:", "nolas"), "sqlite::memory:");
    }

    #[test]
    fn builds_full_url_unchanged() {
        assert_eq!(
            build_database_url("sqlite::memory:", "ignored"),
            "sqlite::memory:"
        );
    }

    #[test]
    fn default_allowed_hosts_matches_original_source() {
        // SAFETY: test-only, single-threaded access to process env.
        unsafe {
            env::remove_var("IMAP_ALLOWED_HOSTS");
        }
        let cfg = ServerConfig::load_from_env().expect("loads with defaults");
        assert!(cfg.is_allowed_provider("imap.purelymail.com"));
        assert!(!cfg.is_allowed_provider("imap.evil.test"));
    }
}
