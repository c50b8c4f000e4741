//! Call orchestrator configuration.
//!
//! Configuration is loaded from environment variables. Every knob has a
//! sensible default, so an empty environment yields a working config.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default matchmaking tick interval in milliseconds.
pub const DEFAULT_MATCH_TICK_MS: u64 = 1000;

/// Default queue entry deadline in seconds.
pub const DEFAULT_QUEUE_DEADLINE_SECONDS: u64 = 120;

/// Default same-level scan depth (0 = scan the whole queue).
pub const DEFAULT_LEVEL_SCAN_DEPTH: usize = 0;

/// Default wait budget for under-filled group sessions in seconds.
pub const DEFAULT_GROUP_WAIT_SECONDS: u64 = 30;

/// Default client-side matchmaking countdown in seconds.
pub const DEFAULT_COUNTDOWN_SECONDS: u64 = 120;

/// Call orchestrator configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Matchmaking tick interval in milliseconds (default: 1000).
    ///
    /// The periodic tick drives retry matching, queue expiry sweeps, and
    /// group activation deadlines, all on the registry's serialization
    /// domain.
    pub match_tick_ms: u64,

    /// How long a queue entry waits before `MatchTimeout` fires
    /// (default: 120).
    pub queue_deadline_seconds: u64,

    /// How many longest-waiting entries are scanned for a same-level pair
    /// before falling back to a cross-level pair (default: 0 = whole
    /// queue, which never cross-pairs).
    pub level_scan_depth: usize,

    /// How long a `waiting` group session accumulates members before it
    /// activates or is abandoned (default: 30).
    pub group_wait_seconds: u64,

    /// Client-side matchmaking countdown surfaced for UI (default: 120).
    pub countdown_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            match_tick_ms: DEFAULT_MATCH_TICK_MS,
            queue_deadline_seconds: DEFAULT_QUEUE_DEADLINE_SECONDS,
            level_scan_depth: DEFAULT_LEVEL_SCAN_DEPTH,
            group_wait_seconds: DEFAULT_GROUP_WAIT_SECONDS,
            countdown_seconds: DEFAULT_COUNTDOWN_SECONDS,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let match_tick_ms = parse_var(vars, "CALL_MATCH_TICK_MS", DEFAULT_MATCH_TICK_MS)?;
        let queue_deadline_seconds = parse_var(
            vars,
            "CALL_QUEUE_DEADLINE_SECONDS",
            DEFAULT_QUEUE_DEADLINE_SECONDS,
        )?;
        let level_scan_depth =
            parse_var(vars, "CALL_LEVEL_SCAN_DEPTH", DEFAULT_LEVEL_SCAN_DEPTH)?;
        let group_wait_seconds =
            parse_var(vars, "CALL_GROUP_WAIT_SECONDS", DEFAULT_GROUP_WAIT_SECONDS)?;
        let countdown_seconds =
            parse_var(vars, "CALL_COUNTDOWN_SECONDS", DEFAULT_COUNTDOWN_SECONDS)?;

        if match_tick_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_MATCH_TICK_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            match_tick_ms,
            queue_deadline_seconds,
            level_scan_depth,
            group_wait_seconds,
            countdown_seconds,
        })
    }

    /// Matchmaking tick interval.
    pub fn match_tick(&self) -> Duration {
        Duration::from_millis(self.match_tick_ms)
    }

    /// Queue entry deadline.
    pub fn queue_deadline(&self) -> Duration {
        Duration::from_secs(self.queue_deadline_seconds)
    }

    /// Group session wait budget.
    pub fn group_wait(&self) -> Duration {
        Duration::from_secs(self.group_wait_seconds)
    }

    /// Client matchmaking countdown.
    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}: {raw}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.match_tick_ms, DEFAULT_MATCH_TICK_MS);
        assert_eq!(config.queue_deadline_seconds, DEFAULT_QUEUE_DEADLINE_SECONDS);
        assert_eq!(config.level_scan_depth, DEFAULT_LEVEL_SCAN_DEPTH);
        assert_eq!(config.group_wait_seconds, DEFAULT_GROUP_WAIT_SECONDS);
        assert_eq!(config.countdown_seconds, DEFAULT_COUNTDOWN_SECONDS);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("CALL_MATCH_TICK_MS".to_string(), "250".to_string()),
            ("CALL_QUEUE_DEADLINE_SECONDS".to_string(), "60".to_string()),
            ("CALL_LEVEL_SCAN_DEPTH".to_string(), "8".to_string()),
            ("CALL_GROUP_WAIT_SECONDS".to_string(), "15".to_string()),
            ("CALL_COUNTDOWN_SECONDS".to_string(), "90".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("custom values should load");

        assert_eq!(config.match_tick_ms, 250);
        assert_eq!(config.queue_deadline_seconds, 60);
        assert_eq!(config.level_scan_depth, 8);
        assert_eq!(config.group_wait_seconds, 15);
        assert_eq!(config.countdown_seconds, 90);
        assert_eq!(config.match_tick(), Duration::from_millis(250));
        assert_eq!(config.queue_deadline(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let vars = HashMap::from([(
            "CALL_QUEUE_DEADLINE_SECONDS".to_string(),
            "soon".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("soon")));
    }

    #[test]
    fn test_from_vars_rejects_zero_tick() {
        let vars = HashMap::from([("CALL_MATCH_TICK_MS".to_string(), "0".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
