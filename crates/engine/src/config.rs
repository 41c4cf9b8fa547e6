use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pipewright_core::error::CoreError;

use crate::slots::DEFAULT_PROCESSING_SLOTS;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single local instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue this instance claims from (default: `default`).
    pub queue_id: String,
    /// Concurrently processed roots (default: `1000`).
    pub processing_slots: usize,
    /// Cap on waiting roots; `0` is unlimited (default: `0`).
    pub max_waiting_slots: usize,
    pub dispatch_interval: Duration,
    /// Records claimed per scope per cycle (default: `20`).
    pub dispatch_batch_size: usize,
    /// Computation steps running at once (default: `64`).
    pub task_pool_size: usize,
    /// Only claim records stamped with `queue_id`.
    pub only_pre_assigned: bool,
    /// Where external programs write their output logs.
    pub output_root: PathBuf,
    pub scheduler_interval: Duration,
    pub dependency_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_id: "default".into(),
            processing_slots: DEFAULT_PROCESSING_SLOTS,
            max_waiting_slots: 0,
            dispatch_interval: Duration::from_millis(1000),
            dispatch_batch_size: 20,
            task_pool_size: 64,
            only_pre_assigned: false,
            output_root: PathBuf::from("./output"),
            scheduler_interval: Duration::from_secs(30),
            dependency_poll: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default    |
    /// |---------------------------|------------|
    /// | `QUEUE_ID`                | `default`  |
    /// | `PROCESSING_SLOTS`        | `1000`     |
    /// | `MAX_WAITING_SLOTS`       | `0`        |
    /// | `DISPATCH_INTERVAL_MS`    | `1000`     |
    /// | `DISPATCH_BATCH_SIZE`     | `20`       |
    /// | `TASK_POOL_SIZE`          | `64`       |
    /// | `ONLY_PRE_ASSIGNED_WORK`  | `false`    |
    /// | `OUTPUT_ROOT`             | `./output` |
    /// | `SCHEDULER_INTERVAL_SECS` | `30`       |
    /// | `DEPENDENCY_POLL_MS`      | `500`      |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let queue_id = lookup("QUEUE_ID")
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .unwrap_or(defaults.queue_id);

        let dispatch_batch_size: usize = parse(&lookup, "DISPATCH_BATCH_SIZE", 20)?;
        if dispatch_batch_size == 0 {
            return Err(CoreError::Validation(
                "DISPATCH_BATCH_SIZE must be at least 1".into(),
            ));
        }
        let task_pool_size: usize = parse(&lookup, "TASK_POOL_SIZE", 64)?;
        if task_pool_size == 0 {
            return Err(CoreError::Validation("TASK_POOL_SIZE must be at least 1".into()));
        }

        Ok(Self {
            queue_id,
            processing_slots: parse(&lookup, "PROCESSING_SLOTS", DEFAULT_PROCESSING_SLOTS)?,
            max_waiting_slots: parse(&lookup, "MAX_WAITING_SLOTS", 0)?,
            dispatch_interval: Duration::from_millis(parse(&lookup, "DISPATCH_INTERVAL_MS", 1000)?),
            dispatch_batch_size,
            task_pool_size,
            only_pre_assigned: parse(&lookup, "ONLY_PRE_ASSIGNED_WORK", false)?,
            output_root: lookup("OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            scheduler_interval: Duration::from_secs(parse(&lookup, "SCHEDULER_INTERVAL_SECS", 30)?),
            dependency_poll: Duration::from_millis(parse(&lookup, "DEPENDENCY_POLL_MS", 500)?),
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig, CoreError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.queue_id, "default");
        assert_eq!(config.processing_slots, 1000);
        assert_eq!(config.max_waiting_slots, 0);
        assert_eq!(config.dispatch_interval, Duration::from_secs(1));
        assert_eq!(config.dispatch_batch_size, 20);
        assert!(!config.only_pre_assigned);
        assert_eq!(config.output_root, PathBuf::from("./output"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("QUEUE_ID", "gpu-1"),
            ("PROCESSING_SLOTS", "4"),
            ("ONLY_PRE_ASSIGNED_WORK", "true"),
            ("DEPENDENCY_POLL_MS", "50"),
        ])
        .unwrap();
        assert_eq!(config.queue_id, "gpu-1");
        assert_eq!(config.processing_slots, 4);
        assert!(config.only_pre_assigned);
        assert_eq!(config.dependency_poll, Duration::from_millis(50));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            load(&[("PROCESSING_SLOTS", "many")]),
            Err(CoreError::Validation(msg)) if msg.contains("PROCESSING_SLOTS")
        );
        assert_matches!(load(&[("DISPATCH_BATCH_SIZE", "0")]), Err(CoreError::Validation(_)));
    }
}
