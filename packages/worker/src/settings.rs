//! Process settings read from the environment.

use std::time::Duration;

use actors::WorkerConfig;
use store::StoreConfig;
use thiserror::Error;
use tracing::Level;

pub const STORE_URL: &str = "JOBQUEUE_STORE_URL";
pub const QUEUES: &str = "JOBQUEUE_QUEUES";
pub const WORKER_ID: &str = "JOBQUEUE_WORKER_ID";
pub const MAX_JOBS: &str = "JOBQUEUE_MAX_JOBS";
pub const HEARTBEAT_SECS: &str = "JOBQUEUE_HEARTBEAT_SECS";
pub const REAP_SECS: &str = "JOBQUEUE_REAP_SECS";
pub const LOG: &str = "JOBQUEUE_LOG";

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{var} must be a positive integer, got {value:?}")]
    NotPositive { var: &'static str, value: String },

    #[error("{0} lists no queues")]
    NoQueues(&'static str),

    #[error("JOBQUEUE_LOG is not a log level: {0:?}")]
    LogLevel(String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub log_level: Level,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from any variable source. Unset and blank variables
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store = get(STORE_URL).map(StoreConfig::new).unwrap_or_default();

        let queues = match get(QUEUES) {
            Some(raw) => {
                let queues: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect();
                if queues.is_empty() {
                    return Err(SettingsError::NoQueues(QUEUES));
                }
                queues
            }
            None => vec!["default".to_string()],
        };

        let mut worker = WorkerConfig::new(queues);
        if let Some(id) = get(WORKER_ID) {
            worker = worker.with_worker_id(id);
        }
        if let Some(raw) = get(MAX_JOBS) {
            worker = worker.with_max_jobs(positive(MAX_JOBS, &raw)? as usize);
        }
        if let Some(raw) = get(HEARTBEAT_SECS) {
            let interval = Duration::from_secs(positive(HEARTBEAT_SECS, &raw)?);
            // Presence must outlive several missed beats.
            worker = worker
                .with_heartbeat_interval(interval)
                .with_presence_ttl(interval * 6);
        }
        if let Some(raw) = get(REAP_SECS) {
            let secs = raw.parse::<u64>().map_err(|_| SettingsError::NotPositive {
                var: REAP_SECS,
                value: raw.clone(),
            })?;
            // 0 turns the reaper off.
            worker = worker.with_reap_interval((secs > 0).then(|| Duration::from_secs(secs)));
        }

        let log_level = match get(LOG) {
            Some(raw) => raw
                .parse::<Level>()
                .map_err(|_| SettingsError::LogLevel(raw.clone()))?,
            None => Level::INFO,
        };

        Ok(Self {
            store,
            worker,
            log_level,
        })
    }
}

fn positive(var: &'static str, raw: &str) -> Result<u64, SettingsError> {
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SettingsError::NotPositive {
            var,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.store.scheme(), "memory");
        assert_eq!(settings.worker.queues, vec!["default".to_string()]);
        assert_eq!(settings.worker.max_jobs, 10);
        assert_eq!(settings.log_level, Level::INFO);
        assert!(settings.worker.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            (STORE_URL, "redis://cache:6379/0"),
            (QUEUES, " emails, reports ,,"),
            (WORKER_ID, "w-7"),
            (MAX_JOBS, "3"),
            (HEARTBEAT_SECS, "2"),
            (REAP_SECS, "0"),
            (LOG, "debug"),
        ])
        .unwrap();

        assert_eq!(settings.store.scheme(), "redis");
        assert_eq!(settings.worker.queues, vec!["emails".to_string(), "reports".to_string()]);
        assert_eq!(settings.worker.worker_id, "w-7");
        assert_eq!(settings.worker.max_jobs, 3);
        assert_eq!(settings.worker.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(settings.worker.presence_ttl, Duration::from_secs(12));
        assert_eq!(settings.worker.reap_interval, None);
        assert_eq!(settings.log_level, Level::DEBUG);
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let settings = settings(&[(WORKER_ID, "  "), (STORE_URL, "")]).unwrap();
        assert_eq!(settings.store.scheme(), "memory");
        assert!(!settings.worker.worker_id.trim().is_empty());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            settings(&[(MAX_JOBS, "0")]),
            Err(SettingsError::NotPositive { var: MAX_JOBS, .. })
        ));
        assert!(matches!(
            settings(&[(HEARTBEAT_SECS, "soon")]),
            Err(SettingsError::NotPositive { .. })
        ));
        assert!(matches!(settings(&[(QUEUES, ",,")]), Err(SettingsError::NoQueues(_))));
        assert!(matches!(settings(&[(LOG, "loud")]), Err(SettingsError::LogLevel(_))));
    }
}
