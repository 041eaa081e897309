//! Profiler configuration

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityType;
use crate::error::{Result, TraceError};

/// Configuration for one trace request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Collection length, measured from the capture-window start. 0 means default.
    #[serde(default = "default_duration_ms")]
    pub activities_duration_ms: u64,

    /// Delay between configure and collection start
    #[serde(default = "default_warmup_ms")]
    pub activities_warmup_ms: u64,

    /// When the request was issued; used to synchronize starts across processes
    #[serde(default)]
    pub request_timestamp: Option<DateTime<Utc>>,

    #[serde(default = "default_max_request_age_ms")]
    pub max_request_age_ms: u64,

    /// Forwarded to the hardware backend
    #[serde(default = "default_max_gpu_buffer_size_mb")]
    pub max_gpu_buffer_size_mb: u64,

    #[serde(default = "ActivityType::defaults")]
    pub selected_activity_types: Vec<ActivityType>,

    /// Only nets whose name contains one of these are kept
    #[serde(default)]
    pub net_name_filter: Vec<String>,

    /// Nets launching fewer GPU ops than this are dropped
    #[serde(default)]
    pub net_gpu_op_count_threshold: i32,

    /// Net whose iterations are counted. Empty picks the first net seen.
    #[serde(default)]
    pub net_iterations_target: String,

    /// Iterations to collect before stopping; 0 disables iteration tracking
    #[serde(default)]
    pub net_iterations_target_count: i32,

    /// Collect async requests into an in-memory logger
    #[serde(default = "default_true")]
    pub log_to_memory: bool,
}

fn default_duration_ms() -> u64 { 500 }
fn default_warmup_ms() -> u64 { 5000 }
fn default_max_request_age_ms() -> u64 { 10_000 }
fn default_max_gpu_buffer_size_mb() -> u64 { 128 }
fn default_true() -> bool { true }

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            activities_duration_ms: default_duration_ms(),
            activities_warmup_ms: default_warmup_ms(),
            request_timestamp: None,
            max_request_age_ms: default_max_request_age_ms(),
            max_gpu_buffer_size_mb: default_max_gpu_buffer_size_mb(),
            selected_activity_types: ActivityType::defaults(),
            net_name_filter: Vec::new(),
            net_gpu_op_count_threshold: 0,
            net_iterations_target: String::new(),
            net_iterations_target_count: 0,
            log_to_memory: true,
        }
    }
}

impl ProfilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProfilerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| TraceError::IoError {
            message: format!("{}: {}", path.as_ref().display(), e),
        })?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.net_iterations_target_count < 0 {
            return Err(TraceError::InvalidConfig {
                reason: format!(
                    "net_iterations_target_count must not be negative, got {}",
                    self.net_iterations_target_count
                ),
            });
        }
        if self.selected_activity_types.is_empty() {
            return Err(TraceError::InvalidConfig {
                reason: "selected_activity_types is empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.activities_duration_ms = ms;
        self
    }

    pub fn with_warmup_ms(mut self, ms: u64) -> Self {
        self.activities_warmup_ms = ms;
        self
    }

    pub fn with_request_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.request_timestamp = Some(ts);
        self
    }

    pub fn with_activity_types(mut self, kinds: impl IntoIterator<Item = ActivityType>) -> Self {
        self.selected_activity_types = kinds.into_iter().collect();
        self
    }

    pub fn with_net_name_filter(
        mut self,
        filters: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.net_name_filter = filters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_net_gpu_op_count_threshold(mut self, threshold: i32) -> Self {
        self.net_gpu_op_count_threshold = threshold;
        self
    }

    pub fn with_net_iterations_target(mut self, name: impl Into<String>, count: i32) -> Self {
        self.net_iterations_target = name.into();
        self.net_iterations_target_count = count;
        self
    }

    /// Collection length, substituting the default for 0
    pub fn activities_duration(&self) -> Duration {
        let ms = if self.activities_duration_ms == 0 {
            default_duration_ms()
        } else {
            self.activities_duration_ms
        };
        Duration::milliseconds(ms as i64)
    }

    pub fn activities_warmup(&self) -> Duration {
        Duration::milliseconds(self.activities_warmup_ms as i64)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::milliseconds(self.max_request_age_ms as i64)
    }

    pub fn selects(&self, kind: ActivityType) -> bool {
        self.selected_activity_types.contains(&kind)
    }

    /// When collection should start for a request configured at `now`
    pub fn start_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.request_timestamp {
            Some(requested) => {
                let synced = requested + self.max_request_age() + self.activities_warmup();
                if synced < now {
                    tracing::warn!(
                        requested = %requested,
                        "synchronized start time already passed, starting after warmup instead"
                    );
                    now + self.activities_warmup()
                } else {
                    synced
                }
            }
            None => now + self.activities_warmup(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProfilerConfig::default();
        assert_eq!(config.activities_duration_ms, 500);
        assert_eq!(config.activities_warmup_ms, 5000);
        assert!(config.log_to_memory);
        assert!(!config.selects(ActivityType::CudaProfilerRange));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ProfilerConfig::from_json(
            r#"{"net_name_filter": ["resnet"], "net_iterations_target_count": 3,
                "selected_activity_types": ["cpu_op", "user_annotation"]}"#,
        )
        .unwrap();
        assert_eq!(config.net_name_filter, vec!["resnet".to_string()]);
        assert_eq!(config.net_iterations_target_count, 3);
        assert_eq!(config.activities_warmup_ms, 5000);
        assert!(config.selects(ActivityType::UserAnnotation));
        assert!(!config.selects(ActivityType::ConcurrentKernel));
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        let err = ProfilerConfig::from_json(r#"{"net_iterations_target_count": -2}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
        let err = ProfilerConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.error_code(), "JSON_ERROR");
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir()
            .join(format!("tracelink-config-{}.json", std::process::id()));
        let json = r#"{"activities_duration_ms": 250, "log_to_memory": false}"#;
        std::fs::write(&path, json).unwrap();
        let config = ProfilerConfig::from_json_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.activities_duration_ms, 250);
        assert!(!config.log_to_memory);

        let err = ProfilerConfig::from_json_file(&path).unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_zero_duration_uses_default() {
        let config = ProfilerConfig::new().with_duration_ms(0);
        assert_eq!(config.activities_duration(), Duration::milliseconds(500));
    }

    #[test]
    fn test_start_time() {
        let now = Utc::now();
        let config = ProfilerConfig::new().with_warmup_ms(100);
        assert_eq!(config.start_time(now), now + Duration::milliseconds(100));

        // A recent request synchronizes on request time + max age + warmup
        let requested = now - Duration::milliseconds(1000);
        let synced = config.clone().with_request_timestamp(requested);
        assert_eq!(
            synced.start_time(now),
            requested + Duration::milliseconds(10_000 + 100)
        );

        // A stale request falls back to now + warmup
        let stale = config.with_request_timestamp(now - Duration::milliseconds(60_000));
        assert_eq!(stale.start_time(now), now + Duration::milliseconds(100));
    }
}
