//! Activity model
//!
//! An [`Activity`] is one timestamped event. Activities are grouped into
//! [`CpuTraceBuffer`]s (one per transferred CPU trace or plugin session) and the
//! buffers of one collection are gathered in [`ActivityBuffers`], which is the
//! sole owner of every activity in a trace. Other structures refer to an
//! activity through an [`ActivityRef`] handle instead of a pointer.
//!
//! All timestamps are nanoseconds since the Unix epoch.

mod types;

pub use types::{ActivityType, LinkType};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Converts a wall-clock instant to nanoseconds since the epoch
pub fn to_ns(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts nanoseconds since the epoch to a wall-clock instant
pub fn from_ns(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

/// Flow link attached to an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: u32,
    pub link: LinkType,
    pub is_start: bool,
}

/// One timestamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityType,
    /// May be set after the activity is appended
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub id: i64,
    pub device: i64,
    /// Stream, queue or thread the activity ran on
    pub resource: i64,
    pub thread_id: i32,
    /// CPU ops carry their external correlation id here, hardware records
    /// their low-level one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<u64>,
    /// Correlation of the CPU op this activity was attributed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_correlation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<Flow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, String)>,
}

impl Activity {
    /// Creates an activity with zeroed ids and no links
    pub fn new(
        kind: ActivityType,
        name: impl Into<String>,
        start_time: i64,
        end_time: i64,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            start_time,
            end_time,
            id: 0,
            device: 0,
            resource: 0,
            thread_id: 0,
            correlation: None,
            linked_correlation: None,
            flow: None,
            metadata: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_device(mut self, device: i64) -> Self {
        self.device = device;
        self
    }

    pub fn with_resource(mut self, resource: i64) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_thread(mut self, thread_id: i32) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_correlation(mut self, correlation: u64) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push((key.into(), value.into()));
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A named time interval: one iteration of a net, or one plugin session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub start_time: i64,
    pub end_time: i64,
    /// Activities attributed to the span; negative means unknown
    pub op_count: i32,
    pub iteration: i32,
    pub name: String,
    /// Display prefix, e.g. `"GPU: "` for the device-side counterpart
    pub prefix: String,
}

impl TraceSpan {
    pub fn new(start_time: i64, end_time: i64, name: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            op_count: 0,
            iteration: -1,
            name: name.into(),
            prefix: String::new(),
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_time && ts <= self.end_time
    }
}

/// One span's worth of activities handed over by a producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTraceBuffer {
    pub span: TraceSpan,
    /// GPU ops launched during the span; negative when not counted
    pub gpu_op_count: i32,
    pub activities: Vec<Activity>,
}

impl CpuTraceBuffer {
    pub fn new(span: TraceSpan) -> Self {
        Self {
            span,
            gpu_op_count: -1,
            activities: Vec::new(),
        }
    }

    pub fn with_gpu_op_count(mut self, gpu_op_count: i32) -> Self {
        self.gpu_op_count = gpu_op_count;
        self
    }

    pub fn push(&mut self, activity: Activity) {
        self.activities.push(activity);
    }
}

/// Display information for a stream, queue or thread exposed by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub device_id: i64,
    pub id: i64,
    pub sort_index: i64,
    pub name: String,
}

/// Display information for a host thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub system_thread_id: i32,
    pub name: String,
}

/// Display information for a process or GPU pseudo-process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i64,
    pub name: String,
    pub label: String,
}

/// Stable handle to an activity inside [`ActivityBuffers::cpu`]
///
/// Buffers are only ever appended to during a collection, so a handle stays
/// valid until the buffers are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityRef {
    pub buffer: usize,
    pub index: usize,
}

/// Every buffer of one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityBuffers {
    /// One per admitted CPU trace transfer, in arrival order
    pub cpu: Vec<CpuTraceBuffer>,
    /// One per child profiler session
    pub plugin: Vec<CpuTraceBuffer>,
    /// Hardware activities and synthesized GPU spans
    pub gpu: Vec<Activity>,
}

impl ActivityBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a CPU buffer and returns its index
    pub fn push_cpu(&mut self, buffer: CpuTraceBuffer) -> usize {
        self.cpu.push(buffer);
        self.cpu.len() - 1
    }

    pub fn get(&self, activity: ActivityRef) -> Option<&Activity> {
        self.cpu
            .get(activity.buffer)
            .and_then(|buffer| buffer.activities.get(activity.index))
    }

    /// Number of activities across all buffers
    pub fn activity_count(&self) -> usize {
        self.cpu.iter().map(|b| b.activities.len()).sum::<usize>()
            + self.plugin.iter().map(|b| b.activities.len()).sum::<usize>()
            + self.gpu.len()
    }

    /// Iterates every activity: CPU buffers, then plugin buffers, then GPU
    pub fn iter(&self) -> impl Iterator<Item = &Activity> {
        self.cpu
            .iter()
            .chain(self.plugin.iter())
            .flat_map(|buffer| buffer.activities.iter())
            .chain(self.gpu.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_builder() {
        let mut op = Activity::new(ActivityType::CpuOp, "aten::add", 100, 250)
            .with_thread(7)
            .with_correlation(42);
        op.add_metadata("Input Dims", "[2, 3]");

        assert_eq!(op.duration(), 150);
        assert_eq!(op.correlation, Some(42));
        assert_eq!(op.metadata_value("Input Dims"), Some("[2, 3]"));
        assert_eq!(op.metadata_value("missing"), None);
    }

    #[test]
    fn test_activity_refs_survive_appends() {
        let mut buffers = ActivityBuffers::new();
        let mut first = CpuTraceBuffer::new(TraceSpan::new(0, 10, "net"));
        first.push(Activity::new(ActivityType::CpuOp, "op0", 1, 2));
        let idx = buffers.push_cpu(first);
        let handle = ActivityRef { buffer: idx, index: 0 };

        for i in 0..32 {
            let mut more = CpuTraceBuffer::new(TraceSpan::new(0, 10, "net"));
            more.push(Activity::new(ActivityType::CpuOp, format!("op{}", i + 1), 1, 2));
            buffers.push_cpu(more);
        }

        assert_eq!(buffers.get(handle).map(|a| a.name.as_str()), Some("op0"));
        assert_eq!(buffers.activity_count(), 33);
        assert!(buffers.get(ActivityRef { buffer: 99, index: 0 }).is_none());
    }

    #[test]
    fn test_ns_conversion() {
        let ns = 1_700_000_000_123_456_789;
        assert_eq!(to_ns(from_ns(ns)), ns);
    }

    #[test]
    fn test_activity_serialization_skips_empty_links() {
        let act = Activity::new(ActivityType::ConcurrentKernel, "k", 1, 2);
        let json = serde_json::to_string(&act).unwrap();
        assert!(json.contains("concurrent_kernel"));
        assert!(!json.contains("flow"));
    }
}
