//! Output sinks
//!
//! The collection core hands finished records to an [`ActivityLogger`]. It
//! never defines a serialized format itself; a logger decides what to do with
//! each record. [`MemoryTraceLogger`] keeps everything in memory and is what
//! the controller uses for synchronous traces.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::activity::{Activity, ActivityBuffers, ProcessInfo, ResourceInfo, ThreadInfo, TraceSpan};
use crate::config::ProfilerConfig;

/// Sink for finished trace records
///
/// A record handed to the logger is only valid for the duration of the call.
/// Only `handle_activity` is required.
pub trait ActivityLogger: Send {
    fn handle_activity(&mut self, activity: &Activity);

    /// CPU activity belonging to `span`
    fn handle_cpu_activity(&mut self, activity: &Activity, _span: &TraceSpan) {
        self.handle_activity(activity);
    }

    fn handle_trace_span(&mut self, _span: &TraceSpan) {}

    /// Marks the start of an iteration of the tracked net
    fn handle_iteration_start(&mut self, _span: &TraceSpan) {}

    fn handle_process_info(&mut self, _info: &ProcessInfo, _time: i64) {}

    fn handle_thread_info(&mut self, _info: &ThreadInfo, _time: i64) {}

    fn handle_resource_info(&mut self, _info: &ResourceInfo, _time: i64) {}

    fn handle_trace_start(&mut self, _metadata: &BTreeMap<String, String>) {}

    /// Last call of a trace; the logger takes ownership of the buffers
    fn finalize_trace(
        &mut self,
        _config: &ProfilerConfig,
        _buffers: ActivityBuffers,
        _end_time: i64,
    ) {
    }
}

/// Completed trace as returned to callers
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityTrace {
    pub metadata: BTreeMap<String, String>,
    pub activities: Vec<Activity>,
    pub spans: Vec<TraceSpan>,
    pub iteration_starts: Vec<TraceSpan>,
    pub processes: Vec<ProcessInfo>,
    pub threads: Vec<ThreadInfo>,
    pub resources: Vec<ResourceInfo>,
    /// Present once the trace was finalized
    pub buffers: Option<ActivityBuffers>,
    pub end_time: i64,
}

impl ActivityTrace {
    pub fn is_finalized(&self) -> bool {
        self.buffers.is_some()
    }

    /// Logged activities of `kind`
    pub fn activities_of(
        &self,
        kind: crate::activity::ActivityType,
    ) -> impl Iterator<Item = &Activity> {
        self.activities.iter().filter(move |a| a.kind == kind)
    }
}

/// In-memory logger
///
/// Clones share storage, so a clone handed to the profiler can be read back
/// through the original once the trace completes.
#[derive(Debug, Clone, Default)]
pub struct MemoryTraceLogger {
    trace: Arc<Mutex<ActivityTrace>>,
}

impl MemoryTraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.trace.lock().activities.clone()
    }

    pub fn activity_count(&self) -> usize {
        self.trace.lock().activities.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.trace.lock().is_finalized()
    }

    /// Snapshot of everything received so far
    pub fn trace(&self) -> ActivityTrace {
        self.trace.lock().clone()
    }
}

impl ActivityLogger for MemoryTraceLogger {
    fn handle_activity(&mut self, activity: &Activity) {
        self.trace.lock().activities.push(activity.clone());
    }

    fn handle_trace_span(&mut self, span: &TraceSpan) {
        self.trace.lock().spans.push(span.clone());
    }

    fn handle_iteration_start(&mut self, span: &TraceSpan) {
        self.trace.lock().iteration_starts.push(span.clone());
    }

    fn handle_process_info(&mut self, info: &ProcessInfo, _time: i64) {
        self.trace.lock().processes.push(info.clone());
    }

    fn handle_thread_info(&mut self, info: &ThreadInfo, _time: i64) {
        self.trace.lock().threads.push(info.clone());
    }

    fn handle_resource_info(&mut self, info: &ResourceInfo, _time: i64) {
        self.trace.lock().resources.push(info.clone());
    }

    fn handle_trace_start(&mut self, metadata: &BTreeMap<String, String>) {
        self.trace.lock().metadata = metadata.clone();
    }

    fn finalize_trace(
        &mut self,
        _config: &ProfilerConfig,
        buffers: ActivityBuffers,
        end_time: i64,
    ) {
        let mut trace = self.trace.lock();
        trace.buffers = Some(buffers);
        trace.end_time = end_time;
    }
}
