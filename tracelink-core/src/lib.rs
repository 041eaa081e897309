//! # Tracelink Core - Activity Trace Collection
//!
//! Tracelink merges timestamped activities from independent producers into
//! one coherent trace:
//!
//! - **Application**: hands over finished CPU traces, one span at a time
//! - **Hardware backend**: yields raw kernel, memcpy, memset and runtime records
//! - **Plugins**: separately compiled profilers speaking a versioned C interface
//!
//! ## Modules
//!
//! - [`profiler`]: the trace lifecycle state machine ([`TraceController`])
//! - [`controller`]: the control thread driving it
//! - [`trace`]: correlation index, span registry and GPU span synthesis
//! - [`plugin`]: adapter for profiler plugins
//! - [`backend`]: hardware backend capability and a scripted implementation
//! - [`output`]: logger trait and the in-memory logger
//!
//! ## Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use tracelink_core::{
//!     Activity, ActivityType, CpuTraceBuffer, MemoryTraceLogger, ProfilerConfig, TraceController,
//!     TraceSpan,
//! };
//!
//! let profiler = TraceController::cpu_only();
//! let now = Utc::now();
//! profiler.configure(&ProfilerConfig::default(), now).unwrap();
//! profiler.start_trace(now);
//!
//! let start = tracelink_core::activity::to_ns(now);
//! let mut buffer = CpuTraceBuffer::new(TraceSpan::new(start, start + 1_000, "forward"));
//! let op = Activity::new(ActivityType::CpuOp, "aten::mm", start + 10, start + 500);
//! buffer.push(op.with_correlation(1));
//! profiler.transfer_cpu_trace(buffer);
//!
//! profiler.stop_trace(now + Duration::milliseconds(1));
//! let mut logger = MemoryTraceLogger::new();
//! profiler.process_trace(&mut logger);
//! profiler.reset();
//!
//! assert_eq!(logger.activities()[0].name, "aten::mm");
//! ```

pub mod activity;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod output;
pub mod plugin;
pub mod profiler;
pub mod trace;

/// The C interface shared with plugins
pub use tracelink_plugin_abi as abi;

// Re-export main types
pub use activity::{
    Activity, ActivityBuffers, ActivityType, CpuTraceBuffer, Flow, LinkType, ResourceInfo,
    ThreadInfo, TraceSpan,
};
pub use backend::{ActivityBackend, RawRecord, ScriptedBackend};
pub use config::ProfilerConfig;
pub use controller::ActivityProfilerController;
pub use error::{ErrorCategory, Result, TraceError};
pub use output::{ActivityLogger, ActivityTrace, MemoryTraceLogger};
pub use plugin::{ChildProfiler, PluginProfiler, PluginProfilerSession, ProfilerSession};
pub use profiler::{RunloopState, TraceClient, TraceController};
pub use trace::{CorrelationFlow, CorrelationIndex, GpuSpanSynthesizer, TraceSpanRegistry};
