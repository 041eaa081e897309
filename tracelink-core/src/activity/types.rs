//! Activity kinds, flow link kinds and their plugin wire codes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracelink_plugin_abi as abi;

use crate::error::TraceError;

/// Kind of a recorded activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// CPU operation recorded by the instrumented application
    CpuOp,
    /// CPU-side user annotation
    UserAnnotation,
    /// GPU-side span synthesized for a user annotation
    GpuUserAnnotation,
    GpuMemcpy,
    GpuMemset,
    /// Kernel execution
    ConcurrentKernel,
    ExternalCorrelation,
    /// Runtime API call
    CudaRuntime,
    /// Driver API call
    CudaDriver,
    CpuInstantEvent,
    PythonFunction,
    /// Measurement overhead
    Overhead,
    CudaSync,
    GpuPmCounter,
    /// Profiler range markers; off unless explicitly selected
    CudaProfilerRange,
}

impl ActivityType {
    /// Every kind, in declaration order
    pub const ALL: [ActivityType; 15] = [
        ActivityType::CpuOp,
        ActivityType::UserAnnotation,
        ActivityType::GpuUserAnnotation,
        ActivityType::GpuMemcpy,
        ActivityType::GpuMemset,
        ActivityType::ConcurrentKernel,
        ActivityType::ExternalCorrelation,
        ActivityType::CudaRuntime,
        ActivityType::CudaDriver,
        ActivityType::CpuInstantEvent,
        ActivityType::PythonFunction,
        ActivityType::Overhead,
        ActivityType::CudaSync,
        ActivityType::GpuPmCounter,
        ActivityType::CudaProfilerRange,
    ];

    /// Kinds selected when a configuration names none
    pub fn defaults() -> Vec<ActivityType> {
        Self::ALL
            .iter()
            .copied()
            .filter(|kind| *kind != ActivityType::CudaProfilerRange)
            .collect()
    }

    /// Stable name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::CpuOp => "cpu_op",
            ActivityType::UserAnnotation => "user_annotation",
            ActivityType::GpuUserAnnotation => "gpu_user_annotation",
            ActivityType::GpuMemcpy => "gpu_memcpy",
            ActivityType::GpuMemset => "gpu_memset",
            ActivityType::ConcurrentKernel => "concurrent_kernel",
            ActivityType::ExternalCorrelation => "external_correlation",
            ActivityType::CudaRuntime => "cuda_runtime",
            ActivityType::CudaDriver => "cuda_driver",
            ActivityType::CpuInstantEvent => "cpu_instant_event",
            ActivityType::PythonFunction => "python_function",
            ActivityType::Overhead => "overhead",
            ActivityType::CudaSync => "cuda_sync",
            ActivityType::GpuPmCounter => "gpu_pm_counter",
            ActivityType::CudaProfilerRange => "cuda_profiler_range",
        }
    }

    /// Strict translation of a plugin event code.
    ///
    /// Returns `None` for the invalid sentinel and for codes this build does
    /// not know. Used where the plugin declares capabilities.
    pub fn from_plugin_code(code: abi::ProfileEventType) -> Option<ActivityType> {
        let kind = match code {
            abi::PROFILE_EVENT_TYPE_CPU_OP => ActivityType::CpuOp,
            abi::PROFILE_EVENT_TYPE_USER_ANNOTATION => ActivityType::UserAnnotation,
            abi::PROFILE_EVENT_TYPE_GPU_USER_ANNOTATION => ActivityType::GpuUserAnnotation,
            abi::PROFILE_EVENT_TYPE_GPU_MEMCPY => ActivityType::GpuMemcpy,
            abi::PROFILE_EVENT_TYPE_GPU_MEMSET => ActivityType::GpuMemset,
            abi::PROFILE_EVENT_TYPE_CONCURRENT_KERNEL => ActivityType::ConcurrentKernel,
            abi::PROFILE_EVENT_TYPE_EXTERNAL_CORRELATION => ActivityType::ExternalCorrelation,
            abi::PROFILE_EVENT_TYPE_CUDA_RUNTIME => ActivityType::CudaRuntime,
            abi::PROFILE_EVENT_TYPE_CUDA_DRIVER => ActivityType::CudaDriver,
            abi::PROFILE_EVENT_TYPE_CPU_INSTANT_EVENT => ActivityType::CpuInstantEvent,
            abi::PROFILE_EVENT_TYPE_PYTHON_FUNCTION => ActivityType::PythonFunction,
            abi::PROFILE_EVENT_TYPE_OVERHEAD => ActivityType::Overhead,
            abi::PROFILE_EVENT_TYPE_CUDA_SYNC => ActivityType::CudaSync,
            abi::PROFILE_EVENT_TYPE_GPU_PM_COUNTER => ActivityType::GpuPmCounter,
            _ => return None,
        };
        Some(kind)
    }

    /// Lenient translation used for incoming events.
    ///
    /// Unknown codes become `ConcurrentKernel` so the event is kept.
    pub fn from_plugin_code_or_default(code: abi::ProfileEventType) -> ActivityType {
        Self::from_plugin_code(code).unwrap_or_else(|| {
            tracing::debug!(code, "unknown plugin event type, recording as concurrent_kernel");
            ActivityType::ConcurrentKernel
        })
    }

    /// Wire code for this kind, if the plugin interface has one
    pub fn to_plugin_code(&self) -> Option<abi::ProfileEventType> {
        let code = match self {
            ActivityType::CpuOp => abi::PROFILE_EVENT_TYPE_CPU_OP,
            ActivityType::UserAnnotation => abi::PROFILE_EVENT_TYPE_USER_ANNOTATION,
            ActivityType::GpuUserAnnotation => abi::PROFILE_EVENT_TYPE_GPU_USER_ANNOTATION,
            ActivityType::GpuMemcpy => abi::PROFILE_EVENT_TYPE_GPU_MEMCPY,
            ActivityType::GpuMemset => abi::PROFILE_EVENT_TYPE_GPU_MEMSET,
            ActivityType::ConcurrentKernel => abi::PROFILE_EVENT_TYPE_CONCURRENT_KERNEL,
            ActivityType::ExternalCorrelation => abi::PROFILE_EVENT_TYPE_EXTERNAL_CORRELATION,
            ActivityType::CudaRuntime => abi::PROFILE_EVENT_TYPE_CUDA_RUNTIME,
            ActivityType::CudaDriver => abi::PROFILE_EVENT_TYPE_CUDA_DRIVER,
            ActivityType::CpuInstantEvent => abi::PROFILE_EVENT_TYPE_CPU_INSTANT_EVENT,
            ActivityType::PythonFunction => abi::PROFILE_EVENT_TYPE_PYTHON_FUNCTION,
            ActivityType::Overhead => abi::PROFILE_EVENT_TYPE_OVERHEAD,
            ActivityType::CudaSync => abi::PROFILE_EVENT_TYPE_CUDA_SYNC,
            ActivityType::GpuPmCounter => abi::PROFILE_EVENT_TYPE_GPU_PM_COUNTER,
            ActivityType::CudaProfilerRange => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TraceError::InvalidConfig {
                reason: format!("unknown activity type '{}'", s),
            })
    }
}

/// Kind of flow link between two activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    None,
    /// Forward to backward pass
    FwdBwd,
    /// CPU launch to asynchronous GPU work
    AsyncCpuGpu,
}

impl LinkType {
    /// Translates a plugin flow code; unknown codes mean no link.
    pub fn from_plugin_code(code: abi::ProfileEventFlowType) -> LinkType {
        match code {
            abi::PROFILE_EVENT_FLOW_TYPE_FWD_BWD => LinkType::FwdBwd,
            abi::PROFILE_EVENT_FLOW_TYPE_ASYNC_CPU_GPU => LinkType::AsyncCpuGpu,
            _ => LinkType::None,
        }
    }
}
