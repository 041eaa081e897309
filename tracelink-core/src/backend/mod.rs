//! Hardware activity backend
//!
//! The backend is an external collaborator: it enables hardware activity
//! tracing and, on demand, hands back the raw records it buffered. How it
//! buffers and flushes is its own business. [`ScriptedBackend`] replays
//! records queued by the caller and is used in tests.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::activity::ActivityType;

/// Runtime callback ids of frequent calls dropped from traces
pub const CBID_CUDA_GET_LAST_ERROR: u32 = 10;
pub const CBID_CUDA_SET_DEVICE: u32 = 16;
pub const CBID_CUDA_GET_DEVICE: u32 = 17;
pub const CBID_CUDA_MEMCPY: u32 = 31;
pub const CBID_CUDA_LAUNCH_KERNEL: u32 = 211;

/// Runtime calls too frequent and too uninteresting to keep
pub(crate) fn is_ignored_runtime_call(cbid: u32) -> bool {
    matches!(
        cbid,
        CBID_CUDA_GET_LAST_ERROR | CBID_CUDA_SET_DEVICE | CBID_CUDA_GET_DEVICE
    )
}

/// Source of an external correlation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCorrelationKind {
    /// Operator correlation
    Custom0,
    /// User annotation correlation
    Custom1,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    Unknown,
    HtoD,
    DtoH,
    HtoA,
    AtoH,
    AtoA,
    AtoD,
    DtoA,
    DtoD,
    HtoH,
    PtoP,
}

impl fmt::Display for MemcpyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemcpyKind::Unknown => "Unknown",
            MemcpyKind::HtoD => "HtoD",
            MemcpyKind::DtoH => "DtoH",
            MemcpyKind::HtoA => "HtoA",
            MemcpyKind::AtoH => "AtoH",
            MemcpyKind::AtoA => "AtoA",
            MemcpyKind::AtoD => "AtoD",
            MemcpyKind::DtoA => "DtoA",
            MemcpyKind::DtoD => "DtoD",
            MemcpyKind::HtoH => "HtoH",
            MemcpyKind::PtoP => "PtoP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Unknown,
    Pageable,
    Pinned,
    Device,
    Array,
    Managed,
    DeviceStatic,
    ManagedStatic,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryKind::Unknown => "Unknown",
            MemoryKind::Pageable => "Pageable",
            MemoryKind::Pinned => "Pinned",
            MemoryKind::Device => "Device",
            MemoryKind::Array => "Array",
            MemoryKind::Managed => "Managed",
            MemoryKind::DeviceStatic => "Device Static",
            MemoryKind::ManagedStatic => "Managed Static",
        };
        f.write_str(name)
    }
}

/// One raw record from the hardware backend. Times are nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Links a low-level correlation id to an external one
    ExternalCorrelation {
        correlation_id: u32,
        kind: ExternalCorrelationKind,
        external_id: u64,
    },
    Runtime {
        cbid: u32,
        name: String,
        start: i64,
        end: i64,
        correlation_id: u32,
        process_id: i32,
        /// Low 32 bits of the calling pthread id
        thread_id: i32,
    },
    Kernel {
        name: String,
        device: i64,
        stream: i64,
        start: i64,
        end: i64,
        correlation_id: u32,
    },
    Memcpy {
        device: i64,
        stream: i64,
        start: i64,
        end: i64,
        correlation_id: u32,
        copy_kind: MemcpyKind,
        src_kind: MemoryKind,
        dst_kind: MemoryKind,
        bytes: u64,
    },
    Memset {
        device: i64,
        stream: i64,
        start: i64,
        end: i64,
        correlation_id: u32,
        memory_kind: MemoryKind,
        bytes: u64,
    },
    /// Record kind this core does not handle
    Unsupported { kind: u32 },
}

/// Hardware activity tracing capability
pub trait ActivityBackend: Send {
    fn enable_activities(&mut self, kinds: &[ActivityType]);

    fn disable_activities(&mut self, kinds: &[ActivityType]);

    /// Drops everything buffered so far
    fn clear_activities(&mut self);

    fn set_max_buffer_size(&mut self, mb: u64);

    /// Drains buffered records
    fn activity_records(&mut self) -> Vec<RawRecord>;

    /// Average cost of the last flush, in microseconds
    fn flush_overhead_us(&self) -> i64 {
        0
    }

    /// True once the backend ran out of buffer space
    fn stop_collection(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    records: Vec<RawRecord>,
    enabled: Vec<ActivityType>,
    enable_calls: usize,
    disable_calls: usize,
    clear_calls: usize,
    max_buffer_size_mb: u64,
    flush_overhead_us: i64,
    stop_collection: bool,
}

/// In-memory backend that replays queued records
///
/// Clones share state, so the test keeps one handle while the profiler owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: RawRecord) {
        self.state.lock().records.push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = RawRecord>) {
        self.state.lock().records.extend(records);
    }

    /// Simulates running out of buffer space
    pub fn set_stop_collection(&self, stop: bool) {
        self.state.lock().stop_collection = stop;
    }

    pub fn set_flush_overhead_us(&self, us: i64) {
        self.state.lock().flush_overhead_us = us;
    }

    pub fn enabled_kinds(&self) -> Vec<ActivityType> {
        self.state.lock().enabled.clone()
    }

    pub fn enable_calls(&self) -> usize {
        self.state.lock().enable_calls
    }

    pub fn disable_calls(&self) -> usize {
        self.state.lock().disable_calls
    }

    pub fn clear_calls(&self) -> usize {
        self.state.lock().clear_calls
    }

    pub fn max_buffer_size_mb(&self) -> u64 {
        self.state.lock().max_buffer_size_mb
    }

    pub fn pending(&self) -> usize {
        self.state.lock().records.len()
    }
}

impl ActivityBackend for ScriptedBackend {
    fn enable_activities(&mut self, kinds: &[ActivityType]) {
        let mut state = self.state.lock();
        state.enable_calls += 1;
        state.enabled = kinds.to_vec();
    }

    fn disable_activities(&mut self, _kinds: &[ActivityType]) {
        let mut state = self.state.lock();
        state.disable_calls += 1;
        state.enabled.clear();
    }

    fn clear_activities(&mut self) {
        let mut state = self.state.lock();
        state.clear_calls += 1;
        state.records.clear();
    }

    fn set_max_buffer_size(&mut self, mb: u64) {
        self.state.lock().max_buffer_size_mb = mb;
    }

    fn activity_records(&mut self) -> Vec<RawRecord> {
        std::mem::take(&mut self.state.lock().records)
    }

    fn flush_overhead_us(&self) -> i64 {
        self.state.lock().flush_overhead_us
    }

    fn stop_collection(&self) -> bool {
        self.state.lock().stop_collection
    }
}
