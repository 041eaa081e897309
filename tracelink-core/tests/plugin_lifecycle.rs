//! Plugin lifecycle tests
//!
//! Drives a mock plugin through the C interface the same way a separately
//! compiled profiler would be driven.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::os::raw::{c_char, c_int};
use std::ptr::NonNull;

use tracelink_core::abi;
use tracelink_core::{
    ActivityType, ChildProfiler, MemoryTraceLogger, PluginProfiler, ProfilerConfig, ProfilerSession,
};

const BASE_TIME_NS: i64 = 1_000_000_000;

thread_local! {
    static LIVE_HANDLES: Cell<i32> = const { Cell::new(0) };
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
    static FAIL_PROCESS: Cell<bool> = const { Cell::new(false) };
}

fn live_handles() -> i32 {
    LIVE_HANDLES.with(Cell::get)
}

fn is_active() -> bool {
    ACTIVE.with(Cell::get)
}

// ============================================================================
// Mock plugin
// ============================================================================

unsafe extern "C" fn mock_create(params: *mut abi::ProfilerCreateParams) -> c_int {
    LIVE_HANDLES.with(|n| n.set(n.get() + 1));
    (*params).profiler_handle = NonNull::<abi::ProfilerHandle>::dangling().as_ptr();
    abi::PLUGIN_OK
}

unsafe extern "C" fn mock_destroy(_params: *mut abi::ProfilerDestroyParams) -> c_int {
    LIVE_HANDLES.with(|n| n.set(n.get() - 1));
    abi::PLUGIN_OK
}

unsafe extern "C" fn mock_query(params: *mut abi::ProfilerQueryParams) -> c_int {
    let params = &mut *params;
    let name = b"MockPlugin";
    let len = name.len().min(params.profiler_name_max_len);
    for (i, byte) in name.iter().take(len).enumerate() {
        *params.profiler_name.add(i) = *byte as c_char;
    }
    *params.profiler_name.add(len) = 0;

    let supported = [
        abi::PROFILE_EVENT_TYPE_CUDA_RUNTIME,
        abi::PROFILE_EVENT_TYPE_CUDA_DRIVER,
        abi::PROFILE_EVENT_TYPE_CONCURRENT_KERNEL,
        abi::PROFILE_EVENT_TYPE_GPU_MEMCPY,
    ];
    if !params.supported_event_types.is_null()
        && params.supported_event_types_max_len > supported.len()
    {
        for i in 0..params.supported_event_types_max_len {
            let code = supported.get(i).copied().unwrap_or(abi::PROFILE_EVENT_TYPE_INVALID);
            *params.supported_event_types.add(i) = code;
        }
    }
    abi::PLUGIN_OK
}

unsafe extern "C" fn mock_start(_params: *mut abi::ProfilerStartParams) -> c_int {
    ACTIVE.with(|a| a.set(true));
    abi::PLUGIN_OK
}

unsafe extern "C" fn mock_stop(_params: *mut abi::ProfilerStopParams) -> c_int {
    ACTIVE.with(|a| a.set(false));
    abi::PLUGIN_OK
}

fn event(
    event_type: abi::ProfileEventType,
    start: i64,
    end: i64,
    id: i64,
    resource: i32,
) -> abi::ProfileEvent {
    abi::ProfileEvent {
        unpadded_struct_size: abi::PROFILE_EVENT_UNPADDED_STRUCT_SIZE,
        event_type,
        start_time_utc_ns: BASE_TIME_NS + start,
        end_time_utc_ns: BASE_TIME_NS + end,
        event_id: id,
        device_id: 0,
        resource_id: resource,
        thread_id: 0,
    }
}

unsafe extern "C" fn mock_process_events(params: *mut abi::ProfilerProcessEventsParams) -> c_int {
    if FAIL_PROCESS.with(Cell::get) {
        return 7;
    }
    let tb = &*(*params).trace_builder;
    let (Some(add_event), Some(set_name)) = (tb.add_event, tb.set_last_event_name) else {
        return abi::PLUGIN_ERROR;
    };

    let events = [
        (event(abi::PROFILE_EVENT_TYPE_CUDA_RUNTIME, 0, 5_000, 1, 123), c"cudaLaunchKernel"),
        (event(abi::PROFILE_EVENT_TYPE_CUDA_DRIVER, 10_000, 15_000, 2, 124), c"cuLaunchKernel"),
        (event(abi::PROFILE_EVENT_TYPE_CONCURRENT_KERNEL, 20_000, 50_000, 3, 1), c"test_kernel"),
        (event(abi::PROFILE_EVENT_TYPE_GPU_MEMCPY, 60_000, 70_000, 4, 2), c"cudaMemcpyHtoD"),
    ];
    for (ev, name) in &events {
        if add_event(tb.trace_builder_handle, ev) != abi::PLUGIN_OK {
            return abi::PLUGIN_ERROR;
        }
        set_name(tb.trace_builder_handle, name.as_ptr());
    }
    abi::PLUGIN_OK
}

fn mock_interface() -> abi::ProfilerInterface {
    abi::ProfilerInterface {
        unpadded_struct_size: abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE,
        profiler_create: Some(mock_create),
        profiler_destroy: Some(mock_destroy),
        profiler_query: Some(mock_query),
        profiler_start: Some(mock_start),
        profiler_stop: Some(mock_stop),
        profiler_process_events: Some(mock_process_events),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_query_reports_name_and_capabilities() {
    let profiler = PluginProfiler::new(mock_interface());

    assert_eq!(profiler.name(), "MockPlugin");
    let expected: BTreeSet<_> = [
        ActivityType::CudaRuntime,
        ActivityType::CudaDriver,
        ActivityType::ConcurrentKernel,
        ActivityType::GpuMemcpy,
    ]
    .into_iter()
    .collect();
    assert_eq!(profiler.available_activities(), &expected);
    assert_eq!(live_handles(), 0);
}

#[test]
fn test_session_lifecycle() {
    let profiler = PluginProfiler::new(mock_interface());
    let kinds = profiler.available_activities().clone();

    let mut session = profiler
        .configure(&kinds, &ProfilerConfig::default())
        .expect("supported kinds yield a session");
    assert_eq!(live_handles(), 1);
    assert!(!is_active());

    session.start();
    assert!(is_active());
    session.stop();
    assert!(!is_active());
    assert!(session.errors().is_empty());

    drop(session);
    assert_eq!(live_handles(), 0);
}

#[test]
fn test_windowed_configure_creates_session() {
    let profiler = PluginProfiler::new(mock_interface());
    let kinds: BTreeSet<_> = [ActivityType::ConcurrentKernel].into_iter().collect();
    let config = ProfilerConfig::default();

    let session = profiler.configure_window(0, 500, &kinds, &config);
    assert!(session.is_some());
    assert_eq!(live_handles(), 1);
    drop(session);

    let cpu_only: BTreeSet<_> = [ActivityType::CpuOp].into_iter().collect();
    assert!(profiler.configure_window(0, 500, &cpu_only, &config).is_none());
    assert_eq!(live_handles(), 0);
}

#[test]
fn test_dropping_unstarted_session_destroys_handle() {
    let profiler = PluginProfiler::new(mock_interface());
    let kinds: BTreeSet<_> = [ActivityType::GpuMemcpy].into_iter().collect();

    let session = profiler.configure(&kinds, &ProfilerConfig::default());
    assert!(session.is_some());
    assert_eq!(live_handles(), 1);

    drop(session);
    assert_eq!(live_handles(), 0);
    assert!(!is_active());
}

#[test]
fn test_process_trace_builds_events() {
    let profiler = PluginProfiler::new(mock_interface());
    let kinds: BTreeSet<_> = [ActivityType::CudaRuntime, ActivityType::CpuOp].into_iter().collect();

    let mut session = profiler
        .configure(&kinds, &ProfilerConfig::default())
        .expect("partial overlap is enough");
    session.start();
    session.stop();

    let mut logger = MemoryTraceLogger::new();
    session.process_trace(&mut logger);
    assert_eq!(logger.activity_count(), 4);

    let buffer = session.take_trace_buffer().expect("events were reported");
    assert_eq!(buffer.span.name, "MockPlugin");

    let expected = [
        (ActivityType::CudaRuntime, "cudaLaunchKernel", 0, 5_000, 1, 123),
        (ActivityType::CudaDriver, "cuLaunchKernel", 10_000, 15_000, 2, 124),
        (ActivityType::ConcurrentKernel, "test_kernel", 20_000, 50_000, 3, 1),
        (ActivityType::GpuMemcpy, "cudaMemcpyHtoD", 60_000, 70_000, 4, 2),
    ];
    assert_eq!(buffer.activities.len(), expected.len());
    for (activity, expected) in buffer.activities.iter().zip(expected) {
        let (kind, name, start, end, id, resource) = expected;
        assert_eq!(activity.kind, kind);
        assert_eq!(activity.name, name);
        assert_eq!(activity.start_time, BASE_TIME_NS + start);
        assert_eq!(activity.end_time, BASE_TIME_NS + end);
        assert_eq!(activity.id, id);
        assert_eq!(activity.resource, resource);
    }

    assert!(session.take_trace_buffer().is_none());
    assert!(session.errors().is_empty());
}

#[test]
fn test_unsupported_kinds_yield_no_session() {
    let profiler = PluginProfiler::new(mock_interface());
    let config = ProfilerConfig::default();

    let cpu_only: BTreeSet<_> = [ActivityType::CpuOp].into_iter().collect();
    assert!(profiler.configure(&cpu_only, &config).is_none());
    assert!(profiler.configure(&BTreeSet::new(), &config).is_none());
    assert_eq!(live_handles(), 0);
}

#[test]
fn test_failed_process_events_is_recorded() {
    FAIL_PROCESS.with(|f| f.set(true));
    let profiler = PluginProfiler::new(mock_interface());
    let kinds = profiler.available_activities().clone();
    let mut session = profiler.configure(&kinds, &ProfilerConfig::default()).unwrap();

    session.start();
    session.stop();
    let mut logger = MemoryTraceLogger::new();
    session.process_trace(&mut logger);

    assert_eq!(logger.activity_count(), 0);
    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("profiler_process_events"));
    FAIL_PROCESS.with(|f| f.set(false));
}

#[test]
fn test_undersized_interface_never_creates_sessions() {
    let mut interface = mock_interface();
    interface.unpadded_struct_size = abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE - 8;
    let profiler = PluginProfiler::new(interface);

    assert_eq!(profiler.name(), tracelink_core::plugin::UNKNOWN_PLUGIN_NAME);
    assert!(profiler.available_activities().is_empty());

    let mut session = profiler.create_session();
    assert!(!session.is_valid());
    session.start();
    assert!(!is_active());
    assert_eq!(live_handles(), 0);
}

#[test]
fn test_null_entry_points_fail_cleanly() {
    let mut interface = mock_interface();
    interface.profiler_process_events = None;
    let profiler = PluginProfiler::new(interface);
    let kinds = profiler.available_activities().clone();
    let mut session = profiler.configure(&kinds, &ProfilerConfig::default()).unwrap();

    let mut logger = MemoryTraceLogger::new();
    session.process_trace(&mut logger);
    assert_eq!(session.errors().len(), 1);
}
