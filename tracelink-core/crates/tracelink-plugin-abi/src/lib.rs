//! Tracelink plugin ABI
//!
//! The pure-data C interface a separately compiled profiler plugin implements.
//! Nothing here refers to collector types: both sides only share the
//! `#[repr(C)]` structures, integer codes and function pointer shapes below.
//!
//! ## Versioning
//!
//! Every structure that crosses the boundary leads with `unpadded_struct_size`,
//! filled by whoever allocates the structure with the `*_UNPADDED_STRUCT_SIZE`
//! constant it was compiled against. Fields are only ever appended. A receiver
//! compares the declared size with the end of the last field it wants to read
//! and never reads past the declared size, so an older caller simply looks like
//! one whose newer fields are absent.
//!
//! ## Entry points
//!
//! ```text
//! ProfilerInterface
//!   ├─ profiler_create          -> opaque ProfilerHandle
//!   ├─ profiler_destroy
//!   ├─ profiler_query           -> name + supported event types
//!   ├─ profiler_start
//!   ├─ profiler_stop
//!   └─ profiler_process_events  -> calls back through TraceBuilder
//! ```
//!
//! All entry points return `PLUGIN_OK` (0) on success. Any other value is a
//! failure; the collector itself reports `PLUGIN_ERROR` for rejected calls.

use std::mem::{offset_of, size_of};
use std::os::raw::{c_char, c_int};

/// Successful return code
pub const PLUGIN_OK: c_int = 0;

/// Distinguished failure code for rejected or failed boundary calls
pub const PLUGIN_ERROR: c_int = -1;

/// Byte offset just past `$field` of `$ty`.
#[macro_export]
macro_rules! field_end {
    ($ty:ty, $field:ident: $field_ty:ty) => {
        ::std::mem::offset_of!($ty, $field) + ::std::mem::size_of::<$field_ty>()
    };
}

// ============================================================================
// Event and flow codes
// ============================================================================

/// Wire-level event type code
pub type ProfileEventType = c_int;

/// Sentinel that terminates the supported-type array
pub const PROFILE_EVENT_TYPE_INVALID: ProfileEventType = 0;
pub const PROFILE_EVENT_TYPE_CPU_OP: ProfileEventType = 1;
pub const PROFILE_EVENT_TYPE_USER_ANNOTATION: ProfileEventType = 2;
pub const PROFILE_EVENT_TYPE_GPU_USER_ANNOTATION: ProfileEventType = 3;
pub const PROFILE_EVENT_TYPE_GPU_MEMCPY: ProfileEventType = 4;
pub const PROFILE_EVENT_TYPE_GPU_MEMSET: ProfileEventType = 5;
pub const PROFILE_EVENT_TYPE_CONCURRENT_KERNEL: ProfileEventType = 6;
pub const PROFILE_EVENT_TYPE_EXTERNAL_CORRELATION: ProfileEventType = 7;
pub const PROFILE_EVENT_TYPE_CUDA_RUNTIME: ProfileEventType = 8;
pub const PROFILE_EVENT_TYPE_CUDA_DRIVER: ProfileEventType = 9;
pub const PROFILE_EVENT_TYPE_CPU_INSTANT_EVENT: ProfileEventType = 10;
pub const PROFILE_EVENT_TYPE_PYTHON_FUNCTION: ProfileEventType = 11;
pub const PROFILE_EVENT_TYPE_OVERHEAD: ProfileEventType = 12;
pub const PROFILE_EVENT_TYPE_CUDA_SYNC: ProfileEventType = 13;
pub const PROFILE_EVENT_TYPE_GPU_PM_COUNTER: ProfileEventType = 14;

/// Wire-level flow type code
pub type ProfileEventFlowType = c_int;

pub const PROFILE_EVENT_FLOW_TYPE_INVALID: ProfileEventFlowType = 0;
pub const PROFILE_EVENT_FLOW_TYPE_FWD_BWD: ProfileEventFlowType = 1;
pub const PROFILE_EVENT_FLOW_TYPE_ASYNC_CPU_GPU: ProfileEventFlowType = 2;

/// Capacity of the name buffer the collector hands to `profiler_query`
pub const PROFILER_NAME_CAPACITY: usize = 32;

/// Capacity of the supported-type array the collector hands to `profiler_query`
pub const MAX_SUPPORTED_EVENT_TYPES: usize = 64;

// ============================================================================
// Opaque handles
// ============================================================================

/// Plugin-owned profiler state. Never dereferenced by the collector.
#[repr(C)]
pub struct ProfilerHandle {
    _opaque: [u8; 0],
}

/// Collector-owned trace builder state. Never dereferenced by the plugin.
#[repr(C)]
pub struct TraceBuilderHandle {
    _opaque: [u8; 0],
}

// ============================================================================
// Profiler entry point parameters
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerCreateParams {
    pub unpadded_struct_size: usize,
    /// Out: handle for the new profiler instance
    pub profiler_handle: *mut ProfilerHandle,
}

pub const PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerCreateParams, profiler_handle: *mut ProfilerHandle);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerDestroyParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut ProfilerHandle,
}

pub const PROFILER_DESTROY_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerDestroyParams, profiler_handle: *mut ProfilerHandle);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerQueryParams {
    pub unpadded_struct_size: usize,
    /// Null: the query is issued before any instance exists
    pub profiler_handle: *mut ProfilerHandle,
    /// Out: null-terminated display name
    pub profiler_name: *mut c_char,
    /// Longest name the plugin may write, excluding the terminator
    pub profiler_name_max_len: usize,
    /// Out: supported event types, unused slots set to `PROFILE_EVENT_TYPE_INVALID`
    pub supported_event_types: *mut ProfileEventType,
    pub supported_event_types_max_len: usize,
}

pub const PROFILER_QUERY_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerQueryParams, supported_event_types_max_len: usize);

/// Declared size of a query struct that predates the supported-type array
pub const PROFILER_QUERY_PARAMS_NAME_ONLY_STRUCT_SIZE: usize =
    field_end!(ProfilerQueryParams, profiler_name_max_len: usize);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerStartParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut ProfilerHandle,
}

pub const PROFILER_START_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerStartParams, profiler_handle: *mut ProfilerHandle);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerStopParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut ProfilerHandle,
}

pub const PROFILER_STOP_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerStopParams, profiler_handle: *mut ProfilerHandle);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerProcessEventsParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut ProfilerHandle,
    /// Valid only for the duration of the call
    pub trace_builder: *const TraceBuilder,
}

pub const PROFILER_PROCESS_EVENTS_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerProcessEventsParams, trace_builder: *const TraceBuilder);

// ============================================================================
// Event intake structures
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileEvent {
    pub unpadded_struct_size: usize,
    pub event_type: ProfileEventType,
    pub start_time_utc_ns: i64,
    pub end_time_utc_ns: i64,
    pub event_id: i64,
    pub device_id: i32,
    pub resource_id: i32,
    /// Appended after the first release. Absent (treated as 0) when the
    /// declared size stops at `resource_id`.
    pub thread_id: i32,
}

pub const PROFILE_EVENT_UNPADDED_STRUCT_SIZE: usize = field_end!(ProfileEvent, thread_id: i32);

/// Smallest declared size a collector accepts for `ProfileEvent`
pub const PROFILE_EVENT_MIN_STRUCT_SIZE: usize = field_end!(ProfileEvent, resource_id: i32);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileEventFlow {
    pub unpadded_struct_size: usize,
    pub flow_id: u32,
    pub flow_type: ProfileEventFlowType,
    pub is_start_point: bool,
}

pub const PROFILE_EVENT_FLOW_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfileEventFlow, is_start_point: bool);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileResourceInfo {
    pub unpadded_struct_size: usize,
    pub device_id: i64,
    pub resource_id: i64,
    pub display_order: i64,
    /// Optional; the resource id is used as the name when null
    pub name: *const c_char,
}

pub const PROFILE_RESOURCE_INFO_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfileResourceInfo, name: *const c_char);

// ============================================================================
// Function pointer shapes
// ============================================================================

pub type AddEventFn =
    unsafe extern "C" fn(*mut TraceBuilderHandle, *const ProfileEvent) -> c_int;
pub type SetLastEventNameFn =
    unsafe extern "C" fn(*mut TraceBuilderHandle, *const c_char) -> c_int;
pub type SetLastEventFlowFn =
    unsafe extern "C" fn(*mut TraceBuilderHandle, *const ProfileEventFlow) -> c_int;
pub type AddLastEventMetadataFn =
    unsafe extern "C" fn(*mut TraceBuilderHandle, *const c_char, *const c_char) -> c_int;
pub type AddResourceInfoFn =
    unsafe extern "C" fn(*mut TraceBuilderHandle, *const ProfileResourceInfo) -> c_int;

/// Callback table the collector hands to `profiler_process_events`.
///
/// Every function must be called with `trace_builder_handle` as its first
/// argument.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TraceBuilder {
    pub unpadded_struct_size: usize,
    pub trace_builder_handle: *mut TraceBuilderHandle,
    pub add_event: Option<AddEventFn>,
    pub set_last_event_name: Option<SetLastEventNameFn>,
    pub set_last_event_flow: Option<SetLastEventFlowFn>,
    pub add_last_event_metadata: Option<AddLastEventMetadataFn>,
    pub add_resource_info: Option<AddResourceInfoFn>,
}

pub const TRACE_BUILDER_UNPADDED_STRUCT_SIZE: usize =
    field_end!(TraceBuilder, add_resource_info: Option<AddResourceInfoFn>);

pub type ProfilerCreateFn = unsafe extern "C" fn(*mut ProfilerCreateParams) -> c_int;
pub type ProfilerDestroyFn = unsafe extern "C" fn(*mut ProfilerDestroyParams) -> c_int;
pub type ProfilerQueryFn = unsafe extern "C" fn(*mut ProfilerQueryParams) -> c_int;
pub type ProfilerStartFn = unsafe extern "C" fn(*mut ProfilerStartParams) -> c_int;
pub type ProfilerStopFn = unsafe extern "C" fn(*mut ProfilerStopParams) -> c_int;
pub type ProfilerProcessEventsFn = unsafe extern "C" fn(*mut ProfilerProcessEventsParams) -> c_int;

/// Entry point table a plugin exports.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfilerInterface {
    pub unpadded_struct_size: usize,
    pub profiler_create: Option<ProfilerCreateFn>,
    pub profiler_destroy: Option<ProfilerDestroyFn>,
    pub profiler_query: Option<ProfilerQueryFn>,
    pub profiler_start: Option<ProfilerStartFn>,
    pub profiler_stop: Option<ProfilerStopFn>,
    pub profiler_process_events: Option<ProfilerProcessEventsFn>,
}

pub const PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE: usize =
    field_end!(ProfilerInterface, profiler_process_events: Option<ProfilerProcessEventsFn>);

/// Reads the declared size every boundary structure leads with.
///
/// # Safety
///
/// `ptr` must be non-null and point to at least `size_of::<usize>()` readable,
/// suitably aligned bytes.
pub unsafe fn declared_size<T>(ptr: *const T) -> usize {
    ptr.cast::<usize>().read()
}

// The size field must come first in every boundary structure.
const _: () = {
    assert!(offset_of!(ProfileEvent, unpadded_struct_size) == 0);
    assert!(offset_of!(ProfileEventFlow, unpadded_struct_size) == 0);
    assert!(offset_of!(ProfileResourceInfo, unpadded_struct_size) == 0);
    assert!(offset_of!(TraceBuilder, unpadded_struct_size) == 0);
    assert!(offset_of!(ProfilerInterface, unpadded_struct_size) == 0);
    assert!(PROFILE_EVENT_MIN_STRUCT_SIZE < PROFILE_EVENT_UNPADDED_STRUCT_SIZE);
    assert!(PROFILE_EVENT_UNPADDED_STRUCT_SIZE <= size_of::<ProfileEvent>());
};
