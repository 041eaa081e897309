//! Child profilers and the dynamic plugin adapter
//!
//! A [`ChildProfiler`] contributes activities to a trace through per-collection
//! [`ProfilerSession`]s. [`PluginProfiler`] implements it on top of a
//! separately compiled plugin that only speaks the versioned C interface of
//! `tracelink-plugin-abi`:
//!
//! ```text
//! PluginProfiler ──configure──► PluginProfilerSession ──process_trace──► PluginTraceBuilder
//!   (query once)                 (create .. destroy)                      (C trampolines)
//! ```
//!
//! Every struct crossing the boundary leads with its declared size. The
//! adapter checks it before reading any field and refuses undersized input.

mod builder;
mod session;

pub use builder::PluginTraceBuilder;
pub use session::PluginProfilerSession;

use std::collections::BTreeSet;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use tracelink_plugin_abi as abi;
use tracing::{debug, error};

use crate::activity::{ActivityType, CpuTraceBuffer, ResourceInfo};
use crate::config::ProfilerConfig;
use crate::output::ActivityLogger;
use session::call_entry;

/// Name reported when the plugin cannot be queried
pub const UNKNOWN_PLUGIN_NAME: &str = "N/A";

/// One collection of a child profiler
pub trait ProfilerSession: Send {
    fn start(&mut self);

    fn stop(&mut self);

    /// Collects the session's activities and forwards each one to `logger`
    fn process_trace(&mut self, logger: &mut dyn ActivityLogger);

    fn errors(&self) -> Vec<String>;

    fn resource_infos(&self) -> Vec<ResourceInfo>;

    /// Moves the processed activities out; `None` once taken
    fn take_trace_buffer(&mut self) -> Option<CpuTraceBuffer>;
}

/// A source of activities that runs alongside the main trace
pub trait ChildProfiler: Send {
    fn name(&self) -> &str;

    fn available_activities(&self) -> &BTreeSet<ActivityType>;

    /// Creates a session for `kinds`, or `None` when this profiler has
    /// nothing to contribute
    fn configure(
        &self,
        kinds: &BTreeSet<ActivityType>,
        config: &ProfilerConfig,
    ) -> Option<Box<dyn ProfilerSession>>;

    /// Windowed variant; the window is advisory
    fn configure_window(
        &self,
        _start_ms: i64,
        _duration_ms: i64,
        kinds: &BTreeSet<ActivityType>,
        config: &ProfilerConfig,
    ) -> Option<Box<dyn ProfilerSession>> {
        self.configure(kinds, config)
    }
}

// ============================================================================
// Disabled entry points
// ============================================================================

unsafe extern "C" fn disabled_entry<P>(_params: *mut P) -> c_int {
    abi::PLUGIN_ERROR
}

/// Replaces every entry point with one that fails
fn disable(interface: &mut abi::ProfilerInterface) {
    interface.profiler_create = Some(disabled_entry::<abi::ProfilerCreateParams>);
    interface.profiler_destroy = Some(disabled_entry::<abi::ProfilerDestroyParams>);
    interface.profiler_query = Some(disabled_entry::<abi::ProfilerQueryParams>);
    interface.profiler_start = Some(disabled_entry::<abi::ProfilerStartParams>);
    interface.profiler_stop = Some(disabled_entry::<abi::ProfilerStopParams>);
    interface.profiler_process_events = Some(disabled_entry::<abi::ProfilerProcessEventsParams>);
}

/// Adapter for a plugin profiler
#[derive(Debug)]
pub struct PluginProfiler {
    interface: abi::ProfilerInterface,
    name: String,
    supported: BTreeSet<ActivityType>,
}

impl PluginProfiler {
    /// Validates `interface` and queries the plugin's name and capabilities.
    ///
    /// An interface declaring a size smaller than this build needs is kept
    /// but disabled: every entry point fails and no session is ever valid.
    pub fn new(mut interface: abi::ProfilerInterface) -> Self {
        if interface.unpadded_struct_size < abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE {
            error!(
                declared = interface.unpadded_struct_size,
                required = abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE,
                "plugin profiler has an incompatible version, disabling it"
            );
            disable(&mut interface);
        }

        let mut name_buf: [c_char; abi::PROFILER_NAME_CAPACITY] = [0; abi::PROFILER_NAME_CAPACITY];
        let mut supported_buf = [abi::PROFILE_EVENT_TYPE_INVALID; abi::MAX_SUPPORTED_EVENT_TYPES];
        let mut params = abi::ProfilerQueryParams {
            unpadded_struct_size: abi::PROFILER_QUERY_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: ptr::null_mut(),
            profiler_name: name_buf.as_mut_ptr(),
            profiler_name_max_len: abi::PROFILER_NAME_CAPACITY - 1,
            supported_event_types: supported_buf.as_mut_ptr(),
            supported_event_types_max_len: abi::MAX_SUPPORTED_EVENT_TYPES,
        };

        let code = unsafe { call_entry(interface.profiler_query, &mut params) };
        let (name, supported) = if code != abi::PLUGIN_OK {
            error!(code, "plugin profiler query failed");
            (UNKNOWN_PLUGIN_NAME.to_string(), BTreeSet::new())
        } else {
            // The plugin may have filled the whole buffer
            name_buf[abi::PROFILER_NAME_CAPACITY - 1] = 0;
            let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            let supported = supported_buf
                .iter()
                .take_while(|code| **code != abi::PROFILE_EVENT_TYPE_INVALID)
                .filter_map(|code| ActivityType::from_plugin_code(*code))
                .collect();
            (name, supported)
        };

        debug!(plugin = %name, supported = ?supported, "plugin profiler registered");
        Self {
            interface,
            name,
            supported,
        }
    }

    /// Opens a session regardless of requested kinds
    pub fn create_session(&self) -> PluginProfilerSession {
        PluginProfilerSession::new(self.interface, &self.name)
    }
}

impl ChildProfiler for PluginProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn available_activities(&self) -> &BTreeSet<ActivityType> {
        &self.supported
    }

    /// A session is created when any requested kind is supported
    fn configure(
        &self,
        kinds: &BTreeSet<ActivityType>,
        _config: &ProfilerConfig,
    ) -> Option<Box<dyn ProfilerSession>> {
        if kinds.is_disjoint(&self.supported) {
            debug!(
                plugin = %self.name,
                requested = ?kinds,
                "no requested activity type is supported"
            );
            return None;
        }
        Some(Box::new(self.create_session()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn long_name_query(params: *mut abi::ProfilerQueryParams) -> c_int {
        let params = &mut *params;
        // Writes past max_len into the last slot without a terminator
        for i in 0..abi::PROFILER_NAME_CAPACITY {
            *params.profiler_name.add(i) = b'x' as c_char;
        }
        let kinds = [abi::PROFILE_EVENT_TYPE_CPU_OP, 999, abi::PROFILE_EVENT_TYPE_CUDA_SYNC];
        for (i, kind) in kinds.iter().enumerate() {
            *params.supported_event_types.add(i) = *kind;
        }
        abi::PLUGIN_OK
    }

    fn interface_with_query(query: Option<abi::ProfilerQueryFn>) -> abi::ProfilerInterface {
        abi::ProfilerInterface {
            unpadded_struct_size: abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE,
            profiler_create: None,
            profiler_destroy: None,
            profiler_query: query,
            profiler_start: None,
            profiler_stop: None,
            profiler_process_events: None,
        }
    }

    #[test]
    fn test_name_is_terminated_by_adapter() {
        let profiler = PluginProfiler::new(interface_with_query(Some(long_name_query)));
        assert_eq!(profiler.name().len(), abi::PROFILER_NAME_CAPACITY - 1);
        assert!(profiler.name().chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_unknown_supported_codes_are_skipped() {
        let profiler = PluginProfiler::new(interface_with_query(Some(long_name_query)));
        let expected: BTreeSet<_> =
            [ActivityType::CpuOp, ActivityType::CudaSync].into_iter().collect();
        assert_eq!(profiler.available_activities(), &expected);
    }

    #[test]
    fn test_missing_query_reports_unknown_name() {
        let profiler = PluginProfiler::new(interface_with_query(None));
        assert_eq!(profiler.name(), UNKNOWN_PLUGIN_NAME);
        assert!(profiler.available_activities().is_empty());
    }

    #[test]
    fn test_undersized_interface_is_disabled() {
        let mut interface = interface_with_query(Some(long_name_query));
        interface.unpadded_struct_size = abi::PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE - 1;

        let profiler = PluginProfiler::new(interface);
        assert_eq!(profiler.name(), UNKNOWN_PLUGIN_NAME);

        let session = profiler.create_session();
        assert!(!session.is_valid());
    }

    #[test]
    fn test_failed_create_leaves_inert_session() {
        let profiler = PluginProfiler::new(interface_with_query(Some(long_name_query)));
        let mut session = profiler.create_session();
        assert!(!session.is_valid());
        assert_eq!(session.errors().len(), 1);

        session.start();
        session.stop();
        let mut logger = crate::output::MemoryTraceLogger::new();
        session.process_trace(&mut logger);
        assert!(session.take_trace_buffer().is_none());
        assert_eq!(logger.activity_count(), 0);
        // No further failures are recorded for skipped calls
        assert_eq!(session.errors().len(), 1);
    }
}
