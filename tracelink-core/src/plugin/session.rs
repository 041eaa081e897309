//! One collection of a plugin profiler

use std::os::raw::c_int;
use std::ptr;

use chrono::Utc;
use tracelink_plugin_abi as abi;
use tracing::{debug, error};

use super::builder::PluginTraceBuilder;
use super::ProfilerSession;
use crate::activity::{to_ns, CpuTraceBuffer, ResourceInfo, TraceSpan};
use crate::error::TraceError;
use crate::output::ActivityLogger;

/// Calls a plugin entry point, treating a missing pointer as failure
pub(super) unsafe fn call_entry<P>(
    entry: Option<unsafe extern "C" fn(*mut P) -> c_int>,
    params: &mut P,
) -> c_int {
    match entry {
        Some(f) => f(params),
        None => abi::PLUGIN_ERROR,
    }
}

/// Owns one plugin profiler handle from create to destroy
///
/// If create fails the handle stays null and every later operation is a
/// silent no-op, so one broken plugin cannot hold up a collection.
pub struct PluginProfilerSession {
    interface: abi::ProfilerInterface,
    name: String,
    handle: *mut abi::ProfilerHandle,
    trace_buffer: Option<CpuTraceBuffer>,
    resource_infos: Vec<ResourceInfo>,
    errors: Vec<String>,
    last_start_ns: i64,
    last_stop_ns: i64,
}

// The handle is only ever passed back to the plugin that created it, and the
// session is used by one thread at a time.
unsafe impl Send for PluginProfilerSession {}

impl PluginProfilerSession {
    pub(crate) fn new(interface: abi::ProfilerInterface, name: &str) -> Self {
        let mut session = Self {
            interface,
            name: name.to_string(),
            handle: ptr::null_mut(),
            trace_buffer: None,
            resource_infos: Vec::new(),
            errors: Vec::new(),
            last_start_ns: 0,
            last_stop_ns: 0,
        };

        let mut params = abi::ProfilerCreateParams {
            unpadded_struct_size: abi::PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: ptr::null_mut(),
        };
        let code = unsafe { call_entry(session.interface.profiler_create, &mut params) };
        if code != abi::PLUGIN_OK {
            session.record_failure("profiler_create", code);
        } else {
            session.handle = params.profiler_handle;
            debug!(plugin = %session.name, "plugin session created");
        }
        session
    }

    fn record_failure(&mut self, entry_point: &'static str, code: c_int) {
        let err = TraceError::PluginCallFailed {
            plugin: self.name.clone(),
            entry_point,
            code,
        };
        error!(plugin = %self.name, entry_point, code, "{}", err);
        self.errors.push(err.to_string());
    }

    /// False when create failed
    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ProfilerSession for PluginProfilerSession {
    fn start(&mut self) {
        self.last_start_ns = to_ns(Utc::now());
        if self.handle.is_null() {
            return;
        }
        let mut params = abi::ProfilerStartParams {
            unpadded_struct_size: abi::PROFILER_START_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: self.handle,
        };
        let code = unsafe { call_entry(self.interface.profiler_start, &mut params) };
        if code != abi::PLUGIN_OK {
            self.record_failure("profiler_start", code);
        }
    }

    fn stop(&mut self) {
        self.last_stop_ns = to_ns(Utc::now());
        if self.handle.is_null() {
            return;
        }
        let mut params = abi::ProfilerStopParams {
            unpadded_struct_size: abi::PROFILER_STOP_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: self.handle,
        };
        let code = unsafe { call_entry(self.interface.profiler_stop, &mut params) };
        if code != abi::PLUGIN_OK {
            self.record_failure("profiler_stop", code);
        }
    }

    fn process_trace(&mut self, logger: &mut dyn ActivityLogger) {
        if self.handle.is_null() {
            return;
        }

        let span = TraceSpan::new(self.last_start_ns, self.last_stop_ns, self.name.clone());
        let mut builder = PluginTraceBuilder::new(span);
        let table = builder.to_c_trace_builder();
        let mut params = abi::ProfilerProcessEventsParams {
            unpadded_struct_size: abi::PROFILER_PROCESS_EVENTS_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: self.handle,
            trace_builder: &table,
        };
        let code = unsafe { call_entry(self.interface.profiler_process_events, &mut params) };
        if code != abi::PLUGIN_OK {
            self.record_failure("profiler_process_events", code);
        }

        self.trace_buffer = builder.take_trace_buffer();
        self.resource_infos = builder.take_resource_infos();

        if let Some(buffer) = &self.trace_buffer {
            debug!(
                plugin = %self.name,
                events = buffer.activities.len(),
                "plugin events processed"
            );
            for activity in &buffer.activities {
                logger.handle_activity(activity);
            }
        }
    }

    fn errors(&self) -> Vec<String> {
        self.errors.clone()
    }

    fn resource_infos(&self) -> Vec<ResourceInfo> {
        self.resource_infos.clone()
    }

    fn take_trace_buffer(&mut self) -> Option<CpuTraceBuffer> {
        self.trace_buffer.take()
    }
}

impl Drop for PluginProfilerSession {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        let mut params = abi::ProfilerDestroyParams {
            unpadded_struct_size: abi::PROFILER_DESTROY_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: self.handle,
        };
        let code = unsafe { call_entry(self.interface.profiler_destroy, &mut params) };
        if code != abi::PLUGIN_OK {
            self.record_failure("profiler_destroy", code);
        }
        self.handle = ptr::null_mut();
    }
}

impl std::fmt::Debug for PluginProfilerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProfilerSession")
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .field("errors", &self.errors.len())
            .finish()
    }
}
