//! Event intake for plugin sessions
//!
//! A [`PluginTraceBuilder`] collects the events a plugin reports from its
//! `profiler_process_events` entry point. The plugin never sees the builder's
//! type: it gets an [`abi::TraceBuilder`] table of `extern "C"` trampolines and
//! an opaque handle that the trampolines turn back into the builder.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use tracelink_plugin_abi as abi;
use tracing::error;

use crate::activity::{
    Activity, ActivityType, CpuTraceBuffer, Flow, LinkType, ResourceInfo, TraceSpan,
};
use crate::error::{Result, TraceError};

pub struct PluginTraceBuilder {
    buffer: Option<CpuTraceBuffer>,
    resource_infos: Vec<ResourceInfo>,
}

/// Rejects a struct whose declared size does not cover `required` bytes
unsafe fn check_size<T>(ptr: *const T, struct_name: &'static str, required: usize) -> Result<()> {
    let declared = abi::declared_size(ptr);
    if declared < required {
        return Err(TraceError::IncompatibleStruct {
            struct_name,
            declared,
            required,
        });
    }
    Ok(())
}

fn non_null<T>(ptr: *const T, argument: &'static str) -> Result<()> {
    if ptr.is_null() {
        return Err(TraceError::NullPointer { argument });
    }
    Ok(())
}

unsafe fn c_string(ptr: *const c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

impl PluginTraceBuilder {
    /// Creates a builder whose events belong to `span`
    pub fn new(span: TraceSpan) -> Self {
        Self {
            buffer: Some(CpuTraceBuffer::new(span)),
            resource_infos: Vec::new(),
        }
    }

    fn buffer_mut(&mut self) -> Result<&mut CpuTraceBuffer> {
        self.buffer.as_mut().ok_or_else(|| TraceError::InternalError {
            reason: "trace builder used after its buffer was taken".to_string(),
        })
    }

    fn last_event(&mut self, operation: &'static str) -> Result<&mut Activity> {
        self.buffer_mut()?
            .activities
            .last_mut()
            .ok_or(TraceError::NoLastEvent { operation })
    }

    /// Appends an event with an empty name.
    ///
    /// # Safety
    ///
    /// `event` must be null or point to a readable `ProfileEvent` of at least
    /// its declared size.
    pub unsafe fn add_event(&mut self, event: *const abi::ProfileEvent) -> Result<()> {
        self.buffer_mut()?;
        non_null(event, "event")?;
        check_size(event, "ProfileEvent", abi::PROFILE_EVENT_MIN_STRUCT_SIZE)?;

        let declared = abi::declared_size(event);
        let code = ptr::addr_of!((*event).event_type).read();
        // thread_id was appended later; older plugins leave it out
        let thread_id = if declared >= abi::PROFILE_EVENT_UNPADDED_STRUCT_SIZE {
            ptr::addr_of!((*event).thread_id).read()
        } else {
            0
        };

        let activity = Activity::new(
            ActivityType::from_plugin_code_or_default(code),
            "",
            ptr::addr_of!((*event).start_time_utc_ns).read(),
            ptr::addr_of!((*event).end_time_utc_ns).read(),
        )
        .with_id(ptr::addr_of!((*event).event_id).read())
        .with_device(i64::from(ptr::addr_of!((*event).device_id).read()))
        .with_resource(i64::from(ptr::addr_of!((*event).resource_id).read()))
        .with_thread(thread_id);

        self.buffer_mut()?.push(activity);
        Ok(())
    }

    /// # Safety
    ///
    /// `name` must be null or a valid null-terminated string.
    pub unsafe fn set_last_event_name(&mut self, name: *const c_char) -> Result<()> {
        self.buffer_mut()?;
        non_null(name, "name")?;
        let name = c_string(name);
        self.last_event("set_last_event_name")?.name = name;
        Ok(())
    }

    /// # Safety
    ///
    /// `flow` must be null or point to a readable `ProfileEventFlow` of at
    /// least its declared size.
    pub unsafe fn set_last_event_flow(&mut self, flow: *const abi::ProfileEventFlow) -> Result<()> {
        self.buffer_mut()?;
        non_null(flow, "flow")?;
        check_size(flow, "ProfileEventFlow", abi::PROFILE_EVENT_FLOW_UNPADDED_STRUCT_SIZE)?;

        let flow = Flow {
            id: ptr::addr_of!((*flow).flow_id).read(),
            link: LinkType::from_plugin_code(ptr::addr_of!((*flow).flow_type).read()),
            is_start: ptr::addr_of!((*flow).is_start_point).cast::<u8>().read() != 0,
        };
        self.last_event("set_last_event_flow")?.flow = Some(flow);
        Ok(())
    }

    /// # Safety
    ///
    /// `key` and `value` must each be null or a valid null-terminated string.
    pub unsafe fn add_last_event_metadata(
        &mut self,
        key: *const c_char,
        value: *const c_char,
    ) -> Result<()> {
        self.buffer_mut()?;
        non_null(key, "key")?;
        non_null(value, "value")?;
        let (key, value) = (c_string(key), c_string(value));
        self.last_event("add_last_event_metadata")?.add_metadata(key, value);
        Ok(())
    }

    /// # Safety
    ///
    /// `info` must be null or point to a readable `ProfileResourceInfo` of at
    /// least its declared size, whose `name` is null or a valid string.
    pub unsafe fn add_resource_info(
        &mut self,
        info: *const abi::ProfileResourceInfo,
    ) -> Result<()> {
        non_null(info, "resource_info")?;
        check_size(
            info,
            "ProfileResourceInfo",
            abi::PROFILE_RESOURCE_INFO_UNPADDED_STRUCT_SIZE,
        )?;

        let id = ptr::addr_of!((*info).resource_id).read();
        let name_ptr = ptr::addr_of!((*info).name).read();
        let name = if name_ptr.is_null() {
            id.to_string()
        } else {
            c_string(name_ptr)
        };
        self.resource_infos.push(ResourceInfo {
            device_id: ptr::addr_of!((*info).device_id).read(),
            id,
            sort_index: ptr::addr_of!((*info).display_order).read(),
            name,
        });
        Ok(())
    }

    /// C view of this builder.
    ///
    /// The table holds a raw pointer to `self`; the builder must stay in place
    /// and outlive every call made through it.
    pub fn to_c_trace_builder(&mut self) -> abi::TraceBuilder {
        abi::TraceBuilder {
            unpadded_struct_size: abi::TRACE_BUILDER_UNPADDED_STRUCT_SIZE,
            trace_builder_handle: (self as *mut PluginTraceBuilder)
                .cast::<abi::TraceBuilderHandle>(),
            add_event: Some(c_add_event),
            set_last_event_name: Some(c_set_last_event_name),
            set_last_event_flow: Some(c_set_last_event_flow),
            add_last_event_metadata: Some(c_add_last_event_metadata),
            add_resource_info: Some(c_add_resource_info),
        }
    }

    /// Moves the collected events out; later calls return `None`
    pub fn take_trace_buffer(&mut self) -> Option<CpuTraceBuffer> {
        self.buffer.take()
    }

    pub fn take_resource_infos(&mut self) -> Vec<ResourceInfo> {
        std::mem::take(&mut self.resource_infos)
    }

    pub fn event_count(&self) -> usize {
        self.buffer.as_ref().map(|b| b.activities.len()).unwrap_or(0)
    }
}

// ============================================================================
// Trampolines
// ============================================================================

fn to_status(result: Result<()>, operation: &'static str) -> c_int {
    match result {
        Ok(()) => abi::PLUGIN_OK,
        Err(err) => {
            error!(
                operation,
                code = err.error_code(),
                "plugin trace builder call rejected: {}",
                err
            );
            abi::PLUGIN_ERROR
        }
    }
}

unsafe fn builder<'a>(handle: *mut abi::TraceBuilderHandle) -> Option<&'a mut PluginTraceBuilder> {
    handle.cast::<PluginTraceBuilder>().as_mut()
}

unsafe extern "C" fn c_add_event(
    handle: *mut abi::TraceBuilderHandle,
    event: *const abi::ProfileEvent,
) -> c_int {
    match builder(handle) {
        Some(b) => to_status(b.add_event(event), "add_event"),
        None => to_status(
            Err(TraceError::NullPointer {
                argument: "trace_builder_handle",
            }),
            "add_event",
        ),
    }
}

unsafe extern "C" fn c_set_last_event_name(
    handle: *mut abi::TraceBuilderHandle,
    name: *const c_char,
) -> c_int {
    match builder(handle) {
        Some(b) => to_status(b.set_last_event_name(name), "set_last_event_name"),
        None => to_status(
            Err(TraceError::NullPointer { argument: "trace_builder_handle" }),
            "set_last_event_name",
        ),
    }
}

unsafe extern "C" fn c_set_last_event_flow(
    handle: *mut abi::TraceBuilderHandle,
    flow: *const abi::ProfileEventFlow,
) -> c_int {
    match builder(handle) {
        Some(b) => to_status(b.set_last_event_flow(flow), "set_last_event_flow"),
        None => to_status(
            Err(TraceError::NullPointer { argument: "trace_builder_handle" }),
            "set_last_event_flow",
        ),
    }
}

unsafe extern "C" fn c_add_last_event_metadata(
    handle: *mut abi::TraceBuilderHandle,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    match builder(handle) {
        Some(b) => to_status(b.add_last_event_metadata(key, value), "add_last_event_metadata"),
        None => to_status(
            Err(TraceError::NullPointer { argument: "trace_builder_handle" }),
            "add_last_event_metadata",
        ),
    }
}

unsafe extern "C" fn c_add_resource_info(
    handle: *mut abi::TraceBuilderHandle,
    info: *const abi::ProfileResourceInfo,
) -> c_int {
    match builder(handle) {
        Some(b) => to_status(b.add_resource_info(info), "add_resource_info"),
        None => to_status(
            Err(TraceError::NullPointer { argument: "trace_builder_handle" }),
            "add_resource_info",
        ),
    }
}
