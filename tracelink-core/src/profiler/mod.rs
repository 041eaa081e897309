//! Trace lifecycle
//!
//! [`TraceController`] owns all state of the current trace and advances it
//! through a fixed cycle:
//!
//! ```text
//! WaitForRequest ──configure──► Warmup ──start──► CollectTrace ──stop──► ProcessTrace
//!       ▲                                                                    │
//!       └───────────────────────────── process + reset ─────────────────────┘
//! ```
//!
//! One control thread drives [`TraceController::perform_run_loop_step`].
//! Every other method may be called from any thread. All compound state sits
//! behind a single mutex; only the runloop state and the stop request are
//! atomics, so a stop or a state query never waits behind a locked section.

mod records;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::activity::{
    from_ns, to_ns, ActivityBuffers, ActivityRef, ActivityType, CpuTraceBuffer, ProcessInfo,
    ThreadInfo,
};
use crate::backend::ActivityBackend;
use crate::config::ProfilerConfig;
use crate::error::{Result, TraceError};
use crate::output::ActivityLogger;
use crate::plugin::{ChildProfiler, ProfilerSession};
use crate::trace::{CorrelationIndex, CpuGpuSpanPair, GpuSpanSynthesizer, TraceSpanRegistry};
use records::RecordHandler;

/// GPU pseudo-processes announced in every trace that uses the backend
pub const MAX_GPU_COUNT: i64 = 8;

/// How late a start may be before it is reported
const LATE_START_TOLERANCE_MS: i64 = 10;

/// Phase of the collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunloopState {
    WaitForRequest = 0,
    Warmup = 1,
    CollectTrace = 2,
    ProcessTrace = 3,
}

impl RunloopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunloopState::Warmup,
            2 => RunloopState::CollectTrace,
            3 => RunloopState::ProcessTrace,
            _ => RunloopState::WaitForRequest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunloopState::WaitForRequest => "wait_for_request",
            RunloopState::Warmup => "warmup",
            RunloopState::CollectTrace => "collect_trace",
            RunloopState::ProcessTrace => "process_trace",
        }
    }
}

impl fmt::Display for RunloopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hooks into the application that produces CPU traces
pub trait TraceClient: Send {
    /// Collection started; the application should begin sending CPU traces
    fn start(&mut self);

    /// Collection is over
    fn stop(&mut self);
}

/// Running sum of overhead samples in microseconds
#[derive(Debug, Default, Clone, Copy)]
struct OverheadCounter {
    sum_us: i64,
    samples: i64,
}

impl OverheadCounter {
    fn add(&mut self, us: i64) {
        self.sum_us += us;
        self.samples += 1;
    }

    fn average(&self) -> i64 {
        if self.samples == 0 {
            0
        } else {
            self.sum_us / self.samples
        }
    }
}

/// Net admission policy of the current trace
#[derive(Debug, Default)]
struct NetFilters {
    names: Vec<String>,
    gpu_op_count_threshold: i32,
    iterations_target: String,
    iterations_target_count: i32,
}

impl NetFilters {
    fn from_config(config: &ProfilerConfig) -> Self {
        Self {
            names: config.net_name_filter.clone(),
            gpu_op_count_threshold: config.net_gpu_op_count_threshold,
            iterations_target: config.net_iterations_target.clone(),
            iterations_target_count: config.net_iterations_target_count,
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|filter| name.contains(filter.as_str()))
    }

    fn passes_threshold(&self, buffer: &CpuTraceBuffer, cpu_only: bool) -> bool {
        cpu_only || buffer.gpu_op_count < 0 || buffer.gpu_op_count >= self.gpu_op_count_threshold
    }

    /// Whether `name` is the net whose iterations are counted.
    ///
    /// With no target configured the first admitted net becomes the target.
    /// A partial target is pinned to the first full name containing it.
    fn target_match(&mut self, name: &str) -> bool {
        if name == self.iterations_target {
            return true;
        }
        let matched =
            self.iterations_target.is_empty() || name.contains(self.iterations_target.as_str());
        if matched {
            info!(
                net = name,
                iterations = self.iterations_target_count,
                "tracking net iterations"
            );
            self.iterations_target = name.to_string();
        }
        matched
    }
}

struct TraceState {
    config: ProfilerConfig,
    backend: Option<Box<dyn ActivityBackend>>,
    logger: Option<Box<dyn ActivityLogger>>,
    client: Option<Box<dyn TraceClient>>,
    children: Vec<Box<dyn ChildProfiler>>,
    sessions: Vec<Box<dyn ProfilerSession>>,
    filters: NetFilters,

    profile_start: DateTime<Utc>,
    profile_end: DateTime<Utc>,
    capture_window_start: i64,
    capture_window_end: i64,

    correlations: CorrelationIndex,
    gpu_spans: GpuSpanSynthesizer,
    spans: TraceSpanRegistry,
    buffers: Option<ActivityBuffers>,

    /// Keyed by the low 32 bits of the pthread id
    thread_info: BTreeMap<i32, ThreadInfo>,
    metadata: BTreeMap<String, String>,
    iteration_counts: BTreeMap<String, i32>,

    flush_overhead: OverheadCounter,
    setup_overhead: OverheadCounter,
}

/// Coordinates when collection is armed, active and drained
pub struct TraceController {
    cpu_only: bool,
    state: Mutex<TraceState>,
    runloop_state: AtomicU8,
    stop_requested: AtomicBool,
}

impl TraceController {
    /// Creates a controller. Without a backend the controller is CPU-only
    /// and never touches hardware tracing.
    pub fn new(backend: Option<Box<dyn ActivityBackend>>) -> Self {
        let epoch = from_ns(0);
        Self {
            cpu_only: backend.is_none(),
            state: Mutex::new(TraceState {
                config: ProfilerConfig::default(),
                backend,
                logger: None,
                client: None,
                children: Vec::new(),
                sessions: Vec::new(),
                filters: NetFilters::default(),
                profile_start: epoch,
                profile_end: epoch,
                capture_window_start: 0,
                capture_window_end: 0,
                correlations: CorrelationIndex::new(),
                gpu_spans: GpuSpanSynthesizer::new(),
                spans: TraceSpanRegistry::new(),
                buffers: None,
                thread_info: BTreeMap::new(),
                metadata: BTreeMap::new(),
                iteration_counts: BTreeMap::new(),
                flush_overhead: OverheadCounter::default(),
                setup_overhead: OverheadCounter::default(),
            }),
            runloop_state: AtomicU8::new(RunloopState::WaitForRequest as u8),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn cpu_only() -> Self {
        Self::new(None)
    }

    pub fn with_backend(backend: impl ActivityBackend + 'static) -> Self {
        Self::new(Some(Box::new(backend)))
    }

    pub fn is_cpu_only(&self) -> bool {
        self.cpu_only
    }

    pub fn runloop_state(&self) -> RunloopState {
        RunloopState::from_u8(self.runloop_state.load(Ordering::SeqCst))
    }

    fn set_runloop_state(&self, state: RunloopState) {
        self.runloop_state.store(state as u8, Ordering::SeqCst);
    }

    /// True from configure until the trace has been processed or reset
    pub fn is_active(&self) -> bool {
        self.runloop_state() != RunloopState::WaitForRequest
    }

    /// Asks the runloop to stop collecting at its next step
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Configuration of the current or last trace
    pub fn config(&self) -> ProfilerConfig {
        self.state.lock().config.clone()
    }

    /// Logger that receives traces completed by the runloop
    pub fn set_logger(&self, logger: Box<dyn ActivityLogger>) {
        self.state.lock().logger = Some(logger);
    }

    pub fn set_client(&self, client: Option<Box<dyn TraceClient>>) {
        self.state.lock().client = client;
    }

    /// Adds a child profiler consulted on every configure
    pub fn register_profiler(&self, profiler: Box<dyn ChildProfiler>) {
        debug!(profiler = profiler.name(), "child profiler registered");
        self.state.lock().children.push(profiler);
    }

    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().metadata.insert(key.into(), value.into());
    }

    /// Whether a net called `name` passes the current name filter
    pub fn apply_net_filter(&self, name: &str) -> bool {
        self.state.lock().filters.matches_name(name)
    }

    /// Records display info for a host thread; the first registration wins
    pub fn record_thread_info(
        &self,
        system_thread_id: i32,
        pthread_id: u64,
        name: impl Into<String>,
    ) {
        let key = pthread_id as u32 as i32;
        self.state
            .lock()
            .thread_info
            .entry(key)
            .or_insert_with(|| ThreadInfo {
                system_thread_id,
                name: name.into(),
            });
    }

    /// Average cost of draining the backend, in microseconds
    pub fn flush_overhead_us(&self) -> i64 {
        self.state.lock().flush_overhead.average()
    }

    /// Average cost of enabling and disabling the backend, in microseconds
    pub fn setup_overhead_us(&self) -> i64 {
        self.state.lock().setup_overhead.average()
    }

    /// Span pairs recorded for the current trace, disabled ones included
    pub fn span_pairs(&self) -> Vec<CpuGpuSpanPair> {
        self.state.lock().spans.iter().cloned().collect()
    }

    /// Installs a new trace request and enters warmup
    pub fn configure(&self, config: &ProfilerConfig, now: DateTime<Utc>) -> Result<()> {
        config.validate()?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if self.is_active() {
            let current = self.runloop_state();
            error!(state = %current, "profiler already busy, rejecting configuration");
            return Err(TraceError::ProfilerBusy {
                state: current.to_string(),
            });
        }

        let mut config = config.clone();
        if config.activities_duration_ms == 0 {
            config.activities_duration_ms = ProfilerConfig::default().activities_duration_ms;
        }
        debug!(config = ?config, "configuring trace");

        state.filters = NetFilters::from_config(&config);
        state.config = config;
        state.flush_overhead = OverheadCounter::default();
        state.setup_overhead = OverheadCounter::default();
        Self::reset_trace_data(state);

        if let Some(backend) = state.backend.as_mut() {
            info!("enabling GPU tracing");
            backend.set_max_buffer_size(state.config.max_gpu_buffer_size_mb);
            let started = Instant::now();
            backend.enable_activities(&state.config.selected_activity_types);
            state.setup_overhead.add(started.elapsed().as_micros() as i64);
        }

        let requested: BTreeSet<ActivityType> =
            state.config.selected_activity_types.iter().copied().collect();
        let config = &state.config;
        state.sessions = state
            .children
            .iter()
            .filter_map(|child| {
                let session = child.configure(&requested, config);
                if session.is_none() {
                    debug!(profiler = child.name(), "child profiler not applicable to this trace");
                }
                session
            })
            .collect();

        state.profile_start = state.config.start_time(now);
        info!(
            starting_in_ms = (state.profile_start - now).num_milliseconds(),
            sessions = state.sessions.len(),
            "tracing scheduled"
        );

        state.buffers = Some(ActivityBuffers::new());
        state.capture_window_start = 0;
        state.capture_window_end = 0;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_runloop_state(RunloopState::Warmup);
        Ok(())
    }

    /// Opens the capture window
    pub fn start_trace(&self, now: DateTime<Utc>) {
        let mut guard = self.state.lock();
        self.start_trace_internal(&mut guard, now);
    }

    /// Closes the capture window, unless an iteration target already did, and
    /// tells the client to stop sending CPU traces
    pub fn stop_trace(&self, now: DateTime<Utc>) {
        let mut guard = self.state.lock();
        self.stop_trace_internal(&mut guard, now);
    }

    /// Drains everything collected so far into `logger`.
    ///
    /// A second call for the same trace finds no buffers and does nothing.
    pub fn process_trace(&self, logger: &mut dyn ActivityLogger) {
        let mut guard = self.state.lock();
        self.process_trace_internal(&mut guard, logger);
    }

    /// Stops the trace, drains it into `logger` and resets, all under one
    /// lock hold so the runloop cannot claim the trace in between
    pub fn finish_trace(&self, now: DateTime<Utc>, logger: &mut dyn ActivityLogger) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.stop_trace_internal(state, now);
        self.process_trace_internal(state, logger);
        self.reset_internal(state);
    }

    /// Stops whatever is in flight and discards it
    pub fn cancel_trace(&self, now: DateTime<Utc>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if self.is_active() {
            warn!(state = %self.runloop_state(), "cancelling current trace");
            self.stop_trace_internal(state, now);
        }
        self.reset_internal(state);
    }

    /// Drops all per-trace state and returns to waiting for a request
    pub fn reset(&self) {
        let mut guard = self.state.lock();
        self.reset_internal(&mut guard);
    }

    /// Ingests one span's worth of CPU activities from the application
    pub fn transfer_cpu_trace(&self, mut buffer: CpuTraceBuffer) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let current = self.runloop_state();
        let name = buffer.span.name.clone();

        if !matches!(current, RunloopState::CollectTrace | RunloopState::ProcessTrace) {
            debug!(net = %name, "trace collection not in progress, discarding CPU trace");
            return;
        }
        if !state.filters.matches_name(&name) {
            debug!(net = %name, "CPU trace does not match net name filter");
            return;
        }
        if !state.filters.passes_threshold(&buffer, self.cpu_only) {
            debug!(
                net = %name,
                gpu_ops = buffer.gpu_op_count,
                threshold = state.filters.gpu_op_count_threshold,
                "CPU trace below GPU op threshold"
            );
            return;
        }

        let count = state.iteration_counts.entry(name.clone()).or_insert(0);
        buffer.span.iteration = *count;
        *count += 1;
        debug!(
            net = %name,
            iteration = buffer.span.iteration,
            activities = buffer.activities.len(),
            gpu_ops = buffer.gpu_op_count,
            "received CPU trace"
        );

        if current == RunloopState::CollectTrace
            && state.filters.iterations_target_count > 0
            && state.filters.target_match(&name)
        {
            if buffer.span.iteration == 0 {
                debug!(start = buffer.span.start_time, "capture window starts with target net");
                state.capture_window_start = buffer.span.start_time;
            } else if 1 + buffer.span.iteration >= state.filters.iterations_target_count {
                info!(net = %name, "completed target iteration count");
                if let Some(client) = state.client.as_mut() {
                    client.stop();
                }
                self.stop_requested.store(true, Ordering::SeqCst);
                state.capture_window_end = buffer.span.end_time;
            }
        }

        let Some(buffers) = state.buffers.as_mut() else {
            warn!(net = %name, "no trace buffers allocated, discarding CPU trace");
            return;
        };

        if buffer.activities.is_empty() {
            warn!(net = %name, "CPU trace is empty");
        } else {
            let buffer_index = buffers.cpu.len();
            let pair = state.spans.record(&buffer.span, buffer.gpu_op_count);
            for (index, activity) in buffer.activities.iter().enumerate() {
                trace!(correlation = ?activity.correlation, name = %activity.name, "CPU op");
                if let Some(correlation) = activity.correlation {
                    let handle = ActivityRef {
                        buffer: buffer_index,
                        index,
                    };
                    state.correlations.insert_event(correlation, handle);
                    state.correlations.insert_span_pair(correlation, pair);
                }
            }
        }
        buffers.push_cpu(buffer);
    }

    /// Advances the state machine; returns when the control thread should
    /// wake up next
    pub fn perform_run_loop_step(
        &self,
        now: DateTime<Utc>,
        next_wakeup: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut new_wakeup = next_wakeup;
        if self.runloop_state() == RunloopState::WaitForRequest {
            return new_wakeup;
        }

        // Synchronous callers may have moved the state before the lock was taken
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match self.runloop_state() {
            RunloopState::WaitForRequest => {}

            RunloopState::Warmup => {
                if let Some(backend) = state.backend.as_mut() {
                    // Flushing takes a while; skip it close to the start time
                    if next_wakeup < state.profile_start {
                        backend.clear_activities();
                    }
                    if backend.stop_collection() {
                        warn!("GPU buffer limit reached during warmup, cancelling trace");
                        self.stop_trace_internal(state, now);
                        self.reset_internal(state);
                        debug!("Warmup -> WaitForRequest");
                        return new_wakeup;
                    }
                }

                if now >= state.profile_start {
                    let late = now - state.profile_start;
                    if late > Duration::milliseconds(LATE_START_TOLERANCE_MS) {
                        warn!(late_ms = late.num_milliseconds(), "tracing started late");
                    } else {
                        info!("tracing started");
                    }
                    self.start_trace_internal(state, now);
                } else if next_wakeup > state.profile_start {
                    new_wakeup = state.profile_start;
                }
            }

            RunloopState::CollectTrace => {
                // The window start may have moved with the target net
                state.profile_end =
                    from_ns(state.capture_window_start) + state.config.activities_duration();
                let reached_end = now >= state.profile_end;
                let backend_full = state
                    .backend
                    .as_ref()
                    .map(|backend| backend.stop_collection())
                    .unwrap_or(false);

                let stop_requested = self.stop_requested.swap(false, Ordering::SeqCst);
                if reached_end || stop_requested || backend_full {
                    info!(reached_end, stop_requested, backend_full, "tracing complete");
                    self.stop_trace_internal(state, now);
                } else if state.profile_end < next_wakeup {
                    new_wakeup = state.profile_end;
                }
            }

            RunloopState::ProcessTrace => {
                match state.logger.take() {
                    Some(mut logger) => self.process_trace_internal(state, logger.as_mut()),
                    None => warn!("no logger set, dropping collected trace"),
                }
                self.reset_internal(state);
                debug!("ProcessTrace -> WaitForRequest");
            }
        }
        new_wakeup
    }

    fn start_trace_internal(&self, state: &mut TraceState, now: DateTime<Utc>) {
        state.capture_window_start = to_ns(now);
        if let Some(client) = state.client.as_mut() {
            client.start();
        }
        for session in state.sessions.iter_mut() {
            session.start();
        }
        debug!(from = %self.runloop_state(), "-> CollectTrace");
        self.set_runloop_state(RunloopState::CollectTrace);
    }

    fn stop_trace_internal(&self, state: &mut TraceState, now: DateTime<Utc>) {
        if let Some(client) = state.client.as_mut() {
            client.stop();
        }
        if state.capture_window_end == 0 {
            state.capture_window_end = to_ns(now);
        }
        if let Some(backend) = state.backend.as_mut() {
            let started = Instant::now();
            backend.disable_activities(&state.config.selected_activity_types);
            state.setup_overhead.add(started.elapsed().as_micros() as i64);
        }
        for session in state.sessions.iter_mut() {
            session.stop();
        }

        let current = self.runloop_state();
        if current == RunloopState::CollectTrace {
            debug!("CollectTrace -> ProcessTrace");
        } else {
            warn!(state = %current, "stop_trace called outside of collection");
        }
        self.set_runloop_state(RunloopState::ProcessTrace);
    }

    fn process_trace_internal(&self, state: &mut TraceState, logger: &mut dyn ActivityLogger) {
        let Some(mut buffers) = state.buffers.take() else {
            debug!("no trace to process");
            return;
        };
        info!(
            cpu_buffers = buffers.cpu.len(),
            window_start = state.capture_window_start,
            window_end = state.capture_window_end,
            "processing trace"
        );
        logger.handle_trace_start(&state.metadata);

        for cpu_trace in &buffers.cpu {
            let span = &cpu_trace.span;
            let log_net = state.filters.matches_name(&span.name)
                && state.filters.passes_threshold(cpu_trace, self.cpu_only)
                && span.start_time < state.capture_window_end
                && span.end_time > state.capture_window_start;
            debug!(
                net = %span.name,
                iteration = span.iteration,
                records = cpu_trace.activities.len(),
                log_net,
                "processing CPU buffer"
            );
            if cpu_trace.activities.is_empty() {
                continue;
            }
            if log_net {
                for activity in &cpu_trace.activities {
                    logger.handle_cpu_activity(activity, span);
                }
                logger.handle_trace_span(span);
                if span.name == state.filters.iterations_target {
                    logger.handle_iteration_start(span);
                }
            } else {
                state.spans.disable_name(&span.name);
            }
        }

        for session in state.sessions.iter_mut() {
            session.process_trace(logger);
            for info in session.resource_infos() {
                logger.handle_resource_info(&info, state.capture_window_start);
            }
            if let Some(buffer) = session.take_trace_buffer() {
                buffers.plugin.push(buffer);
            }
        }

        if let Some(backend) = state.backend.as_mut() {
            let records = backend.activity_records();
            state.flush_overhead.add(backend.flush_overhead_us());
            let count = records.len();
            let mut handler = RecordHandler {
                correlations: &mut state.correlations,
                spans: &mut state.spans,
                gpu_spans: &mut state.gpu_spans,
                thread_info: &state.thread_info,
                buffers: &mut buffers,
                window_start: state.capture_window_start,
                window_end: state.capture_window_end,
            };
            for record in records {
                handler.handle(record, logger);
            }
            info!(records = count, "processed GPU records");
        }

        self.finalize_trace(state, buffers, logger);
    }

    fn finalize_trace(
        &self,
        state: &mut TraceState,
        mut buffers: ActivityBuffers,
        logger: &mut dyn ActivityLogger,
    ) {
        for (net, iterations) in &state.iteration_counts {
            info!(net = %net, iterations, "recorded net");
        }
        state.iteration_counts.clear();

        let window_start = state.capture_window_start;
        let name = process_name();
        if !name.is_empty() {
            let pid = std::process::id() as i64;
            let cpu = ProcessInfo {
                pid,
                name: name.clone(),
                label: "CPU".to_string(),
            };
            logger.handle_process_info(&cpu, window_start);
            if !self.cpu_only {
                // GPU events use the device id as pid
                for gpu in 0..MAX_GPU_COUNT {
                    let info = ProcessInfo {
                        pid: gpu,
                        name: name.clone(),
                        label: format!("GPU {}", gpu),
                    };
                    logger.handle_process_info(&info, window_start);
                }
            }
        }

        for info in state.thread_info.values() {
            logger.handle_thread_info(info, window_start);
        }

        for pair in state.spans.iter() {
            if pair.gpu.op_count > 0 && !pair.is_disabled() {
                logger.handle_trace_span(&pair.gpu);
            }
        }

        state.gpu_spans.log_events(logger);
        buffers.gpu.extend(state.gpu_spans.spans().cloned());

        logger.finalize_trace(&state.config, buffers, state.capture_window_end);
    }

    fn reset_internal(&self, state: &mut TraceState) {
        Self::reset_trace_data(state);
        self.set_runloop_state(RunloopState::WaitForRequest);
    }

    fn reset_trace_data(state: &mut TraceState) {
        if let Some(backend) = state.backend.as_mut() {
            backend.clear_activities();
        }
        // Handles into the registry go first
        state.correlations.clear();
        state.gpu_spans.clear();
        state.spans.clear();
        state.buffers = None;
        state.metadata.clear();
        state.iteration_counts.clear();
        state.sessions.clear();
    }
}

impl fmt::Debug for TraceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceController")
            .field("cpu_only", &self.cpu_only)
            .field("state", &self.runloop_state())
            .finish()
    }
}

/// Name of the running executable, empty if unknown
fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_default()
}
