//! Control thread
//!
//! [`ActivityProfilerController`] wraps a [`TraceController`] with the thread
//! that drives its runloop. Async requests are queued with
//! [`schedule_trace`](ActivityProfilerController::schedule_trace) and picked up
//! by the thread once the profiler is idle. Synchronous traces go through
//! `prepare_trace`, `start_trace` and `stop_trace` on the caller's thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProfilerConfig;
use crate::error::Result;
use crate::output::{ActivityLogger, ActivityTrace, MemoryTraceLogger};
use crate::profiler::TraceController;

/// Wakeup interval while no trace is active
pub const INACTIVE_INTERVAL_MS: i64 = 1000;

/// Wakeup interval during a trace; bounds how much backend data piles up
/// between steps
pub const ACTIVE_INTERVAL_MS: i64 = 200;

/// Builds the logger for an async request that does not log to memory
pub type LoggerFactory = Box<dyn Fn(&ProfilerConfig) -> Box<dyn ActivityLogger> + Send + Sync>;

fn profiler_interval(active: bool) -> Duration {
    Duration::milliseconds(if active {
        ACTIVE_INTERVAL_MS
    } else {
        INACTIVE_INTERVAL_MS
    })
}

#[derive(Default)]
struct AsyncRequests {
    pending: Option<ProfilerConfig>,
    factory: Option<LoggerFactory>,
    /// In-memory logger of the most recent async request
    last_trace: Option<MemoryTraceLogger>,
}

impl AsyncRequests {
    fn make_logger(&mut self, config: &ProfilerConfig) -> Box<dyn ActivityLogger> {
        if !config.log_to_memory {
            if let Some(factory) = &self.factory {
                return factory(config);
            }
            warn!("no logger factory set, collecting trace in memory");
        }
        let logger = MemoryTraceLogger::new();
        self.last_trace = Some(logger.clone());
        Box::new(logger)
    }
}

struct RunloopThread {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns a trace controller and its control thread
pub struct ActivityProfilerController {
    profiler: Arc<TraceController>,
    requests: Arc<Mutex<AsyncRequests>>,
    runloop: Mutex<Option<RunloopThread>>,
}

impl ActivityProfilerController {
    pub fn new(profiler: TraceController) -> Self {
        Self {
            profiler: Arc::new(profiler),
            requests: Arc::new(Mutex::new(AsyncRequests::default())),
            runloop: Mutex::new(None),
        }
    }

    /// The wrapped controller, for producers calling `transfer_cpu_trace`
    pub fn profiler(&self) -> &Arc<TraceController> {
        &self.profiler
    }

    pub fn set_logger_factory(&self, factory: LoggerFactory) {
        self.requests.lock().factory = Some(factory);
    }

    /// Queues an async trace request. Replaces any request not yet picked up.
    ///
    /// The control thread is started on first use.
    pub fn schedule_trace(&self, config: &ProfilerConfig) -> Result<()> {
        config.validate()?;
        self.requests.lock().pending = Some(config.clone());

        let mut runloop = self.runloop.lock();
        if runloop.is_none() {
            let (shutdown, shutdown_rx) = channel::bounded(1);
            let profiler = Arc::clone(&self.profiler);
            let requests = Arc::clone(&self.requests);
            let handle = thread::Builder::new()
                .name("tracelink-profiler".to_string())
                .spawn(move || run_loop(profiler, requests, shutdown_rx))?;
            *runloop = Some(RunloopThread { shutdown, handle });
        }
        Ok(())
    }

    /// Trace of the last async request that logged to memory, once finished
    pub fn last_async_trace(&self) -> Option<ActivityTrace> {
        self.requests
            .lock()
            .last_trace
            .as_ref()
            .filter(|logger| logger.is_finalized())
            .map(MemoryTraceLogger::trace)
    }

    /// Configures a synchronous trace.
    ///
    /// Synchronous requests take priority: a trace already in flight is
    /// cancelled first.
    pub fn prepare_trace(&self, config: &ProfilerConfig) -> Result<()> {
        let now = Utc::now();
        if self.profiler.is_active() {
            warn!("cancelling current trace request to start a synchronous one");
            self.profiler.cancel_trace(now);
        }
        self.profiler.configure(config, now)
    }

    pub fn start_trace(&self) {
        self.profiler.start_trace(Utc::now());
    }

    /// Ends the synchronous trace and returns everything it collected
    pub fn stop_trace(&self) -> ActivityTrace {
        let mut logger = MemoryTraceLogger::new();
        self.profiler.finish_trace(Utc::now(), &mut logger);
        logger.trace()
    }

    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.profiler.add_metadata(key, value);
    }
}

impl Drop for ActivityProfilerController {
    fn drop(&mut self) {
        if let Some(runloop) = self.runloop.get_mut().take() {
            let _ = runloop.shutdown.send(());
            if runloop.handle.join().is_err() {
                error!("activity profiler thread panicked");
            }
        }
        debug!("stopped activity profiler");
    }
}

/// Sleeps until `until`; false once shutdown was signalled
fn sleep_until(shutdown: &Receiver<()>, until: DateTime<Utc>) -> bool {
    let now = Utc::now();
    if until <= now {
        return !matches!(shutdown.try_recv(), Ok(()) | Err(channel::TryRecvError::Disconnected));
    }
    let wait = (until - now).to_std().unwrap_or_default();
    matches!(shutdown.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
}

fn run_loop(
    profiler: Arc<TraceController>,
    requests: Arc<Mutex<AsyncRequests>>,
    shutdown: Receiver<()>,
) {
    debug!("entering activity profiler loop");
    let mut next_wakeup = Utc::now() + profiler_interval(false);

    while sleep_until(&shutdown, next_wakeup) {
        let now = Utc::now();

        if !profiler.is_active() {
            let mut requests = requests.lock();
            if let Some(config) = requests.pending.take() {
                info!("received on-demand activity trace request");
                let logger = requests.make_logger(&config);
                profiler.set_logger(logger);
                if let Err(err) = profiler.configure(&config, now) {
                    error!(error = %err, code = err.error_code(), "async trace request rejected");
                }
            }
        }

        while next_wakeup < now {
            next_wakeup = next_wakeup + profiler_interval(profiler.is_active());
        }

        if profiler.is_active() {
            next_wakeup = profiler.perform_run_loop_step(now, next_wakeup);
            trace!(
                step_ms = (Utc::now() - now).num_milliseconds(),
                state = %profiler.runloop_state(),
                "profiler loop step"
            );
        }
    }
    debug!("exited activity profiler loop");
}
