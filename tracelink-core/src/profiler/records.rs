//! Hardware record handling
//!
//! Turns raw backend records into activities, attributes them to the CPU ops
//! that launched them and widens the matching GPU-side spans.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::activity::{Activity, ActivityBuffers, ActivityType, ThreadInfo};
use crate::backend::{is_ignored_runtime_call, ExternalCorrelationKind, RawRecord};
use crate::output::ActivityLogger;
use crate::trace::{CorrelationFlow, CorrelationIndex, GpuSpanSynthesizer, TraceSpanRegistry};

/// Borrowed per-trace state needed while draining the backend
pub(super) struct RecordHandler<'a> {
    pub correlations: &'a mut CorrelationIndex,
    pub spans: &'a mut TraceSpanRegistry,
    pub gpu_spans: &'a mut GpuSpanSynthesizer,
    pub thread_info: &'a BTreeMap<i32, ThreadInfo>,
    pub buffers: &'a mut ActivityBuffers,
    pub window_start: i64,
    pub window_end: i64,
}

/// A CPU op cannot start after the GPU work it launched
fn timestamps_in_order(cpu_op: &Activity, gpu_op: &Activity) -> bool {
    if cpu_op.start_time > gpu_op.start_time {
        warn!(
            gpu_start = gpu_op.start_time,
            cpu_start = cpu_op.start_time,
            skew_ns = cpu_op.start_time - gpu_op.start_time,
            name = %gpu_op.name,
            device = gpu_op.device,
            stream = gpu_op.resource,
            "GPU op timestamp precedes its launching CPU op"
        );
        return false;
    }
    true
}

impl RecordHandler<'_> {
    pub fn handle(&mut self, record: RawRecord, logger: &mut dyn ActivityLogger) {
        match record {
            RawRecord::ExternalCorrelation {
                correlation_id,
                kind,
                external_id,
            } => self.handle_correlation(correlation_id, kind, external_id),

            RawRecord::Runtime {
                cbid,
                name,
                start,
                end,
                correlation_id,
                process_id,
                thread_id,
            } => {
                if is_ignored_runtime_call(cbid) {
                    return;
                }
                trace!(correlation_id, cbid, thread_id, "runtime record");
                let tid = self
                    .thread_info
                    .get(&thread_id)
                    .map(|info| info.system_thread_id)
                    .unwrap_or(thread_id);
                let activity = Activity::new(ActivityType::CudaRuntime, name, start, end)
                    .with_id(correlation_id as i64)
                    .with_device(process_id as i64)
                    .with_resource(tid as i64)
                    .with_thread(tid)
                    .with_correlation(correlation_id as u64);
                self.handle_runtime(activity, correlation_id, logger);
            }

            RawRecord::Kernel {
                name,
                device,
                stream,
                start,
                end,
                correlation_id,
            } => {
                let activity = Activity::new(ActivityType::ConcurrentKernel, name, start, end)
                    .with_id(correlation_id as i64)
                    .with_device(device)
                    .with_resource(stream)
                    .with_correlation(correlation_id as u64);
                self.handle_gpu(activity, correlation_id, logger);
            }

            RawRecord::Memcpy {
                device,
                stream,
                start,
                end,
                correlation_id,
                copy_kind,
                src_kind,
                dst_kind,
                bytes,
            } => {
                let name = format!("Memcpy {} ({} -> {})", copy_kind, src_kind, dst_kind);
                let mut activity = Activity::new(ActivityType::GpuMemcpy, name, start, end)
                    .with_id(correlation_id as i64)
                    .with_device(device)
                    .with_resource(stream)
                    .with_correlation(correlation_id as u64);
                activity.add_metadata("bytes", bytes.to_string());
                self.handle_gpu(activity, correlation_id, logger);
            }

            RawRecord::Memset {
                device,
                stream,
                start,
                end,
                correlation_id,
                memory_kind,
                bytes,
            } => {
                let name = format!("Memset ({})", memory_kind);
                let mut activity = Activity::new(ActivityType::GpuMemset, name, start, end)
                    .with_id(correlation_id as i64)
                    .with_device(device)
                    .with_resource(stream)
                    .with_correlation(correlation_id as u64);
                activity.add_metadata("bytes", bytes.to_string());
                self.handle_gpu(activity, correlation_id, logger);
            }

            RawRecord::Unsupported { kind } => {
                warn!(kind, "unexpected activity record kind");
            }
        }
    }

    fn handle_correlation(
        &mut self,
        correlation_id: u32,
        kind: ExternalCorrelationKind,
        external_id: u64,
    ) {
        let flow = match kind {
            ExternalCorrelationKind::Custom0 => CorrelationFlow::Default,
            ExternalCorrelationKind::Custom1 => CorrelationFlow::User,
            ExternalCorrelationKind::Other(other) => {
                warn!(kind = other, correlation_id, "invalid external correlation kind");
                return;
            }
        };
        trace!(correlation_id, external_id, ?flow, "external correlation");
        self.correlations.add_correlation(external_id, correlation_id, flow);
    }

    fn out_of_range(&self, activity: &Activity) -> bool {
        let out_of_range =
            activity.start_time < self.window_start || activity.end_time > self.window_end;
        if out_of_range {
            trace!(
                name = %activity.name,
                start = activity.start_time,
                end = activity.end_time,
                window_start = self.window_start,
                window_end = self.window_end,
                "activity outside of profiling window"
            );
        }
        out_of_range
    }

    /// True when `cpu_op` belongs to a span that was filtered from output
    fn logging_disabled(&self, cpu_op: Option<&Activity>) -> bool {
        cpu_op
            .and_then(|op| op.correlation)
            .and_then(|correlation| self.correlations.span_pair(correlation))
            .map(|pair| self.spans.is_disabled(pair))
            .unwrap_or(false)
    }

    fn handle_runtime(
        &mut self,
        mut activity: Activity,
        correlation_id: u32,
        logger: &mut dyn ActivityLogger,
    ) {
        let cpu_op = self
            .correlations
            .get_activity(correlation_id, CorrelationFlow::Default)
            .and_then(|op| self.buffers.get(op));
        activity.linked_correlation = cpu_op.and_then(|op| op.correlation);

        if cpu_op.is_none() && self.out_of_range(&activity) {
            return;
        }
        if self.logging_disabled(cpu_op) {
            return;
        }
        logger.handle_activity(&activity);
        self.buffers.gpu.push(activity);
    }

    fn handle_gpu(
        &mut self,
        mut activity: Activity,
        correlation_id: u32,
        logger: &mut dyn ActivityLogger,
    ) {
        let cpu_op = self
            .correlations
            .get_activity(correlation_id, CorrelationFlow::Default)
            .and_then(|op| self.buffers.get(op));
        activity.linked_correlation = cpu_op.and_then(|op| op.correlation);

        if cpu_op.is_none() && self.out_of_range(&activity) {
            return;
        }
        if let Some(op) = cpu_op {
            if !timestamps_in_order(op, &activity) {
                return;
            }
        }
        if self.logging_disabled(cpu_op) {
            return;
        }

        trace!(
            external_id = ?activity.linked_correlation,
            correlation_id,
            name = %activity.name,
            "GPU record"
        );
        logger.handle_activity(&activity);

        let pair = activity
            .linked_correlation
            .and_then(|correlation| self.correlations.span_pair(correlation));
        if let Some(pair) = pair {
            self.spans.extend_gpu_span(pair, &activity);
        }

        let user_op = self
            .correlations
            .get_activity(correlation_id, CorrelationFlow::User)
            .and_then(|op| self.buffers.get(op));
        if let Some(user_op) = user_op {
            if timestamps_in_order(user_op, &activity) {
                trace!(external_id = ?user_op.correlation, correlation_id, "user annotation");
                self.gpu_spans.insert_or_extend_event(user_op, &activity);
            }
        }

        self.buffers.gpu.push(activity);
    }
}
