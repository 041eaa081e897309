//! GPU-side spans for user annotations
//!
//! Each user annotation on the CPU gets one synthesized span per
//! (device, stream) it launched work on, covering all of that work.

use std::collections::BTreeMap;

use crate::activity::{Activity, ActivityType};
use crate::output::ActivityLogger;

/// (device, stream)
type StreamKey = (i64, i64);

#[derive(Debug, Default)]
pub struct GpuSpanSynthesizer {
    streams: BTreeMap<StreamKey, BTreeMap<u64, Activity>>,
}

impl GpuSpanSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or widens the span for `cpu_activity` on `gpu_activity`'s stream.
    ///
    /// A new span takes its placement and bounds from the GPU activity and its
    /// identity from the CPU activity. Existing spans only ever grow.
    pub fn insert_or_extend_event(&mut self, cpu_activity: &Activity, gpu_activity: &Activity) {
        let key = (gpu_activity.device, gpu_activity.resource);
        let correlation = cpu_activity.correlation.unwrap_or(0);
        let span = self
            .streams
            .entry(key)
            .or_default()
            .entry(correlation)
            .or_insert_with(|| {
                let mut span = Activity::new(
                    gpu_kind(cpu_activity.kind),
                    cpu_activity.name.clone(),
                    gpu_activity.start_time,
                    gpu_activity.end_time,
                )
                .with_device(gpu_activity.device)
                .with_resource(gpu_activity.resource)
                .with_correlation(correlation);
                span.linked_correlation = cpu_activity.correlation;
                span
            });

        if gpu_activity.start_time < span.start_time {
            span.start_time = gpu_activity.start_time;
        }
        if gpu_activity.end_time > span.end_time {
            span.end_time = gpu_activity.end_time;
        }
    }

    /// Synthesized spans in (device, stream) then correlation order
    pub fn spans(&self) -> impl Iterator<Item = &Activity> {
        self.streams.values().flat_map(|spans| spans.values())
    }

    /// Emits every span to `logger`, in the order of [`spans`](Self::spans)
    pub fn log_events(&self, logger: &mut dyn ActivityLogger) {
        for span in self.spans() {
            logger.handle_activity(span);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }
}

fn gpu_kind(cpu_kind: ActivityType) -> ActivityType {
    match cpu_kind {
        ActivityType::UserAnnotation => ActivityType::GpuUserAnnotation,
        other => other,
    }
}
