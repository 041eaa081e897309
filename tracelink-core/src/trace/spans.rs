//! Trace span registry
//!
//! Owns every CPU/GPU span pair of a collection. Pairs live in an append-only
//! arena and are addressed by [`SpanPairId`], so handles held by the
//! correlation index stay valid while more pairs are recorded.

use std::collections::BTreeMap;

use crate::activity::{Activity, TraceSpan};

/// Prefix of the synthesized device-side span
pub const GPU_SPAN_PREFIX: &str = "GPU: ";

/// Stable handle to a recorded span pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanPairId(usize);

/// A CPU-side span and its GPU-side counterpart
#[derive(Debug, Clone, PartialEq)]
pub struct CpuGpuSpanPair {
    pub cpu: TraceSpan,
    /// Starts empty and only ever widens
    pub gpu: TraceSpan,
    disabled: bool,
}

impl CpuGpuSpanPair {
    /// Disabled spans are kept for correlation but not logged
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

/// All span pairs of a collection, grouped by name in iteration order
#[derive(Debug, Default)]
pub struct TraceSpanRegistry {
    pairs: Vec<CpuGpuSpanPair>,
    by_name: BTreeMap<String, Vec<SpanPairId>>,
}

impl TraceSpanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `span` and creates its GPU-side counterpart.
    ///
    /// The counterpart inherits the name and iteration, starts at 0 and
    /// carries `gpu_op_count` as its op count.
    pub fn record(&mut self, span: &TraceSpan, gpu_op_count: i32) -> SpanPairId {
        let gpu = TraceSpan {
            start_time: 0,
            end_time: 0,
            op_count: gpu_op_count,
            iteration: span.iteration,
            name: span.name.clone(),
            prefix: GPU_SPAN_PREFIX.to_string(),
        };
        let id = SpanPairId(self.pairs.len());
        self.pairs.push(CpuGpuSpanPair {
            cpu: span.clone(),
            gpu,
            disabled: false,
        });
        self.by_name.entry(span.name.clone()).or_default().push(id);
        id
    }

    pub fn get(&self, id: SpanPairId) -> Option<&CpuGpuSpanPair> {
        self.pairs.get(id.0)
    }

    /// Marks every pair recorded under `name` as disabled
    pub fn disable_name(&mut self, name: &str) {
        if let Some(ids) = self.by_name.get(name) {
            for id in ids {
                if let Some(pair) = self.pairs.get_mut(id.0) {
                    pair.disabled = true;
                }
            }
        }
    }

    pub fn is_disabled(&self, id: SpanPairId) -> bool {
        self.get(id).map(|pair| pair.disabled).unwrap_or(false)
    }

    /// Widens the GPU-side span of `id` to cover `gpu_op`
    pub fn extend_gpu_span(&mut self, id: SpanPairId, gpu_op: &Activity) {
        let Some(pair) = self.pairs.get_mut(id.0) else {
            return;
        };
        let gpu = &mut pair.gpu;
        if gpu_op.start_time < gpu.start_time || gpu.start_time == 0 {
            gpu.start_time = gpu_op.start_time;
        }
        if gpu_op.end_time > gpu.end_time {
            gpu.end_time = gpu_op.end_time;
        }
    }

    /// Pairs recorded under `name`, in iteration order
    pub fn iterations(&self, name: &str) -> impl Iterator<Item = &CpuGpuSpanPair> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.pairs.get(id.0))
    }

    /// All pairs, by name then iteration order
    pub fn iter(&self) -> impl Iterator<Item = &CpuGpuSpanPair> {
        self.by_name
            .values()
            .flatten()
            .filter_map(move |id| self.pairs.get(id.0))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityType;

    fn span(name: &str, start: i64, end: i64, iteration: i32) -> TraceSpan {
        let mut span = TraceSpan::new(start, end, name);
        span.iteration = iteration;
        span
    }

    #[test]
    fn test_record_creates_gpu_counterpart() {
        let mut registry = TraceSpanRegistry::new();
        let id = registry.record(&span("resnet", 100, 200, 0), 4);

        let pair = registry.get(id).unwrap();
        assert_eq!(pair.cpu.start_time, 100);
        assert_eq!(pair.gpu.start_time, 0);
        assert_eq!(pair.gpu.op_count, 4);
        assert_eq!(pair.gpu.prefix, GPU_SPAN_PREFIX);
        assert_eq!(pair.gpu.name, "resnet");
    }

    #[test]
    fn test_handles_stay_valid_across_inserts() {
        let mut registry = TraceSpanRegistry::new();
        let first = registry.record(&span("net", 0, 10, 0), 1);
        for i in 1..500 {
            registry.record(&span("net", i * 10, i * 10 + 10, i as i32), 1);
        }
        registry.record(&span("other", 0, 10, 0), 1);

        let pair = registry.get(first).unwrap();
        assert_eq!(pair.cpu.iteration, 0);
        assert_eq!(pair.cpu.end_time, 10);
        assert_eq!(registry.iterations("net").count(), 500);
        assert_eq!(registry.len(), 501);
    }

    #[test]
    fn test_disable_marks_every_iteration_of_name() {
        let mut registry = TraceSpanRegistry::new();
        let a0 = registry.record(&span("a", 0, 10, 0), 0);
        let a1 = registry.record(&span("a", 10, 20, 1), 0);
        let b0 = registry.record(&span("b", 0, 10, 0), 0);

        registry.disable_name("a");

        assert!(registry.is_disabled(a0));
        assert!(registry.is_disabled(a1));
        assert!(!registry.is_disabled(b0));
        // Disabled pairs are still owned by the registry
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_gpu_span_widens_monotonically() {
        let mut registry = TraceSpanRegistry::new();
        let id = registry.record(&span("net", 0, 100, 0), 2);

        let k1 = Activity::new(ActivityType::ConcurrentKernel, "k1", 150, 170);
        let k2 = Activity::new(ActivityType::ConcurrentKernel, "k2", 140, 160);
        let k3 = Activity::new(ActivityType::ConcurrentKernel, "k3", 155, 165);
        registry.extend_gpu_span(id, &k1);
        registry.extend_gpu_span(id, &k2);
        registry.extend_gpu_span(id, &k3);

        let gpu = &registry.get(id).unwrap().gpu;
        assert_eq!((gpu.start_time, gpu.end_time), (140, 170));
    }

    #[test]
    fn test_iter_orders_by_name() {
        let mut registry = TraceSpanRegistry::new();
        registry.record(&span("zeta", 0, 1, 0), 0);
        registry.record(&span("alpha", 0, 1, 0), 0);
        registry.record(&span("zeta", 1, 2, 1), 0);

        let names: Vec<_> = registry
            .iter()
            .map(|p| (p.cpu.name.as_str(), p.cpu.iteration))
            .collect();
        assert_eq!(names, vec![("alpha", 0), ("zeta", 0), ("zeta", 1)]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
