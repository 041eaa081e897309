//! Per-trace correlation state
//!
//! Three structures cross-link the records of one collection:
//!
//! - [`TraceSpanRegistry`] owns every CPU/GPU span pair
//! - [`CorrelationIndex`] resolves hardware correlation ids to CPU activities
//!   and span pairs
//! - [`GpuSpanSynthesizer`] grows device-side spans for user annotations
//!
//! The index and the synthesizer only hold handles, never owned data. Reset
//! order is index, synthesizer, registry.

mod correlation;
mod gpu_spans;
mod spans;

pub use correlation::{CorrelationFlow, CorrelationIndex};
pub use gpu_spans::GpuSpanSynthesizer;
pub use spans::{CpuGpuSpanPair, SpanPairId, TraceSpanRegistry, GPU_SPAN_PREFIX};
