//! Correlation index
//!
//! Links low-level correlation ids reported by the hardware backend to the
//! CPU-side activity that launched the work:
//!
//! ```text
//! low-level id ──(Default | User map)──► external id ──► ActivityRef
//!                                                   └──► SpanPairId
//! ```
//!
//! The index only stores handles. The activities live in `ActivityBuffers`
//! and the span pairs in `TraceSpanRegistry`; the index must be cleared no
//! later than either of them.

use std::collections::HashMap;

use tracing::warn;

use super::spans::SpanPairId;
use crate::activity::ActivityRef;

/// Which correlation map a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationFlow {
    /// Operator-level correlation
    Default,
    /// User-annotation correlation
    User,
}

/// Warn on the first and then every 100th occurrence
const OUT_OF_ORDER_LOG_EVERY: u64 = 100;

#[derive(Debug, Default)]
pub struct CorrelationIndex {
    default_map: HashMap<u32, u64>,
    user_map: HashMap<u32, u64>,
    events: HashMap<u64, ActivityRef>,
    span_pairs: HashMap<u64, SpanPairId>,
    out_of_order: u64,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, flow: CorrelationFlow) -> &HashMap<u32, u64> {
        match flow {
            CorrelationFlow::Default => &self.default_map,
            CorrelationFlow::User => &self.user_map,
        }
    }

    /// Maps `low_level_id` to `external_id` for `flow`. Last writer wins.
    pub fn add_correlation(&mut self, external_id: u64, low_level_id: u32, flow: CorrelationFlow) {
        let map = match flow {
            CorrelationFlow::Default => &mut self.default_map,
            CorrelationFlow::User => &mut self.user_map,
        };
        map.insert(low_level_id, external_id);
    }

    /// External id `low_level_id` currently maps to
    pub fn external_id(&self, low_level_id: u32, flow: CorrelationFlow) -> Option<u64> {
        self.map(flow).get(&low_level_id).copied()
    }

    /// Resolves `low_level_id` to its CPU-side activity.
    ///
    /// `None` means the record cannot be attributed; callers keep it
    /// unattributed.
    pub fn get_activity(&self, low_level_id: u32, flow: CorrelationFlow) -> Option<ActivityRef> {
        let external_id = self.external_id(low_level_id, flow)?;
        self.events.get(&external_id).copied()
    }

    /// Registers `activity` as the target for `external_id`
    pub fn insert_event(&mut self, external_id: u64, activity: ActivityRef) {
        if self.events.insert(external_id, activity).is_some() {
            if self.out_of_order % OUT_OF_ORDER_LOG_EVERY == 0 {
                warn!(
                    external_id,
                    occurrences = self.out_of_order + 1,
                    "events processed out of order - link will be missing"
                );
            }
            self.out_of_order += 1;
        }
    }

    /// Associates `external_id` with the span pair of the CPU trace it came from
    pub fn insert_span_pair(&mut self, external_id: u64, pair: SpanPairId) {
        self.span_pairs.insert(external_id, pair);
    }

    pub fn span_pair(&self, external_id: u64) -> Option<SpanPairId> {
        self.span_pairs.get(&external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.default_map.clear();
        self.user_map.clear();
        self.events.clear();
        self.span_pairs.clear();
        self.out_of_order = 0;
    }
}
