//! Per-element counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Lock-free counters shared between the streaming thread and the drain
/// thread.
#[derive(Debug, Default)]
pub struct ElementMetrics {
    /// Pictures handed to the hardware encoder.
    pub frames_submitted: AtomicU64,
    /// Access units pushed downstream.
    pub units_emitted: AtomicU64,
    /// Submissions answered with "needs more input".
    pub need_more_input: AtomicU64,
    pub reconfigures: AtomicU64,
    pub reinits: AtomicU64,
    /// Pictures submitted to the hardware decoder.
    pub frames_decoded: AtomicU64,
    /// Display callbacks that produced an output frame.
    pub frames_displayed: AtomicU64,
    /// Outputs without a matching pending frame.
    pub synthesized_outputs: AtomicU64,
    pub copy_failures: AtomicU64,
}

/// Point-in-time copy of [`ElementMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_submitted: u64,
    pub units_emitted: u64,
    pub need_more_input: u64,
    pub reconfigures: u64,
    pub reinits: u64,
    pub frames_decoded: u64,
    pub frames_displayed: u64,
    pub synthesized_outputs: u64,
    pub copy_failures: u64,
}

impl ElementMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Acquire),
            units_emitted: self.units_emitted.load(Ordering::Acquire),
            need_more_input: self.need_more_input.load(Ordering::Acquire),
            reconfigures: self.reconfigures.load(Ordering::Acquire),
            reinits: self.reinits.load(Ordering::Acquire),
            frames_decoded: self.frames_decoded.load(Ordering::Acquire),
            frames_displayed: self.frames_displayed.load(Ordering::Acquire),
            synthesized_outputs: self.synthesized_outputs.load(Ordering::Acquire),
            copy_failures: self.copy_failures.load(Ordering::Acquire),
        }
    }

    /// Accounting invariants.  Should hold at any quiescent point.
    pub fn validate(&self) -> bool {
        let s = self.snapshot();
        s.units_emitted <= s.frames_submitted && s.synthesized_outputs <= s.frames_displayed
    }

    pub fn report(&self, element: &str) {
        let s = self.snapshot();
        info!(
            element,
            submitted = s.frames_submitted,
            emitted = s.units_emitted,
            need_more_input = s.need_more_input,
            reconfigures = s.reconfigures,
            reinits = s.reinits,
            decoded = s.frames_decoded,
            displayed = s.frames_displayed,
            synthesized = s.synthesized_outputs,
            copy_failures = s.copy_failures,
            "element metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_cannot_exceed_submitted() {
        let m = ElementMetrics::new();
        ElementMetrics::bump(&m.frames_submitted);
        ElementMetrics::bump(&m.units_emitted);
        assert!(m.validate());
        ElementMetrics::bump(&m.units_emitted);
        assert!(!m.validate());
    }

    #[test]
    fn snapshot_serializes() {
        let m = ElementMetrics::new();
        ElementMetrics::bump(&m.reinits);
        let snap = m.snapshot();
        assert_eq!(snap.reinits, 1);
        assert_eq!(snap.frames_submitted, 0);
    }
}
