//! Virgin bitmap, per-edge running maxima, and the derived run signals.
//!
//! The engine owns the process-wide reference state that a run's telemetry is
//! compared against: `virgin` starts all-ones and loses a bit the first time
//! the corresponding bucket shows up at an edge, `max_counts` starts at zero
//! and only ever grows. Both reset together when a new agent session begins.
//!
//! Warmup runs must not touch the engine at all — the caller simply does not
//! call [`FeedbackEngine::has_new_bits`] / [`FeedbackEngine::has_new_max`]
//! for them.

use crate::{MAP_SIZE, PERF_SIZE};

/// What a run contributed to the coverage map.
///
/// The driver treats the two non-trivial flavors differently: a new edge
/// signals a novel control path, a refined edge a stronger repetition of a
/// known one. The numeric values are the wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NewCoverage {
    None = 0,
    EdgeRefined = 1,
    NewEdge = 2,
}

pub struct FeedbackEngine {
    virgin: Box<[u8]>,
    max_counts: Box<[u32]>,
}

impl FeedbackEngine {
    pub fn new() -> Self {
        Self {
            virgin: vec![0xff; MAP_SIZE].into_boxed_slice(),
            max_counts: vec![0u32; PERF_SIZE].into_boxed_slice(),
        }
    }

    /// Forget everything. Called when a new agent connection begins, so each
    /// session starts from a blank slate.
    pub fn reset_session(&mut self) {
        self.virgin.fill(0xff);
        self.max_counts.fill(0);
    }

    /// Compare a classified trace against the virgin map, clearing every bit
    /// the trace set. Returns the strongest find; subsequent identical traces
    /// return [`NewCoverage::None`].
    ///
    /// Scans in 64-bit lockstep and bails out of each word early — for almost
    /// every run, no bit of the trace survives in virgin.
    pub fn has_new_bits(&mut self, trace: &[u8]) -> NewCoverage {
        debug_assert_eq!(trace.len(), self.virgin.len());

        let mut ret = NewCoverage::None;

        for (cur, vir) in trace
            .chunks_exact(8)
            .zip(self.virgin.chunks_exact_mut(8))
        {
            let c = u64::from_ne_bytes(cur.try_into().unwrap());
            if c == 0 {
                continue;
            }
            let v = u64::from_ne_bytes((&*vir).try_into().unwrap());
            if c & v == 0 {
                continue;
            }

            if ret < NewCoverage::NewEdge {
                // A byte that is non-zero in the trace while still 0xff in
                // virgin means the edge itself was never hit before; anything
                // else is a new bucket at a known edge.
                let fresh_edge = cur
                    .iter()
                    .zip(vir.iter())
                    .any(|(&cb, &vb)| cb != 0 && vb == 0xff);
                ret = if fresh_edge {
                    NewCoverage::NewEdge
                } else {
                    NewCoverage::EdgeRefined
                };
            }

            vir.copy_from_slice(&(v & !c).to_ne_bytes());
        }

        ret
    }

    /// Scan the per-edge counters (slot 0, the aggregate, excluded) for a new
    /// running maximum. Every update is reported through `on_update` with
    /// `(index, previous, new)` before being recorded.
    pub fn has_new_max<F>(&mut self, perf: &[u32], mut on_update: F) -> bool
    where
        F: FnMut(usize, u32, u32),
    {
        debug_assert_eq!(perf.len(), self.max_counts.len());

        let mut any = false;
        for (i, (&cur, max)) in perf.iter().zip(self.max_counts.iter_mut()).enumerate().skip(1) {
            if cur > *max {
                on_update(i, *max, cur);
                *max = cur;
                any = true;
            }
        }
        any
    }

    /// Number of edges that have been seen at least once, for coverage stats.
    pub fn covered_bytes(&self) -> usize {
        self.virgin.iter().filter(|&&b| b != 0xff).count()
    }

    /// Raw virgin map, for the on-disk bitmap dump.
    pub fn virgin(&self) -> &[u8] {
        &self.virgin
    }
}

impl Default for FeedbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Perf-map helpers ────────────────────────────────────────────────────────

/// The aggregate execution cost the target recorded in slot 0.
pub fn total_cost(perf: &[u32]) -> u32 {
    perf[0]
}

/// Sum of every per-edge counter. Wraps at 32 bits, exactly like the
/// counters themselves, so a consistent-but-saturated map still matches.
pub fn summed_cost(perf: &[u32]) -> u32 {
    perf[1..].iter().fold(0u32, |acc, &v| acc.wrapping_add(v))
}

/// The hit count of the hottest edge, excluding the aggregate slot.
pub fn hotspot(perf: &[u32]) -> u32 {
    perf[1..].iter().copied().max().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with(entries: &[(usize, u8)]) -> Vec<u8> {
        let mut t = vec![0u8; MAP_SIZE];
        for &(i, v) in entries {
            t[i] = v;
        }
        t
    }

    fn perf_with(entries: &[(usize, u32)]) -> Vec<u32> {
        let mut p = vec![0u32; PERF_SIZE];
        for &(i, v) in entries {
            p[i] = v;
        }
        p
    }

    #[test]
    fn test_first_sighting_is_new_edge() {
        let mut engine = FeedbackEngine::new();
        let trace = trace_with(&[(10, 1), (4000, 32)]);
        assert_eq!(engine.has_new_bits(&trace), NewCoverage::NewEdge);
        // Identical trace: everything already cleared from virgin.
        assert_eq!(engine.has_new_bits(&trace), NewCoverage::None);
    }

    #[test]
    fn test_new_bucket_at_known_edge_is_refined() {
        let mut engine = FeedbackEngine::new();
        assert_eq!(
            engine.has_new_bits(&trace_with(&[(10, 1)])),
            NewCoverage::NewEdge
        );
        // Same edge, higher bucket.
        assert_eq!(
            engine.has_new_bits(&trace_with(&[(10, 8)])),
            NewCoverage::EdgeRefined
        );
        // New edge wins over a simultaneous refinement.
        assert_eq!(
            engine.has_new_bits(&trace_with(&[(10, 128), (11, 1)])),
            NewCoverage::NewEdge
        );
    }

    #[test]
    fn test_virgin_bits_only_ever_clear() {
        let mut engine = FeedbackEngine::new();
        engine.has_new_bits(&trace_with(&[(77, 2)]));
        let snapshot = engine.virgin().to_vec();
        engine.has_new_bits(&trace_with(&[(99, 4)]));
        for (i, (&now, &before)) in engine.virgin().iter().zip(snapshot.iter()).enumerate() {
            assert_eq!(now & !before, 0, "virgin bit set at {}", i);
        }
    }

    #[test]
    fn test_covered_bytes() {
        let mut engine = FeedbackEngine::new();
        assert_eq!(engine.covered_bytes(), 0);
        engine.has_new_bits(&trace_with(&[(1, 1), (2, 1), (3, 1)]));
        assert_eq!(engine.covered_bytes(), 3);
    }

    #[test]
    fn test_has_new_max_updates_and_reports() {
        let mut engine = FeedbackEngine::new();
        let mut seen = Vec::new();
        let updated = engine.has_new_max(&perf_with(&[(0, 99), (5, 7)]), |i, old, new| {
            seen.push((i, old, new))
        });
        assert!(updated);
        assert_eq!(seen, vec![(5, 0, 7)]);

        // Lower count at the same edge: no update.
        seen.clear();
        assert!(!engine.has_new_max(&perf_with(&[(5, 3)]), |i, old, new| {
            seen.push((i, old, new))
        }));
        assert!(seen.is_empty());

        // Slot 0 never participates.
        assert!(!engine.has_new_max(&perf_with(&[(0, 1_000_000)]), |_, _, _| {}));
    }

    #[test]
    fn test_max_counts_monotone_within_session() {
        let mut engine = FeedbackEngine::new();
        engine.has_new_max(&perf_with(&[(3, 10)]), |_, _, _| {});
        engine.has_new_max(&perf_with(&[(3, 4), (4, 2)]), |_, _, _| {});
        let mut relast = Vec::new();
        engine.has_new_max(&perf_with(&[(3, 11)]), |i, old, new| relast.push((i, old, new)));
        assert_eq!(relast, vec![(3, 10, 11)]);
    }

    #[test]
    fn test_reset_session() {
        let mut engine = FeedbackEngine::new();
        engine.has_new_bits(&trace_with(&[(10, 1)]));
        engine.has_new_max(&perf_with(&[(10, 5)]), |_, _, _| {});
        engine.reset_session();
        assert_eq!(engine.covered_bytes(), 0);
        assert_eq!(
            engine.has_new_bits(&trace_with(&[(10, 1)])),
            NewCoverage::NewEdge
        );
        let mut seen = Vec::new();
        engine.has_new_max(&perf_with(&[(10, 5)]), |i, old, new| seen.push((i, old, new)));
        assert_eq!(seen, vec![(10, 0, 5)]);
    }

    #[test]
    fn test_cost_helpers() {
        let perf = perf_with(&[(0, 12), (1, 5), (2, 7), (900, 3)]);
        assert_eq!(total_cost(&perf), 12);
        assert_eq!(summed_cost(&perf), 15);
        assert_eq!(hotspot(&perf), 7);

        let empty = vec![0u32; PERF_SIZE];
        assert_eq!(total_cost(&empty), 0);
        assert_eq!(summed_cost(&empty), 0);
        assert_eq!(hotspot(&empty), 0);
    }

    #[test]
    fn test_summed_cost_wraps_like_the_counters() {
        let perf = perf_with(&[(1, u32::MAX), (2, 2)]);
        assert_eq!(summed_cost(&perf), 1);
    }
}
