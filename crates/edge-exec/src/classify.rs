//! Destructive hit-count classification.
//!
//! Raw per-edge hit counts are collapsed into coarse power-of-two buckets so
//! that "ran the loop 7 times" and "ran the loop 6 times" land in the same
//! equivalence class. Downstream code treats the rewritten bitmap as a map of
//! bucket identities, which is what makes virgin-bit comparison meaningful.

// ---------------------------------------------------------------------------
// Bucket tables
//
// The byte-level map is:
//   0 -> 0, 1 -> 1, 2 -> 2, 3 -> 4, 4-7 -> 8, 8-15 -> 16,
//   16-31 -> 32, 32-127 -> 64, 128-255 -> 128
//
// Classification runs after every exec over the whole bitmap, so the byte
// table is widened to a 65,536-entry word table that rewrites two bytes per
// lookup. Both tables are built at compile time.
// ---------------------------------------------------------------------------

const fn build_class8() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut n = 1usize;
    while n < 256 {
        table[n] = match n {
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        n += 1;
    }
    table
}

const CLASS8: [u8; 256] = build_class8();

const fn build_class16() -> [u16; 65536] {
    let mut table = [0u16; 65536];
    let mut word = 0usize;
    while word < 65536 {
        table[word] = ((CLASS8[word >> 8] as u16) << 8) | CLASS8[word & 0xff] as u16;
        word += 1;
    }
    table
}

static CLASS16: [u16; 65536] = build_class16();

/// Rewrite every byte of `trace` into its bucket, in place.
///
/// Scans eight bytes at a time and skips zero words — the map is sparse for
/// nearly every run. Idempotent: every bucket value maps to itself.
pub fn classify_counts(trace: &mut [u8]) {
    debug_assert_eq!(trace.len() % 8, 0);

    for chunk in trace.chunks_exact_mut(8) {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap());
        if word == 0 {
            continue;
        }
        for pair in chunk.chunks_exact_mut(2) {
            let w = u16::from_ne_bytes([pair[0], pair[1]]);
            pair.copy_from_slice(&CLASS16[w as usize].to_ne_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        let expect = [
            (0u8, 0u8),
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (255, 128),
        ];
        for (raw, bucket) in expect {
            assert_eq!(CLASS8[raw as usize], bucket, "raw count {}", raw);
        }
    }

    #[test]
    fn test_word_table_covers_both_lanes() {
        assert_eq!(CLASS16[0x0000], 0x0000);
        assert_eq!(CLASS16[0x0103], 0x0104);
        assert_eq!(CLASS16[0xff01], 0x8001);
        assert_eq!(CLASS16[0x2040], 0x4040);
    }

    #[test]
    fn test_classify_in_place() {
        let mut trace = vec![0u8; 64];
        trace[0] = 3;
        trace[9] = 200;
        trace[63] = 1;
        classify_counts(&mut trace);
        assert_eq!(trace[0], 4);
        assert_eq!(trace[9], 128);
        assert_eq!(trace[63], 1);
        assert!(trace[1..9].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_classify_idempotent() {
        let mut trace: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        classify_counts(&mut trace);
        let once = trace.clone();
        classify_counts(&mut trace);
        assert_eq!(trace, once);
    }

    #[test]
    fn test_zero_map_untouched() {
        let mut trace = vec![0u8; 256];
        classify_counts(&mut trace);
        assert!(trace.iter().all(|&b| b == 0));
    }
}
