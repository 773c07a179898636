//! Counters for one pack or unpack pass.  A single value is threaded through
//! the pass and handed back to the caller at the end.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackStats {
    /// Blocks sent, in either form.
    pub packed:        u64,
    /// Blocks sent as compact leaf records.
    pub leaves:        u64,
    /// Blocks sent verbatim.
    pub full_blocks:   u64,
    /// Leaves the validity gate refused.
    pub bad_leaves:    u64,
    pub internals:     u64,
    /// Unclassifiable blocks left out.
    pub skipped:       u64,
    pub read_errors:   u64,
    /// Bytes of records written, framing included.
    pub bytes_sent:    u64,
    /// Bytes the same blocks would take uncompressed.
    pub bytes_raw:     u64,
}

impl PackStats {
    /// Sent bytes over raw bytes; 1.0 before anything was sent.
    pub fn ratio(&self) -> f64 {
        if self.bytes_raw == 0 {
            return 1.0;
        }
        self.bytes_sent as f64 / self.bytes_raw as f64
    }

    pub(crate) fn sent(&mut self, record_bytes: u64, block_size: usize) {
        self.packed += 1;
        self.bytes_sent += record_bytes;
        self.bytes_raw += block_size as u64;
    }

    pub fn summary(&self) -> String {
        format!(
            "packed {} blocks: {} leaves, {} full ({} bad leaves, {} internal), \
             {} skipped, {} unreadable; ratio {:.3}",
            self.packed,
            self.leaves,
            self.full_blocks,
            self.bad_leaves,
            self.internals,
            self.skipped,
            self.read_errors,
            self.ratio(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnpackStats {
    pub leaves:           u64,
    pub full_blocks:      u64,
    /// Full blocks written to the separate journal device.
    pub journal_blocks:   u64,
    /// Full blocks dropped because no journal device was given.
    pub journal_skipped:  u64,
    pub write_errors:     u64,
    /// Legacy progress bytes skipped in the stream.
    pub progress_bytes:   u64,
}

impl UnpackStats {
    pub fn restored(&self) -> u64 {
        self.leaves + self.full_blocks + self.journal_blocks
    }

    pub fn summary(&self) -> String {
        format!(
            "restored {} blocks: {} leaves, {} full, {} journal; {} journal blocks dropped, {} write errors",
            self.restored(),
            self.leaves,
            self.full_blocks,
            self.journal_blocks,
            self.journal_skipped,
            self.write_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_nothing_is_one() {
        assert_eq!(PackStats::default().ratio(), 1.0);
    }

    #[test]
    fn ratio_tracks_sent_bytes() {
        let mut s = PackStats::default();
        s.sent(1024, 4096);
        s.sent(1024, 4096);
        assert_eq!(s.packed, 2);
        assert!((s.ratio() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn stats_serialise_to_json() {
        let s = PackStats { leaves: 3, ..Default::default() };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"leaves\":3"));
        let back: PackStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
