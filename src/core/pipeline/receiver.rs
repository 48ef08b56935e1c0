//! Reassembly & progress tracking for one inbound transfer.
//!
//! A [`Reassembly`] owns the arrival-ordered segment list, the running
//! byte total, and the declared size from `file-meta`. Segments are never
//! reordered — the byte channel guarantees order and the protocol carries
//! no sequence numbers — and the buffer is discarded on finalization.
//!
//! Each `Reassembly` is independent; multiple instances can run for
//! different transfers without shared state.

use crate::core::pipeline::frame::ControlFrame;
use crate::core::transfer::Progress;
use bytes::Bytes;
use tracing::warn;

/// Metadata captured from the `file-meta` frame.
#[derive(Debug, Clone)]
pub struct ReceivedMeta {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub sender_id: String,
}

/// The finalized artifact plus the accounting that produced it.
#[derive(Debug)]
pub struct FinalizedFile {
    pub meta: ReceivedMeta,
    /// All received bytes, concatenated in arrival order.
    pub data: Vec<u8>,
    /// Set when the running total differs from the declared size — a
    /// protocol violation. The artifact is still produced from whatever
    /// accumulated; callers may choose to treat the flag as fatal.
    pub size_mismatch: bool,
}

/// Per-transfer reassembly buffer and progress tracker.
pub struct Reassembly {
    meta: ReceivedMeta,
    segments: Vec<Bytes>,
    received: u64,
    progress: Progress,
}

impl Reassembly {
    /// Start a fresh buffer for the declared file. Called exactly once,
    /// on `file-meta`.
    pub fn new(frame: &ControlFrame) -> Option<Self> {
        let ControlFrame::FileMeta {
            file_name,
            file_size,
            file_type,
            sender_id,
        } = frame
        else {
            return None;
        };
        // A zero-byte declaration is complete before any segment arrives.
        let mut progress = Progress::default();
        progress.update(0, *file_size);
        Some(Self {
            meta: ReceivedMeta {
                file_name: file_name.clone(),
                file_size: *file_size,
                file_type: file_type.clone(),
                sender_id: sender_id.clone(),
            },
            segments: Vec::new(),
            received: 0,
            progress,
        })
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn declared_size(&self) -> u64 {
        self.meta.file_size
    }

    /// Current percentage, monotone and capped at 100.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Append one binary frame in arrival order and advance the counter.
    /// Returns the updated progress reading.
    pub fn push_segment(&mut self, segment: Bytes) -> Progress {
        self.received += segment.len() as u64;
        self.segments.push(segment);
        self.progress.update(self.received, self.meta.file_size)
    }

    /// Finalize on `file-end`: concatenate all segments in arrival order
    /// into one artifact and discard the buffer.
    pub fn finalize(self) -> FinalizedFile {
        let size_mismatch = self.received != self.meta.file_size;
        if size_mismatch {
            warn!(
                event = "transfer_size_mismatch",
                file = %self.meta.file_name,
                declared = self.meta.file_size,
                received = self.received,
                "Received total differs from declared size; keeping artifact"
            );
        }

        let mut data = Vec::with_capacity(self.received as usize);
        for segment in &self.segments {
            data.extend_from_slice(segment);
        }
        FinalizedFile {
            meta: self.meta,
            data,
            size_mismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> ControlFrame {
        ControlFrame::FileMeta {
            file_name: "report.pdf".into(),
            file_size: size,
            file_type: "application/pdf".into(),
            sender_id: "1".into(),
        }
    }

    #[test]
    fn two_full_chunks_reassemble_exactly() {
        let mut r = Reassembly::new(&meta(32768)).unwrap();
        let p = r.push_segment(Bytes::from(vec![0xAA; 16384]));
        assert_eq!(p.percent(), 50);
        let p = r.push_segment(Bytes::from(vec![0xBB; 16384]));
        assert_eq!(p.percent(), 100);

        let done = r.finalize();
        assert!(!done.size_mismatch);
        assert_eq!(done.data.len(), 32768);
        assert_eq!(done.data[0], 0xAA);
        assert_eq!(done.data[32767], 0xBB);
    }

    #[test]
    fn arrival_order_is_preserved() {
        let mut r = Reassembly::new(&meta(6)).unwrap();
        r.push_segment(Bytes::from_static(b"ab"));
        r.push_segment(Bytes::from_static(b"cd"));
        r.push_segment(Bytes::from_static(b"ef"));
        assert_eq!(r.finalize().data, b"abcdef");
    }

    #[test]
    fn progress_never_exceeds_100() {
        let mut r = Reassembly::new(&meta(10)).unwrap();
        let p = r.push_segment(Bytes::from(vec![0; 25]));
        assert_eq!(p.percent(), 100);
        let done = r.finalize();
        assert!(done.size_mismatch);
        assert_eq!(done.data.len(), 25);
    }

    #[test]
    fn short_delivery_is_flagged_not_dropped() {
        let mut r = Reassembly::new(&meta(1000)).unwrap();
        r.push_segment(Bytes::from(vec![7; 400]));
        let done = r.finalize();
        assert!(done.size_mismatch);
        assert_eq!(done.data.len(), 400);
    }

    #[test]
    fn zero_byte_file_finalizes_empty_and_complete() {
        let r = Reassembly::new(&meta(0)).unwrap();
        assert_eq!(r.progress().percent(), 100);
        let done = r.finalize();
        assert!(!done.size_mismatch);
        assert!(done.data.is_empty());
    }

    #[test]
    fn buffer_requires_a_meta_frame() {
        assert!(Reassembly::new(&ControlFrame::FileEnd {}).is_none());
    }
}
