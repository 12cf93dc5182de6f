//! Audio jitter buffer: an ordered store of decoded frames that absorbs
//! arrival-time variance before playback.
//!
//! Frames are keyed by a monotonically increasing sequence. Output is
//! gated until the buffer warms up to its target margin; after that, the
//! pop path releases frames strictly in order and conceals gaps with the
//! configured underrun strategy.

use std::collections::BTreeMap;

/// What to play when the next frame has not arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderrunStrategy {
    Silence,
    HoldLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// A real frame was released.
    Played,
    /// Warm-up gate still closed; silence emitted, not counted.
    Warming,
    /// The expected frame was missing; concealment emitted.
    Underrun,
}

pub struct JitterBuffer {
    frames: BTreeMap<u64, Vec<f32>>,
    next_seq: u64,
    frame_samples: usize,
    /// Frames to accumulate before playback starts.
    target_frames: usize,
    /// Hard cap; beyond this the oldest frames are dropped.
    max_frames: usize,
    filled: bool,
    strategy: UnderrunStrategy,
    last_frame: Vec<f32>,
    underruns: u64,
}

impl JitterBuffer {
    /// `margin_ms` is the target occupancy; `frame_ms` the codec frame
    /// duration (margin rounds up to whole frames).
    pub fn new(
        margin_ms: u32,
        frame_ms: u32,
        frame_samples: usize,
        strategy: UnderrunStrategy,
    ) -> Self {
        let target_frames = (margin_ms.div_ceil(frame_ms).max(1)) as usize;
        Self {
            frames: BTreeMap::new(),
            next_seq: 0,
            frame_samples,
            target_frames,
            max_frames: target_frames * 8,
            filled: false,
            strategy,
            last_frame: vec![0.0; frame_samples],
            underruns: 0,
        }
    }

    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn is_filled(&self) -> bool {
        self.filled
    }

    /// Insert a decoded frame. Frames older than the playback cursor are
    /// dropped (they already missed their slot); duplicates overwrite.
    pub fn insert(&mut self, seq: u64, samples: Vec<f32>) {
        if seq < self.next_seq {
            return;
        }
        debug_assert_eq!(samples.len(), self.frame_samples);
        self.frames.insert(seq, samples);
        while self.frames.len() > self.max_frames {
            // Overfull: advance past the oldest to bound latency.
            let (&oldest, _) = self.frames.iter().next().expect("non-empty");
            self.frames.remove(&oldest);
            self.next_seq = self.next_seq.max(oldest + 1);
        }
        if !self.filled && self.frames.len() >= self.target_frames {
            self.filled = true;
        }
    }

    /// Release the next frame into `out` (zero-padded strategies fill it
    /// entirely). Returns what happened.
    pub fn pop(&mut self, out: &mut [f32]) -> PopOutcome {
        debug_assert_eq!(out.len(), self.frame_samples);

        if !self.filled {
            out.fill(0.0);
            return PopOutcome::Warming;
        }

        if let Some(samples) = self.frames.remove(&self.next_seq) {
            out.copy_from_slice(&samples);
            self.last_frame.copy_from_slice(&samples);
            self.next_seq += 1;
            return PopOutcome::Played;
        }

        // Expected frame missing. If later frames already queued past the
        // reorder window, skip ahead instead of stalling forever.
        self.underruns += 1;
        match self.strategy {
            UnderrunStrategy::Silence => out.fill(0.0),
            UnderrunStrategy::HoldLast => out.copy_from_slice(&self.last_frame),
        }
        if let Some((&earliest, _)) = self.frames.iter().next()
            && self.frames.len() >= self.target_frames
        {
            self.next_seq = earliest;
        } else {
            self.next_seq += 1;
        }
        PopOutcome::Underrun
    }

    /// Drop everything and close the warm-up gate again (reconnect path).
    pub fn reset(&mut self) {
        self.frames.clear();
        self.filled = false;
        self.next_seq = 0;
        self.underruns = 0;
        self.last_frame.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 4;

    fn frame(value: f32) -> Vec<f32> {
        vec![value; N]
    }

    fn buffer(margin_frames: u32, strategy: UnderrunStrategy) -> JitterBuffer {
        // frame_ms 20, margin in whole frames for test readability
        JitterBuffer::new(margin_frames * 20, 20, N, strategy)
    }

    #[test]
    fn warm_up_gates_output() {
        let mut jb = buffer(3, UnderrunStrategy::Silence);
        let mut out = [1.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Warming);
        assert_eq!(out, [0.0; N]);

        jb.insert(0, frame(0.1));
        jb.insert(1, frame(0.2));
        assert_eq!(jb.pop(&mut out), PopOutcome::Warming);

        jb.insert(2, frame(0.3));
        assert!(jb.is_filled());
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        assert_eq!(out, [0.1; N]);
    }

    #[test]
    fn out_of_order_within_margin_plays_in_order() {
        let mut jb = buffer(3, UnderrunStrategy::Silence);
        // Arrivals shuffled inside the margin window.
        jb.insert(1, frame(0.2));
        jb.insert(0, frame(0.1));
        jb.insert(2, frame(0.3));
        jb.insert(4, frame(0.5));
        jb.insert(3, frame(0.4));

        let mut out = [0.0f32; N];
        let mut played = Vec::new();
        for _ in 0..5 {
            assert_eq!(jb.pop(&mut out), PopOutcome::Played);
            played.push(out[0]);
        }
        assert_eq!(played, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(jb.underruns(), 0);
    }

    #[test]
    fn missing_frame_counts_underrun_with_silence() {
        let mut jb = buffer(2, UnderrunStrategy::Silence);
        jb.insert(0, frame(0.1));
        jb.insert(1, frame(0.2));
        let mut out = [0.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        // Sequence 2 never arrives.
        assert_eq!(jb.pop(&mut out), PopOutcome::Underrun);
        assert_eq!(out, [0.0; N]);
        assert_eq!(jb.underruns(), 1);
    }

    #[test]
    fn hold_last_repeats_previous_frame() {
        let mut jb = buffer(1, UnderrunStrategy::HoldLast);
        jb.insert(0, frame(0.7));
        let mut out = [0.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        assert_eq!(jb.pop(&mut out), PopOutcome::Underrun);
        assert_eq!(out, [0.7; N]);
    }

    #[test]
    fn late_frame_is_dropped() {
        let mut jb = buffer(1, UnderrunStrategy::Silence);
        jb.insert(0, frame(0.1));
        let mut out = [0.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        // Sequence 0 is behind the cursor now.
        jb.insert(0, frame(0.9));
        assert_eq!(jb.buffered_frames(), 0);
    }

    #[test]
    fn gap_skips_ahead_when_buffer_is_deep() {
        let mut jb = buffer(2, UnderrunStrategy::Silence);
        jb.insert(0, frame(0.1));
        jb.insert(1, frame(0.2));
        let mut out = [0.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        // Frames 2..4 lost; 5 and 6 queued.
        jb.insert(5, frame(0.6));
        jb.insert(6, frame(0.7));
        assert_eq!(jb.pop(&mut out), PopOutcome::Underrun);
        // Cursor jumped to the earliest queued frame.
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        assert_eq!(out, [0.6; N]);
    }

    #[test]
    fn overfull_buffer_drops_oldest() {
        let mut jb = buffer(1, UnderrunStrategy::Silence);
        for seq in 0..(jb.max_frames as u64 + 4) {
            jb.insert(seq, frame(seq as f32));
        }
        assert!(jb.buffered_frames() <= jb.max_frames);
    }

    #[test]
    fn reset_closes_warm_up_gate() {
        let mut jb = buffer(1, UnderrunStrategy::Silence);
        jb.insert(0, frame(0.5));
        let mut out = [0.0f32; N];
        assert_eq!(jb.pop(&mut out), PopOutcome::Played);
        jb.reset();
        assert!(!jb.is_filled());
        assert_eq!(jb.pop(&mut out), PopOutcome::Warming);
    }
}
