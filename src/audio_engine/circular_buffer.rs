// FILE: src\audio_engine\circular_buffer.rs
// =========================================

use super::helpers::{calc_slices, peak_of, play_wrapped, record_wrapped, Frame, SILENT_FRAME};
use crate::error::{LooperError, LooperResult};
use std::cell::Cell;

/// Stereo buffer that wraps over its end on record and playback, with
/// undo/redo snapshots.
///
/// A new buffer is "empty": it has the full recording capacity and grows a
/// recording from wherever the first `record` call lands. `finalize` is
/// called once to cut the recording to its committed length.
#[derive(Clone, Debug)]
pub struct CircularAudioBuffer {
    samples: Vec<Frame>,
    is_empty: bool,
    record_start: Option<usize>,
    pub is_reverse: bool,
    volume: Cell<Option<f32>>,
    undo: Vec<Vec<Frame>>,
    redo: Vec<Vec<Frame>>,
}

impl CircularAudioBuffer {
    /// An empty buffer able to hold a recording of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![SILENT_FRAME; capacity.max(1)],
            is_empty: true,
            record_start: None,
            is_reverse: false,
            volume: Cell::new(None),
            undo: Vec::new(),
            redo: Vec::new(),
        }
    }

    /// An already finalized buffer holding `frames`.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        let mut buffer = Self::new(1);
        buffer.samples = if frames.is_empty() { vec![SILENT_FRAME] } else { frames };
        buffer.is_empty = false;
        buffer.record_start = Some(0);
        buffer
    }

    pub fn length(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn record_start(&self) -> Option<usize> {
        self.record_start
    }

    pub fn frames(&self) -> &[Frame] {
        &self.samples
    }

    /// Peak level relative to full scale, 0 for an empty buffer.
    pub fn volume(&self) -> f32 {
        if self.is_empty {
            return 0.0;
        }
        if let Some(volume) = self.volume.get() {
            return volume;
        }
        let peak = peak_of(&self.samples) as f32 / i16::MAX as f32;
        let volume = (peak.min(1.0) * 1000.0).round() / 1000.0;
        self.volume.set(Some(volume));
        volume
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Adds `input` at `idx`. The first call on an empty buffer fixes the
    /// recording start.
    pub fn record(&mut self, input: &[Frame], idx: usize) {
        if self.is_empty && self.record_start.is_none() {
            self.record_start = Some(idx);
        }
        self.volume.set(None);
        record_wrapped(&mut self.samples, input, idx);
    }

    /// Adds the buffer content at `idx` into `out`.
    pub fn play(&self, out: &mut [Frame], idx: usize) {
        play_wrapped(&self.samples, out, idx, self.is_reverse);
    }

    /// Cuts a recording to its final length. With `reference_length > 0` the
    /// recorded length is rounded to the nearest non-zero multiple of it and
    /// the start is snapped to the nearest multiple as well. Otherwise the
    /// buffer keeps `[0, idx)` unchanged.
    pub fn finalize(&mut self, idx: usize, reference_length: i64) -> LooperResult<()> {
        if !self.is_empty {
            return Err(LooperError::AlreadyFinalized);
        }
        let start = self.record_start.ok_or(LooperError::NothingRecorded)?;
        let capacity = self.samples.len();

        let (start, length) = if reference_length <= 0 {
            if start != 0 {
                return Err(LooperError::UnalignedStart(start));
            }
            if idx == 0 {
                return Err(LooperError::EmptyRecording(idx));
            }
            if idx > capacity {
                log::warn!(
                    "Recording of {} frames exceeds capacity {}, keeping capacity",
                    idx,
                    capacity
                );
            }
            (0, idx.min(capacity))
        } else {
            let reference = reference_length as usize;
            if reference > capacity {
                return Err(LooperError::ReferenceTooLong {
                    reference,
                    capacity,
                });
            }
            let recorded = idx.saturating_sub(start);
            let mut length = round_to_multiple(recorded, reference);
            if length == 0 {
                length = reference;
            }
            let fits = capacity / reference * reference;
            if length > fits {
                log::warn!(
                    "Recording of {} frames exceeds capacity {}, keeping {}",
                    length,
                    capacity,
                    fits
                );
                length = fits;
            }
            (round_to_multiple(start, reference), length)
        };

        let (first, second) = calc_slices(capacity, length, start);
        let mut trimmed = Vec::with_capacity(length);
        trimmed.extend_from_slice(&self.samples[first]);
        if let Some(second) = second {
            trimmed.extend_from_slice(&self.samples[second]);
        }

        debug_assert!(reference_length <= 0 || trimmed.len() % reference_length as usize == 0);
        self.samples = trimmed;
        self.is_empty = false;
        self.volume.set(None);
        Ok(())
    }

    /// Snapshots the current content. New edits invalidate the redo history.
    pub fn save_undo(&mut self) {
        if !self.is_empty {
            self.redo.clear();
            self.undo.push(self.samples.clone());
        }
    }

    pub fn undo(&mut self) {
        if let Some(previous) = self.undo.pop() {
            self.redo.push(std::mem::replace(&mut self.samples, previous));
            self.volume.set(None);
        }
    }

    pub fn redo(&mut self) {
        if let Some(next) = self.redo.pop() {
            self.undo.push(std::mem::replace(&mut self.samples, next));
            self.volume.set(None);
        }
    }
}

fn round_to_multiple(value: usize, step: usize) -> usize {
    (value as f64 / step as f64).round() as usize * step
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 500_000;

    fn tone(len: usize) -> Vec<Frame> {
        (0..len)
            .map(|i| {
                let v = ((i % 200) as i16 - 100) * 30;
                [v, v]
            })
            .collect()
    }

    #[test]
    fn unquantized_finalize_keeps_exact_length() {
        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        buffer.record(&tone(100_000), 0);
        buffer.finalize(121_000, -1).unwrap();
        assert_eq!(buffer.length(), 121_000);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn quantized_finalize_rounds_to_nearest_multiple() {
        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        buffer.record(&tone(100_000), 0);
        // 121_000 / 100_000 rounds down to one bar
        buffer.finalize(121_000, 100_000).unwrap();
        assert_eq!(buffer.length(), 100_000);

        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        buffer.record(&tone(10), 0);
        buffer.finalize(151_000, 100_000).unwrap();
        assert_eq!(buffer.length(), 200_000);
    }

    #[test]
    fn short_quantized_recording_keeps_one_full_reference() {
        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        buffer.record(&tone(10_000), 0);
        buffer.finalize(10_000, 100_000).unwrap();
        assert_eq!(buffer.length(), 100_000);
    }

    #[test]
    fn quantized_length_is_always_a_positive_multiple() {
        for reference in [1_000usize, 7_919, 44_100, 100_000] {
            for start in [0usize, 17, 499, 45_000, 260_000] {
                for recorded in [1usize, 600, 49_999, 50_001, 180_000] {
                    let mut buffer = CircularAudioBuffer::new(CAPACITY);
                    buffer.record(&[[1, 1]], start);
                    buffer.finalize(start + recorded, reference as i64).unwrap();
                    assert!(buffer.length() > 0);
                    assert_eq!(buffer.length() % reference, 0);
                }
            }
        }
    }

    #[test]
    fn quantized_finalize_snaps_start_to_a_bar() {
        let mut buffer = CircularAudioBuffer::new(1_000);
        let data: Vec<Frame> = (1..=200).map(|v| [v as i16, 0]).collect();
        buffer.record(&data, 110);
        buffer.finalize(310, 100).unwrap();
        assert_eq!(buffer.length(), 200);
        // start 110 snaps to 100, so the first ten frames precede the recording
        assert!(buffer.frames()[..10].iter().all(|f| *f == SILENT_FRAME));
        assert_eq!(buffer.frames()[10], [1, 0]);
    }

    #[test]
    fn quantized_finalize_extracts_across_the_end() {
        let mut buffer = CircularAudioBuffer::new(1_000);
        let data: Vec<Frame> = (1..=200).map(|v| [v as i16, 0]).collect();
        buffer.record(&data, 900);
        buffer.finalize(1_100, 100).unwrap();
        assert_eq!(buffer.length(), 200);
        assert_eq!(buffer.frames()[0], [1, 0]);
        assert_eq!(buffer.frames()[199], [200, 0]);
    }

    #[test]
    fn unquantized_finalize_requires_start_at_zero() {
        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        buffer.record(&tone(10), 5);
        assert_eq!(buffer.finalize(1_000, 0), Err(LooperError::UnalignedStart(5)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn finalize_preconditions_are_enforced() {
        let mut buffer = CircularAudioBuffer::new(CAPACITY);
        assert_eq!(
            buffer.finalize(151_000, 100_000),
            Err(LooperError::NothingRecorded)
        );

        buffer.record(&tone(10), 0);
        buffer.finalize(1_000, 0).unwrap();
        assert_eq!(buffer.finalize(2_000, 0), Err(LooperError::AlreadyFinalized));

        let mut buffer = CircularAudioBuffer::new(1_000);
        buffer.record(&tone(10), 0);
        assert!(matches!(
            buffer.finalize(1_000, 5_000),
            Err(LooperError::ReferenceTooLong { .. })
        ));
    }

    #[test]
    fn undo_restores_snapshot_and_redo_restores_edit() {
        let mut buffer = CircularAudioBuffer::from_frames(tone(1_000));
        let original = buffer.frames().to_vec();

        buffer.save_undo();
        buffer.record(&[[500, 500]; 100], 950);
        let edited = buffer.frames().to_vec();
        assert_ne!(original, edited);

        buffer.undo();
        assert_eq!(buffer.frames(), &original[..]);
        buffer.redo();
        assert_eq!(buffer.frames(), &edited[..]);
    }

    #[test]
    fn new_snapshot_clears_redo_history() {
        let mut buffer = CircularAudioBuffer::from_frames(tone(100));
        buffer.save_undo();
        buffer.record(&[[1, 1]], 0);
        buffer.undo();
        assert_eq!(buffer.redo_len(), 1);
        buffer.save_undo();
        assert_eq!(buffer.redo_len(), 0);
        assert_eq!(buffer.undo_len(), 1);
    }

    #[test]
    fn empty_buffer_ignores_snapshots_and_undo() {
        let mut buffer = CircularAudioBuffer::new(100);
        buffer.save_undo();
        buffer.undo();
        buffer.redo();
        assert_eq!(buffer.undo_len(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.volume(), 0.0);
    }

    #[test]
    fn volume_is_recomputed_after_recording() {
        let mut buffer = CircularAudioBuffer::from_frames(vec![[0, 0]; 10]);
        assert_eq!(buffer.volume(), 0.0);
        buffer.record(&[[i16::MAX, 0]], 3);
        assert_eq!(buffer.volume(), 1.0);
    }

    #[test]
    fn reverse_only_changes_playback() {
        let mut buffer = CircularAudioBuffer::from_frames(vec![[1, 1], [2, 2], [3, 3]]);
        buffer.is_reverse = true;
        let mut out = vec![SILENT_FRAME; 3];
        buffer.play(&mut out, 0);
        assert_eq!(out, vec![[3, 3], [2, 2], [1, 1]]);
        assert_eq!(buffer.frames(), &[[1, 1], [2, 2], [3, 3]]);
    }
}
