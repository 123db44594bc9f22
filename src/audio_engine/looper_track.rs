// FILE: src\audio_engine\looper_track.rs
// ======================================

use super::circular_buffer::CircularAudioBuffer;
use super::helpers::Frame;
use super::transport::LoopTransport;
use crate::error::LooperResult;

/// One layer of a song part. The transport is passed in by the caller, a
/// loop never keeps a reference to it.
#[derive(Clone, Debug)]
pub struct Loop {
    pub buffer: CircularAudioBuffer,
    pub is_silent: bool,
}

impl Loop {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: CircularAudioBuffer::new(capacity),
            is_silent: false,
        }
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self {
            buffer: CircularAudioBuffer::from_frames(frames),
            is_silent: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn length(&self) -> usize {
        self.buffer.length()
    }

    /// Finalizes the recording at `idx`. The first loop without a drum bar
    /// length keeps its exact length and defines the bar for the drums;
    /// later loops are rounded to whole drum bars.
    pub fn trim(&mut self, idx: usize, transport: &LoopTransport) -> LooperResult<()> {
        let drum = transport.drum();
        if drum.is_empty() {
            self.buffer.finalize(idx, 0)?;
            drum.start(self.length());
        } else {
            self.buffer.finalize(idx, drum.length() as i64)?;
        }
        log::info!("Loop trimmed to {} frames", self.length());
        Ok(())
    }

    pub fn play(&self, out: &mut [Frame], idx: usize) {
        if !self.is_silent {
            self.buffer.play(out, idx);
        }
    }

    pub fn record(&mut self, input: &[Frame], idx: usize) {
        self.buffer.record(input, idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::helpers::SILENT_FRAME;
    use crate::drum_engine::{DrumConfig, DrumSequencer};
    use crate::drum_kit::DrumPatternLibrary;
    use crate::error::LooperError;
    use crate::scheduler::{ManualClock, Scheduler};
    use std::sync::Arc;

    fn transport() -> LoopTransport {
        let scheduler = Scheduler::manual(Arc::new(ManualClock::new()));
        let config = DrumConfig {
            sample_rate: 1000,
            volume: 1.0,
            swing: 0.625,
            change_after_bars: 3,
            background_compile: false,
        };
        let drum = DrumSequencer::new(Arc::new(DrumPatternLibrary::default()), config, scheduler);
        LoopTransport::new(drum, 10)
    }

    #[test]
    fn first_loop_defines_the_drum_bar() {
        let t = transport();
        let mut first = Loop::new(10_000);
        first.record(&[[1, 1]; 100], 0);
        first.trim(1234, &t).unwrap();
        assert_eq!(first.length(), 1234);
        assert_eq!(t.drum().length(), 1234);

        let mut second = Loop::new(10_000);
        second.record(&[[1, 1]; 100], 0);
        second.trim(3000, &t).unwrap();
        assert_eq!(second.length(), 2468);
    }

    #[test]
    fn failed_trim_leaves_the_drum_alone() {
        let t = transport();
        let mut empty = Loop::new(10_000);
        assert_eq!(empty.trim(500, &t), Err(LooperError::NothingRecorded));
        assert!(t.drum().is_empty());
    }

    #[test]
    fn silent_loop_plays_nothing() {
        let mut layer = Loop::from_frames(vec![[5, 5]; 4]);
        layer.is_silent = true;
        let mut out = vec![SILENT_FRAME; 4];
        layer.play(&mut out, 0);
        assert_eq!(out, vec![SILENT_FRAME; 4]);
        layer.is_silent = false;
        layer.play(&mut out, 0);
        assert_eq!(out, vec![[5, 5]; 4]);
    }
}
