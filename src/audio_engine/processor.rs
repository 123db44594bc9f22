// FILE: src\audio_engine\processor.rs
// ====================================

use super::helpers::{Frame, SILENT_FRAME};
use super::song::Song;
use super::transport::LoopTransport;
use crate::looper::SharedLooperState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Input kept while a command holds the song, about a third of a second at
/// 48 kHz. Anything beyond is lost.
const HELD_INPUT_FRAMES: usize = 16_384;

/// Body of the audio callback. Owned by the backend for the length of one
/// playback session; never blocks and never logs.
pub struct BlockProcessor {
    song: Arc<Mutex<Song>>,
    transport: Arc<LoopTransport>,
    status: SharedLooperState,
    missed_blocks: Arc<AtomicUsize>,
    held_input: Vec<Frame>,
    held_idx: usize,
}

impl BlockProcessor {
    pub fn new(
        song: Arc<Mutex<Song>>,
        transport: Arc<LoopTransport>,
        status: SharedLooperState,
        missed_blocks: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            song,
            transport,
            status,
            missed_blocks,
            held_input: Vec::with_capacity(HELD_INPUT_FRAMES),
            held_idx: 0,
        }
    }

    pub fn transport(&self) -> &Arc<LoopTransport> {
        &self.transport
    }

    /// Fills `output` with one block and records `input` when recording.
    /// Blocks arriving after the stop event are left silent. When a command
    /// holds the song the block plays silent, and its input is recorded with
    /// the next block that gets the song.
    pub fn process(&mut self, input: &[Frame], output: &mut [Frame]) {
        output.fill(SILENT_FRAME);
        if self.transport.is_stopped() {
            return;
        }

        let idx = self.transport.idx();
        let n = input.len().min(output.len());
        let song = Arc::clone(&self.song);
        let guard = match song.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match guard {
            Some(guard) => self.play_and_record(guard, &input[..n], output, idx),
            None => {
                self.missed_blocks.fetch_add(1, Ordering::Relaxed);
                if self.transport.is_recording() {
                    self.hold_input(&input[..n], idx);
                }
            }
        }

        let new_idx = self.transport.advance(output.len());
        self.status.set_play_index(new_idx);
        if let Some(stop_length) = self.transport.stop_length() {
            if new_idx >= stop_length {
                self.transport.stop_now();
            }
        }
    }

    fn play_and_record(
        &mut self,
        mut song: MutexGuard<'_, Song>,
        input: &[Frame],
        output: &mut [Frame],
        idx: usize,
    ) {
        let part = song.part_now_mut();
        part.play(output, idx, self.transport.drum());
        if self.transport.is_recording() {
            if !self.held_input.is_empty() {
                part.record(&self.held_input, self.held_idx);
            }
            part.record(input, idx);
        }
        self.held_input.clear();
    }

    /// Appends to the held input while it is contiguous and within capacity.
    fn hold_input(&mut self, input: &[Frame], idx: usize) {
        if self.held_input.is_empty() {
            self.held_idx = idx;
        } else if self.held_idx + self.held_input.len() != idx {
            return;
        }
        let room = HELD_INPUT_FRAMES - self.held_input.len();
        self.held_input.extend_from_slice(&input[..input.len().min(room)]);
    }
}
