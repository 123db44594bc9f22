// src/looper.rs
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LooperState {
    Stopped,
    Playing,
    Recording,
}

impl From<u8> for LooperState {
    fn from(val: u8) -> Self {
        match val {
            1 => LooperState::Playing,
            2 => LooperState::Recording,
            _ => LooperState::Stopped,
        }
    }
}

/// Snapshot of the engine published for status display.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LooperStatus {
    pub state: LooperState,
    pub part_now: usize,
    pub part_next: usize,
    pub layers: usize,
    pub part_length: usize,
    pub play_index: usize,
}

/// State that is shared between the engine and whoever displays it.
#[derive(Clone)]
pub struct SharedLooperState {
    state: Arc<AtomicU8>,
    part_now: Arc<AtomicUsize>,
    part_next: Arc<AtomicUsize>,
    layers: Arc<AtomicUsize>,
    part_length: Arc<AtomicUsize>,
    play_index: Arc<AtomicUsize>,
}

impl SharedLooperState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LooperState::Stopped as u8)),
            part_now: Arc::new(AtomicUsize::new(0)),
            part_next: Arc::new(AtomicUsize::new(0)),
            layers: Arc::new(AtomicUsize::new(0)),
            part_length: Arc::new(AtomicUsize::new(0)),
            play_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get(&self) -> LooperState {
        self.state.load(Ordering::Relaxed).into()
    }

    pub fn set(&self, state: LooperState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_parts(&self, now: usize, next: usize) {
        self.part_now.store(now, Ordering::Relaxed);
        self.part_next.store(next, Ordering::Relaxed);
    }

    pub fn set_part_shape(&self, layers: usize, length: usize) {
        self.layers.store(layers, Ordering::Relaxed);
        self.part_length.store(length, Ordering::Relaxed);
    }

    pub fn set_play_index(&self, idx: usize) {
        self.play_index.store(idx, Ordering::Relaxed);
    }

    pub fn status(&self) -> LooperStatus {
        LooperStatus {
            state: self.get(),
            part_now: self.part_now.load(Ordering::Relaxed),
            part_next: self.part_next.load(Ordering::Relaxed),
            layers: self.layers.load(Ordering::Relaxed),
            part_length: self.part_length.load(Ordering::Relaxed),
            play_index: self.play_index.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedLooperState {
    fn default() -> Self {
        Self::new()
    }
}
