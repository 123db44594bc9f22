// src/drum_engine.rs

//! Drum backing track: pattern rendering and the runtime player.

pub mod compiler;
pub mod sequencer;

pub use compiler::{CompiledDrum, DrumPatternCompiler};
pub use sequencer::{DrumConfig, DrumSequencer, Intensity};
