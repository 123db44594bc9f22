// src/lib.rs

//! Live looper with a drum backing track.

pub mod asset;
pub mod audio_device;
pub mod audio_engine;
pub mod audio_io;
pub mod drum_engine;
pub mod drum_kit;
pub mod error;
pub mod looper;
pub mod midi;
pub mod scheduler;
pub mod settings;
