// FILE: src\drum_engine\compiler.rs
// ==================================

use crate::audio_engine::helpers::{record_wrapped, scale_frame, Frame, SILENT_FRAME};
use crate::drum_kit::{DrumPattern, DrumPatternLibrary};
use rayon::prelude::*;

/// Every pattern, fill and ending of a kit rendered to one bar of `length`
/// frames. Replaced as a whole, never mutated after rendering.
#[derive(Debug, Default)]
pub struct CompiledDrum {
    pub length: usize,
    pub patterns: Vec<Vec<Frame>>,
    pub fills: Vec<Vec<Frame>>,
    pub endings: Vec<Vec<Frame>>,
}

impl CompiledDrum {
    pub fn is_playable(&self) -> bool {
        !self.patterns.is_empty() && !self.fills.is_empty() && !self.endings.is_empty()
    }
}

pub struct DrumPatternCompiler<'a> {
    library: &'a DrumPatternLibrary,
    volume: f32,
    swing: f64,
}

impl<'a> DrumPatternCompiler<'a> {
    pub fn new(library: &'a DrumPatternLibrary, volume: f32, swing: f64) -> Self {
        Self {
            library,
            volume,
            swing,
        }
    }

    pub fn prepare_all(&self, length: usize) -> CompiledDrum {
        let render_all = |patterns: &[DrumPattern]| -> Vec<Vec<Frame>> {
            patterns.par_iter().map(|p| self.render(p, length)).collect()
        };
        let (patterns, (fills, endings)) = rayon::join(
            || render_all(&self.library.patterns),
            || {
                rayon::join(
                    || render_all(&self.library.fills),
                    || render_all(&self.library.endings),
                )
            },
        );
        CompiledDrum {
            length,
            patterns,
            fills,
            endings,
        }
    }

    /// Renders one pattern into a bar of `length` frames.
    pub fn render(&self, pattern: &DrumPattern, length: usize) -> Vec<Frame> {
        let mut bar = vec![SILENT_FRAME; length.max(1)];
        if length == 0 {
            return bar;
        }
        for (sound_name, hits) in &pattern.notes {
            let Some(sound) = self.library.sounds.get(sound_name) else {
                continue;
            };
            if hits.is_empty() {
                continue;
            }
            let sound_volume = sound.volume;
            let sound = &sound.frames[..sound.frames.len().min(length)];
            let step_len = length as f64 / hits.len() as f64;

            for (step, _) in hits.iter().enumerate().filter(|(_, hit)| **hit) {
                let accent = pattern.accents.get(step).copied().unwrap_or(0) as f32;
                let volume = sound_volume * accent * self.volume / 9.0;
                let scaled: Vec<Frame> = sound.iter().map(|f| scale_frame(f, volume)).collect();
                let pos = position_with_swing(step, step_len, self.swing);
                record_wrapped(&mut bar, &scaled, pos);
            }
        }
        bar
    }
}

/// Start of `step` in frames. Odd steps are pushed late by
/// `step_len * (swing - 0.5)`.
pub fn position_with_swing(step: usize, step_len: f64, swing: f64) -> usize {
    let straight = step as f64 * step_len;
    if step % 2 == 0 {
        straight.round() as usize
    } else {
        (straight + step_len * (swing - 0.5)).round() as usize
    }
}
