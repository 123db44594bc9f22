// FILE: src\audio_engine\song_part.rs
// ====================================

use super::helpers::{Frame, SILENT_FRAME};
use super::looper_track::Loop;
use super::transport::LoopTransport;
use crate::drum_engine::DrumSequencer;
use crate::error::{LooperError, LooperResult};
use std::str::FromStr;

/// Layer edits of the `loop <action>` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopAction {
    Prev,
    Next,
    Delete,
    Silent,
    Reverse,
    Move,
}

impl FromStr for LoopAction {
    type Err = LooperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prev" => Ok(LoopAction::Prev),
            "next" => Ok(LoopAction::Next),
            "delete" => Ok(LoopAction::Delete),
            "silent" => Ok(LoopAction::Silent),
            "reverse" => Ok(LoopAction::Reverse),
            "move" => Ok(LoopAction::Move),
            other => Err(LooperError::BadArgument {
                command: "loop".into(),
                reason: format!("unknown action '{}'", other),
            }),
        }
    }
}

/// Layers played together. Layer 0 is the base loop and sets the length of
/// the part; the part is empty until the base loop is recorded.
#[derive(Clone, Debug)]
pub struct SongPart {
    layers: Vec<Loop>,
    pub now: usize,
    pub next: usize,
    redo: Vec<Loop>,
}

impl SongPart {
    pub fn new(capacity: usize) -> Self {
        Self {
            layers: vec![Loop::new(capacity)],
            now: 0,
            next: 0,
            redo: Vec::new(),
        }
    }

    /// A part built from loaded layers; an empty list gives an empty part.
    pub fn from_layers(layers: Vec<Loop>, capacity: usize) -> Self {
        if layers.is_empty() {
            return Self::new(capacity);
        }
        Self {
            layers,
            now: 0,
            next: 0,
            redo: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers[0].is_empty()
    }

    pub fn length(&self) -> usize {
        self.layers[0].length()
    }

    pub fn layers(&self) -> &[Loop] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn active(&self) -> &Loop {
        &self.layers[self.now]
    }

    fn active_mut(&mut self) -> &mut Loop {
        &mut self.layers[self.now]
    }

    /// Finalizes the base loop after its first recording.
    pub fn trim(&mut self, idx: usize, transport: &LoopTransport) -> LooperResult<()> {
        self.layers[0].trim(idx, transport)
    }

    /// Prepares the active layer for an overdub. Recording on top of the
    /// base loop opens a new silent layer of the part's length; recording on
    /// any other layer snapshots it for undo. Returns false for an empty part.
    pub fn begin_overdub(&mut self) -> bool {
        self.begin_overdub_with(None)
    }

    /// True when the next overdub opens a new layer rather than recording
    /// over the active one.
    pub fn overdub_opens_layer(&self) -> bool {
        self.now == 0 && !self.active().is_empty()
    }

    /// Like [`SongPart::begin_overdub`], taking `spare` as the new layer when
    /// it has the part's length.
    pub fn begin_overdub_with(&mut self, spare: Option<Loop>) -> bool {
        if self.active().is_empty() {
            return false;
        }
        self.active_mut().is_silent = false;
        if self.now == 0 {
            let length = self.length();
            let layer = spare
                .filter(|layer| layer.length() == length)
                .unwrap_or_else(|| Loop::from_frames(vec![SILENT_FRAME; length]));
            self.layers.push(layer);
            self.now = self.layers.len() - 1;
            self.next = self.now;
        } else {
            self.active_mut().buffer.save_undo();
        }
        true
    }

    /// Snapshots the active layer before recording over it.
    pub fn save_undo(&mut self) {
        self.active_mut().buffer.save_undo();
    }

    /// Moves the newest layer to the redo stack and selects the base loop.
    pub fn undo(&mut self) -> bool {
        if self.layers.len() < 2 {
            return false;
        }
        if let Some(layer) = self.layers.pop() {
            self.redo.push(layer);
        }
        self.now = 0;
        self.next = 0;
        true
    }

    pub fn redo(&mut self) -> bool {
        match self.redo.pop() {
            Some(layer) => {
                self.layers.push(layer);
                true
            }
            None => false,
        }
    }

    /// Buffer level undo of the active layer.
    pub fn undo_loop(&mut self) {
        if !self.active().is_empty() {
            self.active_mut().buffer.undo();
        }
    }

    pub fn redo_loop(&mut self) {
        if !self.active().is_empty() {
            self.active_mut().buffer.redo();
        }
    }

    pub fn change_loop(&mut self, action: LoopAction) {
        let count = self.layers.len();
        match action {
            LoopAction::Prev => self.now = (self.now + count - 1) % count,
            LoopAction::Next => self.now = (self.now + 1) % count,
            LoopAction::Delete => {
                if count > 1 {
                    let removed = self.layers.remove(self.now);
                    self.redo.push(removed);
                    self.now = 0;
                    self.next = 0;
                }
            }
            LoopAction::Silent => {
                let layer = self.active_mut();
                layer.is_silent = !layer.is_silent;
            }
            LoopAction::Reverse => {
                let layer = self.active_mut();
                layer.buffer.is_reverse = !layer.buffer.is_reverse;
                layer.is_silent = false;
            }
            LoopAction::Move => {
                if self.now != 0 {
                    let layer = self.layers.remove(self.now);
                    self.layers.push(layer);
                    self.now = self.layers.len() - 1;
                    self.next = self.now;
                }
            }
        }
    }

    /// Mixes the drums and every audible layer into `out`.
    pub fn play(&self, out: &mut [Frame], idx: usize, drum: &DrumSequencer) {
        drum.play(out, idx);
        for layer in &self.layers {
            layer.play(out, idx);
        }
    }

    /// Records into the active layer only.
    pub fn record(&mut self, input: &[Frame], idx: usize) {
        self.active_mut().record(input, idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::tests_support::silent_drum;

    fn recorded_part(length: usize, value: i16) -> SongPart {
        SongPart::from_layers(vec![Loop::from_frames(vec![[value, value]; length])], 1000)
    }

    #[test]
    fn new_part_is_empty_with_one_layer() {
        let part = SongPart::new(1000);
        assert!(part.is_empty());
        assert_eq!(part.layer_count(), 1);
        assert_eq!(part.length(), 1000);
    }

    #[test]
    fn overdub_on_base_opens_a_new_layer() {
        let mut part = recorded_part(100, 1);
        assert!(part.begin_overdub());
        assert_eq!(part.layer_count(), 2);
        assert_eq!(part.now, 1);
        assert_eq!(part.active().length(), 100);

        part.record(&[[5, 5]; 10], 95);
        assert_eq!(part.layers()[1].buffer.frames()[99], [5, 5]);
        assert_eq!(part.layers()[1].buffer.frames()[4], [5, 5]);
        assert_eq!(part.layers()[0].buffer.frames()[99], [1, 1]);
    }

    #[test]
    fn overdub_takes_a_spare_layer_of_matching_length() {
        let mut part = recorded_part(100, 1);
        assert!(part.overdub_opens_layer());
        assert!(part.begin_overdub_with(Some(Loop::from_frames(vec![[2, 2]; 100]))));
        assert_eq!(part.active().buffer.frames()[0], [2, 2]);
        assert!(!part.overdub_opens_layer());

        let mut part = recorded_part(100, 1);
        assert!(part.begin_overdub_with(Some(Loop::from_frames(vec![[2, 2]; 50]))));
        assert_eq!(part.active().length(), 100);
        assert_eq!(part.active().buffer.frames()[0], SILENT_FRAME);
    }

    #[test]
    fn overdub_on_upper_layer_snapshots_it() {
        let mut part = recorded_part(100, 1);
        part.begin_overdub();
        assert!(part.begin_overdub());
        assert_eq!(part.layer_count(), 2);
        assert_eq!(part.active().buffer.undo_len(), 1);
    }

    #[test]
    fn overdub_on_empty_part_is_refused() {
        let mut part = SongPart::new(1000);
        assert!(!part.begin_overdub());
        assert_eq!(part.layer_count(), 1);
    }

    #[test]
    fn undo_and_redo_move_whole_layers() {
        let mut part = recorded_part(100, 1);
        assert!(!part.undo());
        part.begin_overdub();
        part.begin_overdub();
        part.change_loop(LoopAction::Prev);
        part.begin_overdub();
        assert_eq!(part.layer_count(), 3);

        assert!(part.undo());
        assert_eq!(part.layer_count(), 2);
        assert_eq!(part.now, 0);
        assert_eq!(part.redo_len(), 1);
        assert!(part.redo());
        assert_eq!(part.layer_count(), 3);
        assert!(!part.redo());
    }

    #[test]
    fn playback_mixes_audible_layers() {
        let mut part = recorded_part(4, 1);
        part.begin_overdub();
        part.record(&[[2, 2]; 4], 0);
        let drum_free = silent_drum();

        let mut out = vec![SILENT_FRAME; 4];
        part.play(&mut out, 0, &drum_free);
        assert_eq!(out, vec![[3, 3]; 4]);

        part.change_loop(LoopAction::Silent);
        let mut out = vec![SILENT_FRAME; 4];
        part.play(&mut out, 0, &drum_free);
        assert_eq!(out, vec![[1, 1]; 4]);
    }

    #[test]
    fn reverse_unsilences_and_move_sends_layer_to_top() {
        let mut part = recorded_part(4, 1);
        part.begin_overdub();
        part.change_loop(LoopAction::Prev);
        part.begin_overdub();
        part.change_loop(LoopAction::Prev);
        assert_eq!(part.now, 1);
        part.change_loop(LoopAction::Silent);
        part.change_loop(LoopAction::Reverse);
        assert!(part.active().buffer.is_reverse);
        assert!(!part.active().is_silent);

        part.change_loop(LoopAction::Move);
        assert_eq!(part.now, 2);
        assert!(part.active().buffer.is_reverse);
    }

    #[test]
    fn delete_keeps_at_least_one_layer() {
        let mut part = recorded_part(4, 1);
        part.change_loop(LoopAction::Delete);
        assert_eq!(part.layer_count(), 1);
        part.begin_overdub();
        part.change_loop(LoopAction::Delete);
        assert_eq!(part.layer_count(), 1);
        assert_eq!(part.now, 0);
        assert!(part.redo());
        assert_eq!(part.layer_count(), 2);
    }

    #[test]
    fn loop_actions_parse_from_text() {
        assert_eq!("reverse".parse::<LoopAction>(), Ok(LoopAction::Reverse));
        assert!("sideways".parse::<LoopAction>().is_err());
    }
}
