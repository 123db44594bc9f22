// FILE: src\audio_engine\song.rs
// ===============================

use super::helpers::{read_wav_frames, write_wav_file};
use super::looper_track::Loop;
use super::song_part::SongPart;
use crate::error::{LooperError, LooperResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SONG_FILE: &str = "song.json";
pub const SONG_SUFFIX: &str = ".sng";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LayerFile {
    file: String,
    length: usize,
    is_silent: bool,
    is_reverse: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct SongFile {
    drum_length: usize,
    sample_rate: u32,
    parts: Vec<Option<Vec<LayerFile>>>,
}

/// The song parts of one performance. `now` is playing, `next` is armed.
#[derive(Clone, Debug)]
pub struct Song {
    parts: Vec<SongPart>,
    pub now: usize,
    pub next: usize,
    capacity: usize,
}

impl Song {
    pub fn new(parts_per_song: usize, capacity: usize) -> Self {
        Self {
            parts: (0..parts_per_song.max(1))
                .map(|_| SongPart::new(capacity))
                .collect(),
            now: 0,
            next: 0,
            capacity,
        }
    }

    /// A song from already built parts; at least one part is kept.
    pub fn from_parts(mut parts: Vec<SongPart>, capacity: usize) -> Self {
        if parts.is_empty() {
            parts.push(SongPart::new(capacity));
        }
        Self {
            parts,
            now: 0,
            next: 0,
            capacity,
        }
    }

    pub fn parts(&self) -> &[SongPart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, id: usize) -> LooperResult<&SongPart> {
        self.parts.get(id).ok_or(LooperError::NoSuchPart(id))
    }

    pub fn part_now(&self) -> &SongPart {
        &self.parts[self.now]
    }

    pub fn part_now_mut(&mut self) -> &mut SongPart {
        &mut self.parts[self.now]
    }

    /// Replaces every part with an empty one.
    pub fn reset(&mut self) {
        let count = self.parts.len();
        *self = Self::new(count, self.capacity);
    }

    /// Empties part `id`.
    pub fn clear_part(&mut self, id: usize) -> LooperResult<()> {
        let capacity = self.capacity;
        let part = self.parts.get_mut(id).ok_or(LooperError::NoSuchPart(id))?;
        *part = SongPart::new(capacity);
        Ok(())
    }

    /// Copies the current part into the first empty part and returns its id.
    pub fn duplicate_now(&mut self) -> Option<usize> {
        if self.part_now().is_empty() {
            return None;
        }
        let target = self.parts.iter().position(SongPart::is_empty)?;
        let copy = SongPart::from_layers(self.part_now().layers().to_vec(), self.capacity);
        self.parts[target] = copy;
        Some(target)
    }

    /// Writes the song into directory `dir`: `song.json` plus one WAV per
    /// layer. Undo histories are not saved.
    pub fn save(&self, dir: &Path, drum_length: usize, sample_rate: u32) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "wav") {
                fs::remove_file(&path)
                    .with_context(|| format!("removing stale {}", path.display()))?;
            }
        }

        let mut parts = Vec::with_capacity(self.parts.len());
        for (p, part) in self.parts.iter().enumerate() {
            if part.is_empty() {
                parts.push(None);
                continue;
            }
            let mut layers = Vec::with_capacity(part.layer_count());
            for (l, layer) in part.layers().iter().enumerate() {
                let file = format!("part{}_layer{}.wav", p, l);
                write_wav_file(&dir.join(&file), layer.buffer.frames(), sample_rate)?;
                layers.push(LayerFile {
                    file,
                    length: layer.length(),
                    is_silent: layer.is_silent,
                    is_reverse: layer.buffer.is_reverse,
                });
            }
            parts.push(Some(layers));
        }

        let song = SongFile {
            drum_length,
            sample_rate,
            parts,
        };
        let json = serde_json::to_string_pretty(&song)?;
        fs::write(dir.join(SONG_FILE), json)
            .with_context(|| format!("writing song file in {}", dir.display()))?;
        log::info!("Saved song {}", dir.display());
        Ok(())
    }

    /// Reads a song saved by [`Song::save`]. Returns the song and the drum
    /// bar length it was recorded with.
    pub fn load(dir: &Path, parts_per_song: usize, capacity: usize) -> Result<(Self, usize)> {
        let path = dir.join(SONG_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading song file {}", path.display()))?;
        let song_file: SongFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing song file {}", path.display()))?;

        let count = parts_per_song.max(song_file.parts.len()).max(1);
        let mut parts: Vec<SongPart> = (0..count).map(|_| SongPart::new(capacity)).collect();
        for (p, stored) in song_file.parts.into_iter().enumerate() {
            let Some(stored) = stored else {
                continue;
            };
            let mut layers = Vec::with_capacity(stored.len());
            for layer_file in stored {
                let (frames, file_sr) = read_wav_frames(&dir.join(&layer_file.file))?;
                if file_sr != song_file.sample_rate {
                    log::warn!(
                        "{} was written at {} Hz, song says {} Hz",
                        layer_file.file,
                        file_sr,
                        song_file.sample_rate
                    );
                }
                if frames.len() != layer_file.length {
                    log::warn!(
                        "{} holds {} frames, expected {}",
                        layer_file.file,
                        frames.len(),
                        layer_file.length
                    );
                }
                let mut layer = Loop::from_frames(frames);
                layer.is_silent = layer_file.is_silent;
                layer.buffer.is_reverse = layer_file.is_reverse;
                layers.push(layer);
            }
            parts[p] = SongPart::from_layers(layers, capacity);
        }
        log::info!("Loaded song {}", dir.display());
        Ok((Self::from_parts(parts, capacity), song_file.drum_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::song_part::LoopAction;

    fn song_with_part0() -> Song {
        let mut song = Song::new(4, 1000);
        song.parts[0] = SongPart::from_layers(vec![Loop::from_frames(vec![[7, -7]; 300])], 1000);
        song
    }

    #[test]
    fn new_song_has_empty_parts() {
        let song = Song::new(4, 1000);
        assert_eq!(song.part_count(), 4);
        assert!(song.parts().iter().all(SongPart::is_empty));
        assert_eq!(song.part(4).err(), Some(LooperError::NoSuchPart(4)));
    }

    #[test]
    fn duplicate_copies_into_first_empty_part() {
        let mut song = song_with_part0();
        assert_eq!(song.duplicate_now(), Some(1));
        assert_eq!(song.part(1).unwrap().length(), 300);

        song.now = 2;
        assert_eq!(song.duplicate_now(), None);
    }

    #[test]
    fn clear_part_resets_it() {
        let mut song = song_with_part0();
        song.clear_part(0).unwrap();
        assert!(song.part(0).unwrap().is_empty());
        assert!(song.clear_part(9).is_err());
    }

    #[test]
    fn saved_song_loads_back_with_flags() {
        let dir = tempfile::tempdir().unwrap();
        let song_dir = dir.path().join(format!("01-01-00-00-00{}", SONG_SUFFIX));

        let mut song = song_with_part0();
        let part = song.part_now_mut();
        part.begin_overdub();
        part.record(&[[100, 100]; 300], 0);
        part.change_loop(LoopAction::Reverse);
        part.change_loop(LoopAction::Prev);
        part.change_loop(LoopAction::Silent);
        song.save(&song_dir, 300, 44100).unwrap();

        let (loaded, drum_length) = Song::load(&song_dir, 4, 1000).unwrap();
        assert_eq!(drum_length, 300);
        assert_eq!(loaded.part_count(), 4);
        let part = loaded.part(0).unwrap();
        assert_eq!(part.layer_count(), 2);
        assert!(part.layers()[0].is_silent);
        assert!(part.layers()[1].buffer.is_reverse);
        assert_eq!(part.layers()[1].buffer.frames(), &[[100, 100]; 300][..]);
        assert!(loaded.part(1).unwrap().is_empty());
    }

    #[test]
    fn saving_again_drops_removed_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut song = song_with_part0();
        song.part_now_mut().begin_overdub();
        song.save(dir.path(), 300, 44100).unwrap();
        song.part_now_mut().undo();
        song.save(dir.path(), 300, 44100).unwrap();

        assert!(!dir.path().join("part0_layer1.wav").exists());
        let (loaded, _) = Song::load(dir.path(), 4, 1000).unwrap();
        assert_eq!(loaded.part(0).unwrap().layer_count(), 1);
    }
}
