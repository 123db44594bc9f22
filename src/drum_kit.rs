// src/drum_kit.rs

//! Drum kit definitions on disk.
//!
//! A drums directory holds `drum_sounds.json` next to one sub-directory per
//! kit. Each kit directory has `drum_patterns.json`, `drum_fills.json` and
//! `drum_ends.json`.

use crate::audio_engine::helpers::{peak_of, read_wav_frames, resample_frames, Frame};
use crate::error::LooperError;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SOUNDS_FILE: &str = "drum_sounds.json";
pub const PATTERNS_FILE: &str = "drum_patterns.json";
pub const FILLS_FILE: &str = "drum_fills.json";
pub const ENDINGS_FILE: &str = "drum_ends.json";

const DEFAULT_PATTERN_KEY: &str = "default_pattern";
const COMMENT_KEY: &str = "comment";

#[derive(Deserialize)]
struct SoundEntry {
    file_name: PathBuf,
    #[serde(default = "unit_volume")]
    volume: f32,
}

fn unit_volume() -> f32 {
    1.0
}

#[derive(Clone, Debug)]
pub struct DrumSound {
    pub frames: Vec<Frame>,
    pub volume: f32,
}

/// One step sequence. `notes` holds a hit flag per step for every sound the
/// pattern uses.
#[derive(Clone, Debug, PartialEq)]
pub struct DrumPattern {
    pub name: String,
    pub steps: usize,
    pub accents: Vec<u8>,
    pub notes: BTreeMap<String, Vec<bool>>,
}

#[derive(Clone, Debug, Default)]
pub struct DrumPatternLibrary {
    pub kit_name: String,
    pub sounds: BTreeMap<String, DrumSound>,
    pub patterns: Vec<DrumPattern>,
    pub fills: Vec<DrumPattern>,
    pub endings: Vec<DrumPattern>,
    /// Loudest sample of any sound after its volume factor.
    pub max_peak: f32,
}

impl DrumPatternLibrary {
    /// Loads the kit in `kit_dir` and the sounds shared by all kits in its
    /// parent directory.
    pub fn load(kit_dir: &Path, sample_rate: u32) -> Result<Self> {
        let drums_dir = kit_dir
            .parent()
            .with_context(|| format!("{} has no parent directory", kit_dir.display()))?;
        let sounds = load_sounds(&drums_dir.join(SOUNDS_FILE), sample_rate)?;
        let mut library = Self::from_sounds(sounds);
        library.kit_name = kit_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        library.patterns = load_patterns(&kit_dir.join(PATTERNS_FILE), &library.sounds)?;
        library.fills = load_patterns(&kit_dir.join(FILLS_FILE), &library.sounds)?;
        library.endings = load_patterns(&kit_dir.join(ENDINGS_FILE), &library.sounds)?;
        log::info!(
            "Loaded drum kit '{}': {} sounds, {} patterns, {} fills, {} endings",
            library.kit_name,
            library.sounds.len(),
            library.patterns.len(),
            library.fills.len(),
            library.endings.len()
        );
        Ok(library)
    }

    pub fn from_sounds(sounds: BTreeMap<String, DrumSound>) -> Self {
        let max_peak = sounds
            .values()
            .map(|s| peak_of(&s.frames) as f32 * s.volume)
            .fold(0.0, f32::max);
        Self {
            sounds,
            max_peak,
            ..Default::default()
        }
    }

    /// True when every category has at least one pattern to play.
    pub fn is_playable(&self) -> bool {
        !self.patterns.is_empty() && !self.fills.is_empty() && !self.endings.is_empty()
    }
}

pub fn load_sounds(path: &Path, sample_rate: u32) -> Result<BTreeMap<String, DrumSound>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading drum sounds {}", path.display()))?;
    let entries: BTreeMap<String, SoundEntry> = serde_json::from_str(&text)
        .with_context(|| format!("parsing drum sounds {}", path.display()))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));

    let mut sounds = BTreeMap::new();
    for (name, entry) in entries {
        let file = base_dir.join(&entry.file_name);
        let (frames, file_sr) = read_wav_frames(&file)
            .with_context(|| format!("loading drum sound '{}'", name))?;
        if frames.is_empty() {
            return Err(LooperError::InvalidSound {
                name,
                reason: format!("{} holds no audio", file.display()),
            }
            .into());
        }
        let frames = resample_frames(&frames, file_sr, sample_rate)?;
        let loudest = peak_of(&frames) as f32 * entry.volume;
        if loudest >= i16::MAX as f32 {
            log::warn!(
                "Drum sound '{}' peaks at {:.0} with volume {}, it will clip",
                name,
                loudest,
                entry.volume
            );
        }
        sounds.insert(
            name,
            DrumSound {
                frames,
                volume: entry.volume,
            },
        );
    }
    Ok(sounds)
}

pub fn load_patterns(path: &Path, sounds: &BTreeMap<String, DrumSound>) -> Result<Vec<DrumPattern>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading drum patterns {}", path.display()))?;
    Ok(parse_patterns(&text, path, sounds)?)
}

/// Parses one pattern file. `default_pattern` is merged into every entry
/// before use and the `comment` entry is ignored.
pub fn parse_patterns(
    text: &str,
    path: &Path,
    sounds: &BTreeMap<String, DrumSound>,
) -> Result<Vec<DrumPattern>, LooperError> {
    let invalid = |reason: String| LooperError::InvalidPattern {
        path: path.to_path_buf(),
        reason,
    };

    let root: Value = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
    let Value::Object(entries) = root else {
        return Err(invalid("top level must be an object".into()));
    };
    let default = entries
        .get(DEFAULT_PATTERN_KEY)
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    let mut patterns = Vec::new();
    for (name, entry) in &entries {
        if name == DEFAULT_PATTERN_KEY || name == COMMENT_KEY {
            continue;
        }
        let mut merged = default.clone();
        merge_json(&mut merged, entry);
        let pattern = build_pattern(name, &merged, sounds).map_err(invalid)?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

fn build_pattern(
    name: &str,
    value: &Value,
    sounds: &BTreeMap<String, DrumSound>,
) -> Result<DrumPattern, String> {
    let steps = value
        .get("steps")
        .and_then(Value::as_u64)
        .filter(|s| *s > 0)
        .ok_or_else(|| format!("pattern '{}' needs a positive 'steps'", name))? as usize;
    let accents = value
        .get("accents")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| format!("pattern '{}' needs an 'accents' string", name))?;

    let accents = extend_to(accents, steps)
        .chars()
        .map(|c| match c.to_digit(10) {
            Some(d) => d as u8,
            None => {
                log::error!("pattern '{}' accent '{}' must be a digit 0-9", name, c);
                0
            }
        })
        .collect();

    let mut notes = BTreeMap::new();
    for sound_name in sounds.keys() {
        let Some(field) = value.get(sound_name) else {
            continue;
        };
        let text = field
            .as_str()
            .ok_or_else(|| format!("pattern '{}' sound '{}' must be a string", name, sound_name))?;
        if text.is_empty() {
            continue;
        }
        if text.chars().any(|c| c != '!' && c != '.') {
            log::error!(
                "pattern '{}' sound '{}' notes '{}' must contain only '.' and '!'",
                name,
                sound_name,
                text
            );
        }
        let hits = extend_to(text, steps).chars().map(|c| c == '!').collect();
        notes.insert(sound_name.clone(), hits);
    }

    Ok(DrumPattern {
        name: name.to_string(),
        steps,
        accents,
        notes,
    })
}

/// Repeats or truncates `text` to exactly `len` characters.
pub fn extend_to(text: &str, len: usize) -> String {
    text.chars().cycle().take(len).collect()
}

/// Deep-merges `overlay` into `base`; objects merge key by key, anything
/// else is replaced.
fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
