// src/settings.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LooperSettings {
    pub host_name: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: Option<u32>,
    pub midi_port_name: Option<String>,
    /// MIDI note number to command line, e.g. `60 -> "play_part 0"`.
    pub note_map: BTreeMap<u8, String>,
    /// Longest first recording of a part, in seconds.
    pub max_len_seconds: f32,
    /// How late a quantized stop may still happen right away, in seconds.
    pub max_late_seconds: f32,
    pub drum_kit: String,
    pub drum_volume: f32,
    pub drum_swing: f64,
    pub change_after_bars: usize,
    pub parts_per_song: usize,
    pub drums_dir: Option<PathBuf>,
    pub songs_dir: Option<PathBuf>,
}

impl Default for LooperSettings {
    fn default() -> Self {
        Self {
            host_name: None,
            input_device: None,
            output_device: None,
            sample_rate: 44100,
            buffer_size: None,
            midi_port_name: None,
            note_map: BTreeMap::new(),
            max_len_seconds: 60.0,
            max_late_seconds: 0.1,
            drum_kit: "pop".to_string(),
            drum_volume: 1.0,
            drum_swing: 0.625,
            change_after_bars: 3,
            parts_per_song: 4,
            drums_dir: None,
            songs_dir: None,
        }
    }
}

impl LooperSettings {
    /// Capacity of a fresh recording buffer in frames.
    pub fn max_len_samples(&self) -> usize {
        (self.max_len_seconds.max(1.0) * self.sample_rate as f32).round() as usize
    }

    pub fn max_late_samples(&self) -> usize {
        (self.max_late_seconds.max(0.0) * self.sample_rate as f32).round() as usize
    }

    /// `drums_dir`, or `Drums` inside `config_dir`.
    pub fn drums_dir(&self, config_dir: &Path) -> PathBuf {
        self.drums_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("Drums"))
    }

    pub fn songs_dir(&self, config_dir: &Path) -> PathBuf {
        self.songs_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("Songs"))
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let app_settings_dir = exe_dir.join("AppSettings");
            return ensure_config_dir(&app_settings_dir).then_some(app_settings_dir);
        }
    }
    log::error!("Could not determine application directory.");
    None
}

/// Creates `dir` together with its `Drums` and `Songs` sub-directories.
pub fn ensure_config_dir(dir: &Path) -> bool {
    for dir in [dir.to_path_buf(), dir.join("Drums"), dir.join("Songs")] {
        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(&dir) {
                log::error!("Failed to create directory at {}: {}", dir.display(), e);
                return false;
            }
        }
    }
    true
}

pub fn save_settings(settings: &LooperSettings, path: &Path) {
    match serde_json::to_string_pretty(settings) {
        Ok(json_string) => {
            if let Err(e) = fs::write(path, json_string) {
                log::error!("Failed to write settings to {}: {}", path.display(), e);
            }
        }
        Err(e) => {
            log::error!("Failed to serialize settings: {}", e);
        }
    }
}

pub fn load_settings(path: &Path) -> LooperSettings {
    if path.exists() {
        return match fs::read_to_string(path) {
            Ok(json_string) => match serde_json::from_str(&json_string) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Failed to parse settings file, using defaults. Error: {}", e);
                    LooperSettings::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read settings file, using defaults. Error: {}", e);
                LooperSettings::default()
            }
        };
    }
    LooperSettings::default()
}
