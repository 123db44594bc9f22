// src/audio_engine.rs

pub mod circular_buffer;
pub mod command;
pub mod helpers;
pub mod looper_track;
pub mod processor;
pub mod song;
pub mod song_part;
pub mod transport;

use crate::asset::AssetFinder;
use crate::audio_io::AudioBackend;
use crate::drum_engine::DrumSequencer;
use crate::drum_kit::DrumPatternLibrary;
use crate::error::{LooperError, LooperResult};
use crate::looper::{LooperState, LooperStatus, SharedLooperState};
use crate::settings::{self, LooperSettings};
use anyhow::{Context, Result};
use command::LooperCommand;
use helpers::SILENT_FRAME;
use looper_track::Loop;
use processor::BlockProcessor;
use song::{Song, SONG_SUFFIX};
use song_part::LoopAction;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use transport::{LoopTransport, Signal};

/// How long song commands wait for a running session to wind down.
const IDLE_WAIT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Where the engine keeps its files.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// Written when drum settings change; `None` keeps them in memory.
    pub settings_file: Option<PathBuf>,
    pub drums_dir: PathBuf,
    pub songs_dir: PathBuf,
}

/// State shared with the playback thread.
struct EngineShared {
    song: Arc<Mutex<Song>>,
    transport: Arc<LoopTransport>,
    go_play: Signal,
    idle: Signal,
    exit: AtomicBool,
    status: SharedLooperState,
    missed_blocks: Arc<AtomicUsize>,
    backend: Arc<dyn AudioBackend>,
}

impl EngineShared {
    fn drum(&self) -> &Arc<DrumSequencer> {
        self.transport.drum()
    }

    fn publish(&self, song: &Song) {
        let state = if self.idle.is_set() {
            LooperState::Stopped
        } else if self.transport.is_recording() {
            LooperState::Recording
        } else {
            LooperState::Playing
        };
        self.status.set(state);
        self.status.set_parts(song.now, song.next);
        let part = song.part_now();
        let length = if part.is_empty() { 0 } else { part.length() };
        self.status.set_part_shape(part.layer_count(), length);
    }

    /// Waits for "go", plays the current part until its stop event and
    /// starts over.
    fn playback_loop(&self) {
        loop {
            self.go_play.wait();

            let processor = {
                let mut song = lock(&self.song);
                if self.exit.load(Ordering::Acquire) {
                    break;
                }
                if song.next != song.now {
                    song.now = song.next;
                }
                self.transport.stop_signal.clear();
                self.transport.stop_never();
                self.transport.set_idx(0);
                self.transport.set_recording(song.part_now().is_empty());
                self.idle.clear();
                self.publish(&song);
                log::debug!("Playing part {}", song.now);
                BlockProcessor::new(
                    self.song.clone(),
                    self.transport.clone(),
                    self.status.clone(),
                    self.missed_blocks.clone(),
                )
            };

            if let Err(e) = self.backend.run_session(processor) {
                log::error!("Playback session failed: {:#}", e);
                self.go_play.clear();
                self.transport.set_recording(false);
            }
            self.finish_session();
        }
        log::debug!("Playback thread exited");
    }

    /// Trims the first recording of a part once its session is over.
    fn finish_session(&self) {
        let mut song = lock(&self.song);
        if song.part_now().is_empty() {
            let idx = self.transport.idx();
            let now = song.now;
            if let Err(e) = song.part_now_mut().trim(idx, &self.transport) {
                log::warn!("Discarding the recording of part {}: {}", now, e);
                let _ = song.clear_part(now);
            }
        }
        self.idle.set();
        self.publish(&song);
    }

    fn stop_song(&self) {
        self.transport.set_recording(false);
        self.go_play.clear();
        self.transport.stop_now();
    }

    /// Decides when the running part stops after a part command.
    fn stop_quantized(&self, song: &Song) {
        let drum = self.drum();
        let part = song.part_now();
        if part.is_empty() {
            if drum.is_empty() {
                self.transport.stop_now();
            } else {
                self.transport.stop_at_bound(drum.length());
            }
        } else if song.next != song.now {
            if self.transport.is_stop_len_set() && !drum.is_empty() {
                // second press: leave at the next drum bar instead
                self.transport.stop_at_bound(drum.length());
            } else if !self.transport.stop_at_bound(part.length()) {
                drum.schedule_ending_before_boundary(part.length(), self.transport.idx());
            }
        } else {
            self.transport.stop_never();
        }
    }
}

/// The looper: a playback thread playing and recording song parts, and the
/// commands that steer it.
pub struct LooperEngine {
    shared: Arc<EngineShared>,
    settings: Mutex<LooperSettings>,
    paths: EnginePaths,
    songs: Mutex<AssetFinder>,
    kits: Mutex<AssetFinder>,
    playback: Option<JoinHandle<()>>,
}

impl LooperEngine {
    /// Starts the playback thread and opens the newest saved song, or a new
    /// one when there is none.
    pub fn new(
        settings: LooperSettings,
        paths: EnginePaths,
        drum: Arc<DrumSequencer>,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<Self> {
        fs::create_dir_all(&paths.songs_dir)
            .with_context(|| format!("creating {}", paths.songs_dir.display()))?;
        let songs = AssetFinder::scan(&paths.songs_dir, true, SONG_SUFFIX)?;
        let mut kits = AssetFinder::scan(&paths.drums_dir, true, "")?;
        if !kits.select(&drum.kit_name()) {
            kits.select(&settings.drum_kit);
        }

        let transport = Arc::new(LoopTransport::new(drum, settings.max_late_samples()));
        let shared = Arc::new(EngineShared {
            song: Arc::new(Mutex::new(Song::new(
                settings.parts_per_song,
                settings.max_len_samples(),
            ))),
            transport,
            go_play: Signal::new(),
            idle: Signal::new(),
            exit: AtomicBool::new(false),
            status: SharedLooperState::new(),
            missed_blocks: Arc::new(AtomicUsize::new(0)),
            backend,
        });
        shared.idle.set();

        let playback = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("playback".into())
                .spawn(move || shared.playback_loop())
                .context("starting the playback thread")?
        };

        let engine = Self {
            shared,
            settings: Mutex::new(settings),
            paths,
            songs: Mutex::new(songs),
            kits: Mutex::new(kits),
            playback: Some(playback),
        };
        if let Err(e) = engine.open_latest_song() {
            log::error!("Could not open a song: {:#}", e);
        }
        Ok(engine)
    }

    // --- Accessors ---

    pub fn status(&self) -> LooperStatus {
        self.shared.status.status()
    }

    pub fn shared_state(&self) -> SharedLooperState {
        self.shared.status.clone()
    }

    pub fn transport(&self) -> &Arc<LoopTransport> {
        &self.shared.transport
    }

    pub fn drum(&self) -> &Arc<DrumSequencer> {
        self.shared.drum()
    }

    /// Audio blocks played without the song because a command held it.
    pub fn missed_blocks(&self) -> usize {
        self.shared.missed_blocks.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.go_play.is_set()
    }

    /// Returns whether no session is running, waiting up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.idle.wait_timeout(timeout)
    }

    pub fn with_song<R>(&self, f: impl FnOnce(&Song) -> R) -> R {
        f(&lock(&self.shared.song))
    }

    pub fn song_name(&self) -> Option<String> {
        lock(&self.songs).item_now().map(str::to_string)
    }

    pub fn settings(&self) -> LooperSettings {
        lock(&self.settings).clone()
    }

    // --- Command surface ---

    /// Parses and runs one command line. Failures are logged.
    pub fn process_message(&self, line: &str) {
        let result = line
            .parse::<LooperCommand>()
            .map_err(anyhow::Error::from)
            .and_then(|command| self.execute(command));
        if let Err(e) = result {
            log::error!("Command '{}' failed: {:#}", line.trim(), e);
        }
    }

    pub fn execute(&self, command: LooperCommand) -> Result<()> {
        log::debug!("Executing {:?}", command);
        match command {
            LooperCommand::PlayPart(id) => self.play_or_switch_part(id)?,
            LooperCommand::RecordNewLayer => self.record_new_layer(),
            LooperCommand::UndoLayer => self.undo_layer(),
            LooperCommand::RedoLayer => self.redo_layer(),
            LooperCommand::UndoLoop => self.undo_loop(),
            LooperCommand::RedoLoop => self.redo_loop(),
            LooperCommand::ChangeLoop(action) => self.change_loop(action),
            LooperCommand::PauseAndClear => self.pause_and_clear(),
            LooperCommand::StopSong => self.stop_song(),
            LooperCommand::ClearPart => self.clear_part(),
            LooperCommand::DuplicatePart => self.duplicate_part(),
            LooperCommand::CycleDrumLevel => self.drum().cycle_level(),
            LooperCommand::DrumEnding(bars) => self.drum().trigger_ending_now(bars),
            LooperCommand::SilenceDrum => self.drum().silence(),
            LooperCommand::DrumVolume(step) => self.change_drum_volume(step),
            LooperCommand::DrumSwing(step) => self.change_drum_swing(step),
            LooperCommand::DrumKit(step) => self.change_drum_kit(step),
            LooperCommand::LoadDrumKit => self.load_drum_kit()?,
            LooperCommand::SetDrumLength(length) => self.set_drum_length(length)?,
            LooperCommand::SaveSong => self.save_song()?,
            LooperCommand::SaveNewSong => self.save_new_song()?,
            LooperCommand::LoadSong => self.load_song()?,
            LooperCommand::ChangeSong(step) => self.change_song(step),
            LooperCommand::DeleteSong => self.delete_song()?,
        }
        Ok(())
    }

    // --- Parts and layers ---

    /// Starts playback with part `id` armed, toggles recording when `id` is
    /// already playing, or switches to `id` at the next boundary.
    pub fn play_or_switch_part(&self, id: usize) -> LooperResult<()> {
        let s = &self.shared;
        let mut song = lock(&s.song);
        if id >= song.part_count() {
            return Err(LooperError::NoSuchPart(id));
        }
        song.next = id;
        if !s.go_play.is_set() {
            s.go_play.set();
            s.publish(&song);
            return Ok(());
        }

        if song.next == song.now {
            let recording = s.transport.is_recording();
            if !recording {
                song.part_now_mut().save_undo();
            }
            s.transport.set_recording(!recording);
        }
        s.stop_quantized(&song);
        s.publish(&song);
        Ok(())
    }

    /// Overdub toggle. Starting opens a new layer above the base loop;
    /// stopping while the base loop is still being recorded trims it at once.
    pub fn record_new_layer(&self) {
        let s = &self.shared;
        // the new layer is allocated before the audio callback is locked out
        let spare = {
            let song = lock(&s.song);
            let part = song.part_now();
            (s.go_play.is_set() && !s.transport.is_recording() && part.overdub_opens_layer())
                .then(|| part.length())
        }
        .map(|length| Loop::from_frames(vec![SILENT_FRAME; length]));

        let mut song = lock(&s.song);
        if !s.go_play.is_set() {
            s.go_play.set();
            s.publish(&song);
            return;
        }

        if !s.transport.is_recording() {
            if !song.part_now_mut().begin_overdub_with(spare) {
                log::debug!("Part {} is empty, recording its base loop", song.now);
            }
            s.transport.set_recording(true);
        } else {
            if song.part_now().is_empty() {
                let idx = s.transport.idx();
                if let Err(e) = song.part_now_mut().trim(idx, &s.transport) {
                    log::warn!("Could not close the base loop: {}", e);
                }
            }
            s.transport.set_recording(false);
        }
        s.publish(&song);
    }

    /// Drops the newest layer; it can be brought back with `redo_layer`.
    pub fn undo_layer(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        s.transport.set_recording(false);
        if !song.part_now_mut().undo() {
            log::debug!("Nothing to undo in part {}", song.now);
        }
        s.publish(&song);
    }

    pub fn redo_layer(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        s.transport.set_recording(false);
        if !song.part_now_mut().redo() {
            log::debug!("Nothing to redo in part {}", song.now);
        }
        s.publish(&song);
    }

    pub fn undo_loop(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        s.transport.set_recording(false);
        song.part_now_mut().undo_loop();
        s.publish(&song);
    }

    pub fn redo_loop(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        s.transport.set_recording(false);
        song.part_now_mut().redo_loop();
        s.publish(&song);
    }

    /// Layer selection and flags. Ignored while recording.
    pub fn change_loop(&self, action: LoopAction) {
        let s = &self.shared;
        if s.transport.is_recording() {
            log::debug!("Ignoring loop {:?} while recording", action);
            return;
        }
        let mut song = lock(&s.song);
        song.part_now_mut().change_loop(action);
        s.publish(&song);
    }

    /// While playing: stop at the end of the part. While stopped: start a
    /// fresh song and forget the drum bar.
    pub fn pause_and_clear(&self) {
        let s = &self.shared;
        if s.go_play.is_set() {
            let song = lock(&s.song);
            s.go_play.clear();
            let part = song.part_now();
            if !part.is_empty() {
                s.transport.stop_at_bound(part.length());
            } else if s.drum().is_empty() {
                s.transport.stop_now();
            } else {
                s.transport.stop_at_bound(s.drum().length());
            }
            s.publish(&song);
        } else {
            self.prepare_song();
        }
    }

    /// Stops right away. A base loop being recorded is kept.
    pub fn stop_song(&self) {
        self.shared.stop_song();
    }

    /// Cancels a pending part switch and empties the part that was pending.
    /// The part being played is never cleared.
    pub fn clear_part(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        let pending = song.next;
        song.next = song.now;
        s.transport.stop_never();
        let playing = !s.idle.is_set();
        if pending != song.now || !playing {
            if let Err(e) = song.clear_part(pending) {
                log::warn!("{}", e);
            } else {
                log::info!("Cleared part {}", pending);
            }
        }
        s.publish(&song);
    }

    pub fn duplicate_part(&self) {
        let s = &self.shared;
        let mut song = lock(&s.song);
        match song.duplicate_now() {
            Some(target) => log::info!("Part {} copied to part {}", song.now, target),
            None => log::info!("Nothing to copy or no empty part left"),
        }
        s.publish(&song);
    }

    // --- Drums ---

    fn update_settings(&self, change: impl FnOnce(&mut LooperSettings)) {
        let mut settings = lock(&self.settings);
        change(&mut settings);
        if let Some(path) = &self.paths.settings_file {
            settings::save_settings(&settings, path);
        }
    }

    pub fn change_drum_volume(&self, step: i32) {
        if self.drum().change_volume(step) {
            let volume = self.drum().volume();
            self.update_settings(|s| s.drum_volume = volume);
        }
    }

    pub fn change_drum_swing(&self, step: i32) {
        if self.drum().change_swing(step) {
            let swing = self.drum().swing();
            self.update_settings(|s| s.drum_swing = swing);
        }
    }

    /// Browses the kit list; `load_drum_kit` switches to the browsed kit.
    pub fn change_drum_kit(&self, step: i32) {
        let mut kits = lock(&self.kits);
        kits.iterate(step > 0);
        match kits.item_next() {
            Some(name) => log::info!("Next drum kit: {}", name),
            None => log::info!("No drum kits in {}", kits.dir().display()),
        }
    }

    pub fn load_drum_kit(&self) -> Result<()> {
        let (path, name) = {
            let mut kits = lock(&self.kits);
            kits.now = kits.next;
            let path = kits.path_now().ok_or(LooperError::NoDrumKit)?;
            let name = kits.item_now().unwrap_or_default().to_string();
            (path, name)
        };
        let sample_rate = lock(&self.settings).sample_rate;
        let library = DrumPatternLibrary::load(&path, sample_rate)
            .with_context(|| format!("loading drum kit '{}'", name))?;
        self.drum().set_library(Arc::new(library));
        self.update_settings(|s| s.drum_kit = name);
        Ok(())
    }

    /// Sets the drum bar length by hand; zero is ignored. A bar longer than
    /// the loop capacity is refused.
    pub fn set_drum_length(&self, length: usize) -> LooperResult<()> {
        let capacity = lock(&self.settings).max_len_samples();
        if length > capacity {
            return Err(LooperError::BadArgument {
                command: "drum_length".into(),
                reason: format!("{} exceeds the loop capacity of {} frames", length, capacity),
            });
        }
        if length > 0 {
            self.drum().start(length);
        } else {
            log::debug!("Ignoring zero drum length");
        }
        Ok(())
    }

    // --- Songs ---

    /// Stops playback, clears every part and forgets the drum bar.
    fn prepare_song(&self) {
        let s = &self.shared;
        s.stop_song();
        if !s.idle.wait_timeout(IDLE_WAIT) {
            log::warn!("Playback did not stop in time");
        }
        let mut song = lock(&s.song);
        song.reset();
        s.drum().clear();
        s.publish(&song);
    }

    fn stop_and_wait(&self) {
        self.shared.stop_song();
        if !self.shared.idle.wait_timeout(IDLE_WAIT) {
            log::warn!("Playback did not stop in time");
        }
    }

    pub fn save_song(&self) -> Result<()> {
        self.stop_and_wait();
        let path = lock(&self.songs)
            .path_now()
            .ok_or(LooperError::NoSongSelected)?;
        let sample_rate = lock(&self.settings).sample_rate;
        let song = lock(&self.shared.song);
        song.save(&path, self.drum().length(), sample_rate)
    }

    /// Saves the current song under a new time stamped name.
    pub fn save_new_song(&self) -> Result<()> {
        let name = {
            let mut songs = lock(&self.songs);
            let name = new_song_name(&songs);
            songs.push(name.clone());
            name
        };
        log::info!("New song {}", name);
        self.save_song()
    }

    /// Loads the song selected with `change_song`.
    pub fn load_song(&self) -> Result<()> {
        self.stop_and_wait();
        let path = {
            let mut songs = lock(&self.songs);
            songs.now = songs.next;
            songs.path_now().ok_or(LooperError::NoSongSelected)?
        };
        let (parts_per_song, capacity) = {
            let settings = lock(&self.settings);
            (settings.parts_per_song, settings.max_len_samples())
        };
        let (loaded, drum_length) = Song::load(&path, parts_per_song, capacity)?;

        let s = &self.shared;
        let mut song = lock(&s.song);
        *song = loaded;
        if drum_length > capacity {
            log::warn!("Song drum length {} exceeds capacity, drums cleared", drum_length);
            s.drum().clear();
        } else if drum_length > 0 {
            s.drum().start(drum_length);
        } else {
            s.drum().clear();
        }
        s.publish(&song);
        Ok(())
    }

    pub fn change_song(&self, step: i32) {
        let mut songs = lock(&self.songs);
        songs.iterate(step > 0);
        if let Some(name) = songs.item_next() {
            log::info!("Next song: {}", name);
        }
    }

    /// Deletes the song selected with `change_song` and opens the newest
    /// remaining one.
    pub fn delete_song(&self) -> Result<()> {
        self.stop_and_wait();
        {
            let mut songs = lock(&self.songs);
            songs.now = songs.next;
            if let Some(path) = songs.path_now() {
                if path.exists() {
                    fs::remove_dir_all(&path)
                        .with_context(|| format!("deleting {}", path.display()))?;
                }
                log::info!("Deleted song {}", path.display());
            }
            songs.remove_now();
        }
        self.open_latest_song()
    }

    fn open_latest_song(&self) -> Result<()> {
        let has_songs = {
            let mut songs = lock(&self.songs);
            if songs.is_empty() {
                false
            } else {
                let last = songs.len() - 1;
                songs.now = last;
                songs.next = last;
                true
            }
        };
        if has_songs {
            self.load_song()
        } else {
            self.prepare_song();
            self.save_new_song()
        }
    }

    /// Stops playback and joins the playback thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.playback.take() else {
            return;
        };
        {
            // checked by the playback thread under the same lock
            let _song = lock(&self.shared.song);
            self.shared.exit.store(true, Ordering::Release);
        }
        self.shared.stop_song();
        self.shared.go_play.set();
        if handle.join().is_err() {
            log::error!("Playback thread panicked");
        }
    }
}

impl Drop for LooperEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `%m-%d-%H-%M-%S.sng`, with a counter when that name is taken.
fn new_song_name(songs: &AssetFinder) -> String {
    let stamp = chrono::Local::now().format("%m-%d-%H-%M-%S").to_string();
    let taken = |name: &str| songs.items().iter().any(|i| i == name) || songs.dir().join(name).exists();
    let mut name = format!("{}{}", stamp, SONG_SUFFIX);
    let mut n = 1;
    while taken(&name) {
        name = format!("{}-{}{}", stamp, n, SONG_SUFFIX);
        n += 1;
    }
    name
}
