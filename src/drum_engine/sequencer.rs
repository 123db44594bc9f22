// FILE: src\drum_engine\sequencer.rs
// ===================================

use super::compiler::{CompiledDrum, DrumPatternCompiler};
use crate::audio_engine::helpers::{play_wrapped, Frame};
use crate::drum_kit::DrumPatternLibrary;
use crate::scheduler::Scheduler;
use crate::settings::LooperSettings;
use arc_swap::{ArcSwap, ArcSwapOption};
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const PARAM_SCALER: f32 = 1_000_000.0;
const VOLUME_FACTOR: f32 = 1.41;
const SWING_STEP: f64 = 0.25 / 4.0;
const MIN_SWING: f64 = 0.5;
const MAX_SWING: f64 = 0.75;

const LEVEL1_BIT: u8 = 1;
const LEVEL2_BIT: u8 = 2;
const LEVEL_MASK: u8 = LEVEL1_BIT | LEVEL2_BIT;
const ENDING_BIT: u8 = 4;

/// Drum density. The ending flourish is an overlay on top of it, see
/// [`DrumSequencer::ending_active`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intensity {
    Silent,
    /// Fill buffer only.
    Level1,
    /// Main pattern buffer.
    Level2,
}

impl From<u8> for Intensity {
    fn from(bits: u8) -> Self {
        match bits & LEVEL_MASK {
            LEVEL1_BIT => Intensity::Level1,
            LEVEL2_BIT => Intensity::Level2,
            _ => Intensity::Silent,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DrumConfig {
    pub sample_rate: u32,
    pub volume: f32,
    pub swing: f64,
    pub change_after_bars: usize,
    /// Render patterns on a worker thread after `start`.
    pub background_compile: bool,
}

impl DrumConfig {
    pub fn from_settings(settings: &LooperSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            volume: settings.drum_volume,
            swing: settings.drum_swing,
            change_after_bars: settings.change_after_bars,
            background_compile: true,
        }
    }
}

/// Plays the rendered drum bars and owns the intensity state machine.
///
/// Everything touched by [`DrumSequencer::play`] is atomic or swapped
/// wholesale through `arc_swap`, so the audio callback never waits on a
/// command or timer thread.
pub struct DrumSequencer {
    library: ArcSwap<DrumPatternLibrary>,
    compiled: ArcSwapOption<CompiledDrum>,
    install_lock: Mutex<()>,
    length: AtomicUsize,
    bits: AtomicU8,
    pattern_idx: AtomicUsize,
    fill_idx: AtomicUsize,
    ending_idx: AtomicUsize,
    sample_counter: AtomicUsize,
    generation: AtomicU64,
    bar_epoch: AtomicU64,
    ending_epoch: AtomicU64,
    volume: AtomicU32,
    swing: AtomicU32,
    change_after_bars: usize,
    sample_rate: u32,
    background_compile: bool,
    scheduler: Scheduler,
}

impl DrumSequencer {
    pub fn new(
        library: Arc<DrumPatternLibrary>,
        config: DrumConfig,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let swing = config.swing.clamp(MIN_SWING, MAX_SWING);
        Arc::new(Self {
            library: ArcSwap::new(library),
            compiled: ArcSwapOption::empty(),
            install_lock: Mutex::new(()),
            length: AtomicUsize::new(0),
            bits: AtomicU8::new(0),
            pattern_idx: AtomicUsize::new(0),
            fill_idx: AtomicUsize::new(0),
            ending_idx: AtomicUsize::new(0),
            sample_counter: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            bar_epoch: AtomicU64::new(0),
            ending_epoch: AtomicU64::new(0),
            volume: AtomicU32::new((config.volume.max(0.0) * PARAM_SCALER) as u32),
            swing: AtomicU32::new((swing as f32 * PARAM_SCALER) as u32),
            change_after_bars: config.change_after_bars.max(1),
            sample_rate: config.sample_rate.max(1),
            background_compile: config.background_compile,
            scheduler,
        })
    }

    // --- Accessors ---

    /// Bar length in frames, 0 while no bar length is known.
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load().is_some()
    }

    pub fn intensity(&self) -> Intensity {
        self.bits.load(Ordering::Acquire).into()
    }

    pub fn ending_active(&self) -> bool {
        self.bits.load(Ordering::Acquire) & ENDING_BIT != 0
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed) as f32 / PARAM_SCALER
    }

    pub fn swing(&self) -> f64 {
        (self.swing.load(Ordering::Relaxed) as f32 / PARAM_SCALER) as f64
    }

    pub fn kit_name(&self) -> String {
        self.library.load().kit_name.clone()
    }

    /// Loudest drum hit as a fraction of full scale.
    pub fn peak_level(&self) -> f32 {
        self.library.load().max_peak * self.volume() / i16::MAX as f32
    }

    // --- Length and rendering ---

    /// Sets the bar length, switches to `Level2` and renders every pattern
    /// for the new length.
    pub fn start(self: &Arc<Self>, length: usize) {
        if length == 0 {
            self.clear();
            return;
        }
        {
            let _guard = self.install_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.bar_epoch.fetch_add(1, Ordering::AcqRel);
            self.length.store(length, Ordering::Release);
            self.compiled.store(None);
        }
        self.bits.store(LEVEL2_BIT, Ordering::Release);
        log::info!("Drum started with bar length {}", length);
        self.compile(length);
    }

    /// Forgets the bar length and the rendered bars.
    pub fn clear(&self) {
        let _guard = self.install_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bar_epoch.fetch_add(1, Ordering::AcqRel);
        self.length.store(0, Ordering::Release);
        self.compiled.store(None);
        self.bits.store(0, Ordering::Release);
    }

    /// Swaps in another kit and re-renders it at the current length.
    pub fn set_library(self: &Arc<Self>, library: Arc<DrumPatternLibrary>) {
        log::info!("Drum kit '{}' selected", library.kit_name);
        self.library.store(library);
        self.rerender();
    }

    fn rerender(self: &Arc<Self>) {
        let length = self.length();
        if length > 0 {
            self.compile(length);
        }
    }

    fn compile(self: &Arc<Self>, length: usize) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.background_compile {
            let compiled = self.render(length);
            self.install(generation, compiled);
            return;
        }
        let me = self.clone();
        let spawned = thread::Builder::new()
            .name("drum-compiler".into())
            .spawn(move || {
                let compiled = me.render(length);
                me.install(generation, compiled);
            });
        if let Err(e) = spawned {
            log::error!("Failed to start drum compiler thread: {}", e);
        }
    }

    fn render(&self, length: usize) -> CompiledDrum {
        let library = self.library.load_full();
        let compiler = DrumPatternCompiler::new(&library, self.volume(), self.swing());
        compiler.prepare_all(length)
    }

    fn install(&self, generation: u64, compiled: CompiledDrum) {
        let _guard = self.install_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("Dropping drum bars rendered for length {}", compiled.length);
            return;
        }
        if !compiled.is_playable() {
            log::warn!("Drum kit has an empty pattern category, drums stay silent");
        }
        self.pattern_idx.store(0, Ordering::Relaxed);
        self.fill_idx.store(0, Ordering::Relaxed);
        self.ending_idx.store(0, Ordering::Relaxed);
        self.sample_counter.store(0, Ordering::Relaxed);
        self.compiled.store(Some(Arc::new(compiled)));
    }

    // --- Playback ---

    /// Mixes the bars selected by the current intensity into `out`.
    pub fn play(&self, out: &mut [Frame], idx: usize) {
        let bits = self.bits.load(Ordering::Acquire);
        if bits == 0 {
            return;
        }
        let guard = self.compiled.load();
        let Some(compiled) = guard.as_ref() else {
            return;
        };
        if !compiled.is_playable() {
            return;
        }

        let counter = self.sample_counter.fetch_add(out.len(), Ordering::Relaxed) + out.len();
        if counter > self.change_after_bars * compiled.length {
            self.sample_counter.store(0, Ordering::Relaxed);
            self.randomize_variants(compiled);
        }

        let pick = |idx: &AtomicUsize, bars: &[Vec<Frame>]| -> usize {
            idx.load(Ordering::Relaxed).min(bars.len() - 1)
        };
        if bits & LEVEL1_BIT != 0 {
            play_wrapped(&compiled.fills[pick(&self.fill_idx, &compiled.fills)], out, idx, false);
        }
        if bits & LEVEL2_BIT != 0 {
            let bar = &compiled.patterns[pick(&self.pattern_idx, &compiled.patterns)];
            play_wrapped(bar, out, idx, false);
        }
        if bits & ENDING_BIT != 0 {
            let bar = &compiled.endings[pick(&self.ending_idx, &compiled.endings)];
            play_wrapped(bar, out, idx, false);
        }
    }

    fn randomize_variants(&self, compiled: &CompiledDrum) {
        let mut rng = rand::thread_rng();
        let mut choose = |n: usize| if n > 1 { rng.gen_range(0..n) } else { 0 };
        self.pattern_idx
            .store(choose(compiled.patterns.len()), Ordering::Relaxed);
        self.fill_idx.store(choose(compiled.fills.len()), Ordering::Relaxed);
        self.ending_idx
            .store(choose(compiled.endings.len()), Ordering::Relaxed);
    }

    // --- Intensity ---

    /// Toggles `Level1` and `Level2`. Silent drums go to `Level1`; the ending
    /// overlay is kept.
    pub fn cycle_level(&self) {
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let level = match bits & LEVEL_MASK {
                    LEVEL1_BIT => LEVEL2_BIT,
                    _ => LEVEL1_BIT,
                };
                Some((bits & ENDING_BIT) | level)
            });
    }

    pub fn silence(&self) {
        self.ending_epoch.fetch_add(1, Ordering::AcqRel);
        self.bits.store(0, Ordering::Release);
    }

    /// Starts the ending flourish and clears it again after `bars` bars.
    /// Without `bars` the flourish lasts half a bar or a full bar at random.
    pub fn trigger_ending_now(self: &Arc<Self>, bars: Option<f64>) {
        let length = self.length();
        if length == 0 {
            log::debug!("No drum bar length, ending ignored");
            return;
        }
        let bars = bars.unwrap_or_else(|| if rand::random::<bool>() { 0.5 } else { 1.0 });

        self.bits.fetch_or(ENDING_BIT, Ordering::AcqRel);
        if let Some(compiled) = self.compiled.load().as_ref() {
            self.randomize_variants(compiled);
        }
        self.sample_counter.store(0, Ordering::Relaxed);
        let epoch = self.ending_epoch.fetch_add(1, Ordering::AcqRel) + 1;

        let me = self.clone();
        self.scheduler
            .schedule_after(self.samples_to_duration(bars * length as f64), move || {
                if me.ending_epoch.load(Ordering::Acquire) == epoch {
                    me.bits.fetch_and(!ENDING_BIT, Ordering::AcqRel);
                } else {
                    log::debug!("Ending superseded, keeping overlay");
                }
            });
    }

    /// Arms the ending so that it finishes when playback crosses the next
    /// `part_len` boundary. Returns false when there is not enough time left.
    pub fn schedule_ending_before_boundary(self: &Arc<Self>, part_len: usize, idx: usize) -> bool {
        let length = self.length();
        if length == 0 || part_len == 0 {
            return false;
        }
        let start_at = part_len as i64 - (idx % part_len) as i64 - (length / 2) as i64;
        if start_at <= 0 {
            return false;
        }
        let epoch = self.bar_epoch.load(Ordering::Acquire);
        let me = self.clone();
        self.scheduler
            .schedule_after(self.samples_to_duration(start_at as f64), move || {
                if me.bar_epoch.load(Ordering::Acquire) == epoch {
                    me.trigger_ending_now(Some(0.5));
                } else {
                    log::debug!("Drum changed since the ending was armed");
                }
            });
        true
    }

    // --- Volume and swing ---

    /// Louder for `step >= 0`, quieter otherwise. Refused when the loudest
    /// hit would leave (0.001, 1] of full scale.
    pub fn change_volume(self: &Arc<Self>, step: i32) -> bool {
        let factor = if step >= 0 {
            VOLUME_FACTOR
        } else {
            1.0 / VOLUME_FACTOR
        };
        let new_level = self.peak_level() * factor;
        if new_level <= 0.001 || new_level > 1.0 {
            log::info!("Drum volume stays at {:.3}", self.volume());
            return false;
        }
        let volume = self.volume() * factor;
        self.volume
            .store((volume * PARAM_SCALER) as u32, Ordering::Relaxed);
        log::info!("Drum volume {:.3}", volume);
        self.rerender();
        true
    }

    /// Moves swing by one sixteenth of a beat, within [0.5, 0.75].
    pub fn change_swing(self: &Arc<Self>, step: i32) -> bool {
        let old = self.swing();
        let delta = if step >= 0 { SWING_STEP } else { -SWING_STEP };
        let new = (old + delta).clamp(MIN_SWING, MAX_SWING);
        if (new - old).abs() < 1e-6 {
            return false;
        }
        self.swing
            .store((new as f32 * PARAM_SCALER) as u32, Ordering::Relaxed);
        log::info!("Drum swing {:.4}", new);
        self.rerender();
        true
    }

    fn samples_to_duration(&self, samples: f64) -> Duration {
        Duration::from_secs_f64(samples.max(0.0) / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::helpers::SILENT_FRAME;
    use crate::drum_kit::{DrumPattern, DrumSound};
    use crate::scheduler::ManualClock;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    const RATE: u32 = 1000;

    /// One sound; the pattern hits with 3000, the fill with 100, the ending
    /// with 20, each on the first frame of the bar.
    fn library() -> Arc<DrumPatternLibrary> {
        let mut sounds = BTreeMap::new();
        sounds.insert(
            "hit".to_string(),
            DrumSound {
                frames: vec![[9000, 9000]],
                volume: 1.0,
            },
        );
        let mut library = DrumPatternLibrary::from_sounds(sounds);
        let pattern = |accent: u8| DrumPattern {
            name: format!("a{}", accent),
            steps: 1,
            accents: vec![accent],
            notes: [("hit".to_string(), vec![true])].into_iter().collect(),
        };
        library.patterns = vec![pattern(3)];
        library.fills = vec![pattern(1)];
        library.endings = vec![pattern(9)];
        Arc::new(library)
    }

    fn sequencer(volume: f32) -> (Arc<ManualClock>, Scheduler, Arc<DrumSequencer>) {
        sequencer_with(library(), volume)
    }

    fn sequencer_with(
        library: Arc<DrumPatternLibrary>,
        volume: f32,
    ) -> (Arc<ManualClock>, Scheduler, Arc<DrumSequencer>) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::manual(clock.clone());
        let config = DrumConfig {
            sample_rate: RATE,
            volume,
            swing: 0.625,
            change_after_bars: 3,
            background_compile: false,
        };
        let drum = DrumSequencer::new(library, config, scheduler.clone());
        (clock, scheduler, drum)
    }

    fn first_frame(drum: &DrumSequencer) -> Frame {
        let mut out = vec![SILENT_FRAME; 4];
        drum.play(&mut out, 0);
        out[0]
    }

    #[test]
    fn variants_are_picked_again_every_few_bars() {
        let mut library = (*library()).clone();
        library.patterns.push(library.patterns[0].clone());
        library.fills.push(library.fills[0].clone());
        library.endings.push(library.endings[0].clone());
        let (_, _, drum) = sequencer_with(Arc::new(library), 1.0);
        drum.start(100);
        let mut out = vec![SILENT_FRAME; 100];

        for _ in 0..3 {
            drum.play(&mut out, 0);
        }
        assert_eq!(drum.sample_counter.load(Ordering::Relaxed), 300);
        drum.play(&mut out, 0);
        assert_eq!(drum.sample_counter.load(Ordering::Relaxed), 0);

        let mut seen = [[false; 2]; 3];
        let mut bars = vec![SILENT_FRAME; 400];
        for _ in 0..64 {
            drum.play(&mut bars, 0);
            assert_eq!(drum.sample_counter.load(Ordering::Relaxed), 0);
            let picks = [&drum.pattern_idx, &drum.fill_idx, &drum.ending_idx]
                .map(|idx| idx.load(Ordering::Relaxed));
            for (category, pick) in picks.into_iter().enumerate() {
                assert!(pick < 2);
                seen[category][pick] = true;
            }
        }
        assert_eq!(seen, [[true; 2]; 3]);
    }

    #[test]
    fn new_sequencer_is_empty_and_silent() {
        let (_, _, drum) = sequencer(1.0);
        assert!(drum.is_empty());
        assert_eq!(drum.intensity(), Intensity::Silent);
        assert_eq!(first_frame(&drum), SILENT_FRAME);
    }

    #[test]
    fn start_renders_and_plays_the_main_pattern() {
        let (_, _, drum) = sequencer(1.0);
        drum.start(1000);
        assert_eq!(drum.length(), 1000);
        assert!(drum.is_compiled());
        assert_eq!(drum.intensity(), Intensity::Level2);
        assert_eq!(first_frame(&drum), [3000, 3000]);
    }

    #[test]
    fn cycle_level_toggles_between_levels_and_keeps_ending() {
        let (_, _, drum) = sequencer(1.0);
        drum.start(1000);
        drum.cycle_level();
        assert_eq!(drum.intensity(), Intensity::Level1);
        assert_eq!(first_frame(&drum), [1000, 1000]);

        drum.trigger_ending_now(Some(1.0));
        drum.cycle_level();
        assert_eq!(drum.intensity(), Intensity::Level2);
        assert!(drum.ending_active());

        drum.silence();
        drum.cycle_level();
        assert_eq!(drum.intensity(), Intensity::Level1);
    }

    #[test]
    fn ending_overlay_clears_after_its_bars() {
        let (clock, scheduler, drum) = sequencer(1.0);
        drum.start(1000);
        drum.trigger_ending_now(Some(0.5));
        assert!(drum.ending_active());
        assert_eq!(first_frame(&drum), [12000, 12000]);

        clock.advance(Duration::from_millis(499));
        scheduler.run_due();
        assert!(drum.ending_active());
        clock.advance(Duration::from_millis(1));
        scheduler.run_due();
        assert!(!drum.ending_active());
        assert_eq!(drum.intensity(), Intensity::Level2);
    }

    #[test]
    fn superseded_ending_timer_does_nothing() {
        let (clock, scheduler, drum) = sequencer(1.0);
        drum.start(1000);
        drum.trigger_ending_now(Some(0.5));
        clock.advance(Duration::from_millis(300));
        drum.trigger_ending_now(Some(0.5));

        clock.advance(Duration::from_millis(200));
        scheduler.run_due();
        assert!(drum.ending_active());
        clock.advance(Duration::from_millis(300));
        scheduler.run_due();
        assert!(!drum.ending_active());
    }

    #[test]
    fn ending_is_armed_half_a_bar_before_the_boundary() {
        let (clock, scheduler, drum) = sequencer(1.0);
        drum.start(1000);
        // 4000 - 1000 - 500 frames left before the flourish starts
        assert!(drum.schedule_ending_before_boundary(4000, 5000));
        clock.advance(Duration::from_millis(2499));
        scheduler.run_due();
        assert!(!drum.ending_active());
        clock.advance(Duration::from_millis(1));
        scheduler.run_due();
        assert!(drum.ending_active());
        clock.advance(Duration::from_millis(500));
        scheduler.run_due();
        assert!(!drum.ending_active());
    }

    #[test]
    fn ending_is_not_armed_too_close_to_the_boundary() {
        let (_, scheduler, drum) = sequencer(1.0);
        drum.start(1000);
        assert!(!drum.schedule_ending_before_boundary(1000, 600));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn armed_ending_is_dropped_after_clear() {
        let (clock, scheduler, drum) = sequencer(1.0);
        drum.start(1000);
        assert!(drum.schedule_ending_before_boundary(4000, 0));
        drum.clear();
        clock.advance(Duration::from_secs(10));
        scheduler.run_due();
        assert!(!drum.ending_active());
        assert!(drum.is_empty());
        assert!(!drum.is_compiled());
    }

    #[test]
    fn swing_steps_stay_within_bounds() {
        let (_, _, drum) = sequencer(1.0);
        assert!(drum.change_swing(1));
        assert_relative_eq!(drum.swing(), 0.6875, epsilon = 1e-6);
        assert!(drum.change_swing(1));
        assert!(!drum.change_swing(1));
        assert_relative_eq!(drum.swing(), 0.75, epsilon = 1e-6);
        for _ in 0..4 {
            assert!(drum.change_swing(-1));
        }
        assert!(!drum.change_swing(-1));
        assert_relative_eq!(drum.swing(), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn volume_changes_are_bounded_by_full_scale() {
        // 9000 * 3 / 32767 is about 0.82 of full scale
        let (_, _, drum) = sequencer(3.0);
        assert!(!drum.change_volume(1));
        assert_relative_eq!(drum.volume(), 3.0, epsilon = 1e-4);
        assert!(drum.change_volume(-1));
        assert_relative_eq!(drum.volume(), 3.0 / 1.41, epsilon = 1e-4);

        drum.start(1000);
        assert!(drum.change_volume(-1));
        let expected = (9000.0 * 3.0 / 1.41 / 1.41 / 3.0) as i16;
        assert!((first_frame(&drum)[0] - expected).abs() <= 1);
    }

    #[test]
    fn new_library_is_rendered_at_the_current_length() {
        let (_, _, drum) = sequencer(1.0);
        drum.start(500);
        let mut quiet = (*library()).clone();
        quiet.kit_name = "quiet".into();
        for p in &mut quiet.patterns {
            p.accents = vec![0];
        }
        drum.set_library(Arc::new(quiet));
        assert_eq!(drum.kit_name(), "quiet");
        assert_eq!(first_frame(&drum), SILENT_FRAME);
    }
}
