// FILE: src\audio_engine\transport.rs
// ====================================

use crate::drum_engine::DrumSequencer;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Resettable event flag threads can block on. Reading the flag never
/// takes the lock.
#[derive(Default)]
pub struct Signal {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_set() {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Returns whether the flag was set before `timeout` ran out.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .cond
            .wait_timeout_while(guard, timeout, |_| !self.is_set())
            .unwrap_or_else(|e| e.into_inner());
        self.is_set()
    }
}

const NO_STOP: usize = usize::MAX;

/// Position and stop point of the running part. Shared by the playback
/// thread, the audio callback and command handlers.
pub struct LoopTransport {
    play_index: AtomicUsize,
    is_recording: AtomicBool,
    stop_length: AtomicUsize,
    pub stop_signal: Signal,
    drum: Arc<DrumSequencer>,
    max_late_samples: usize,
}

impl LoopTransport {
    pub fn new(drum: Arc<DrumSequencer>, max_late_samples: usize) -> Self {
        Self {
            play_index: AtomicUsize::new(0),
            is_recording: AtomicBool::new(false),
            stop_length: AtomicUsize::new(NO_STOP),
            stop_signal: Signal::new(),
            drum,
            max_late_samples,
        }
    }

    pub fn drum(&self) -> &Arc<DrumSequencer> {
        &self.drum
    }

    pub fn idx(&self) -> usize {
        self.play_index.load(Ordering::Acquire)
    }

    pub fn set_idx(&self, idx: usize) {
        self.play_index.store(idx, Ordering::Release);
    }

    /// Moves the play index forward by one block and returns the new index.
    pub fn advance(&self, frames: usize) -> usize {
        self.play_index.fetch_add(frames, Ordering::AcqRel) + frames
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.is_recording.store(recording, Ordering::Release);
    }

    pub fn stop_length(&self) -> Option<usize> {
        match self.stop_length.load(Ordering::Acquire) {
            NO_STOP => None,
            len => Some(len),
        }
    }

    pub fn is_stop_len_set(&self) -> bool {
        self.stop_length().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal.is_set()
    }

    pub fn stop_never(&self) {
        self.stop_length.store(NO_STOP, Ordering::Release);
    }

    pub fn stop_now(&self) {
        self.stop_never();
        self.stop_signal.set();
    }

    /// Stops at the next multiple of `bound`. Stops right away when the play
    /// index is within `max_late_samples` of a multiple on either side.
    /// Returns true for an immediate stop.
    pub fn stop_at_bound(&self, bound: usize) -> bool {
        let idx = self.idx();
        if bound == 0 {
            self.stop_now();
            return true;
        }
        let over = idx % bound;
        let remainder = bound - over;
        if over < self.max_late_samples || remainder < self.max_late_samples {
            self.stop_now();
            true
        } else {
            self.stop_length
                .store(idx - over + bound, Ordering::Release);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drum_engine::DrumConfig;
    use crate::drum_kit::DrumPatternLibrary;
    use crate::scheduler::{ManualClock, Scheduler};
    use std::thread;

    fn transport(max_late: usize) -> LoopTransport {
        let scheduler = Scheduler::manual(Arc::new(ManualClock::new()));
        let config = DrumConfig {
            sample_rate: 1000,
            volume: 1.0,
            swing: 0.625,
            change_after_bars: 3,
            background_compile: false,
        };
        let drum = DrumSequencer::new(Arc::new(DrumPatternLibrary::default()), config, scheduler);
        LoopTransport::new(drum, max_late)
    }

    #[test]
    fn stop_close_to_a_bound_is_immediate() {
        let t = transport(100);
        t.set_idx(950);
        assert!(t.stop_at_bound(1000));
        assert!(t.is_stopped());
        assert_eq!(t.stop_length(), None);

        let t = transport(100);
        t.set_idx(2030);
        assert!(t.stop_at_bound(1000));
        assert!(t.is_stopped());
    }

    #[test]
    fn stop_far_from_a_bound_waits_for_it() {
        let t = transport(100);
        t.set_idx(500);
        assert!(!t.stop_at_bound(1000));
        assert!(!t.is_stopped());
        assert_eq!(t.stop_length(), Some(1000));

        t.set_idx(3400);
        t.stop_at_bound(1000);
        assert_eq!(t.stop_length(), Some(4000));
        assert!(t.stop_length().unwrap() >= t.idx());
    }

    #[test]
    fn stop_never_cancels_a_pending_stop() {
        let t = transport(100);
        t.set_idx(500);
        t.stop_at_bound(1000);
        t.stop_never();
        assert!(!t.is_stop_len_set());
    }

    #[test]
    fn advance_returns_the_new_index() {
        let t = transport(0);
        assert_eq!(t.advance(256), 256);
        assert_eq!(t.advance(256), 512);
        assert_eq!(t.idx(), 512);
    }

    #[test]
    fn signal_wakes_a_waiting_thread() {
        let signal = Arc::new(Signal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };
        signal.set();
        waiter.join().unwrap();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        signal.clear();
        assert!(!signal.is_set());
    }
}
