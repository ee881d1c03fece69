//! Echo suppression
//!
//! Two-stage heuristic, not an acoustic echo canceller: good enough for
//! typical consumer speaker/mic setups.
//!
//! 1. Temporal gating: while the bot is speaking, or shortly after it
//!    stops, low-energy inbound frames are dropped.
//! 2. Energy correlation: while the bot is speaking, an inbound frame is
//!    dropped unless it is clearly louder than the recent outbound audio,
//!    which admits genuine barge-in while rejecting leakage.

use crate::audio::rms;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

/// Window after playback stops during which the tail of the echo is gated
pub const ECHO_COOLDOWN_MS: u64 = 300;

/// Outbound RMS history length; about one second at 20 ms frames
const RING_CAPACITY: usize = 50;

/// Inbound audio must exceed this multiple of the outbound mean to pass
const CORRELATION_FACTOR: f64 = 1.4;

/// Cooldown-only energy floor, in int16 units; below conversational speech
const COOLDOWN_RMS_FLOOR: f64 = 600.0;

/// Fixed-capacity ring of outbound frame energies
struct RmsRing {
    values: [f64; RING_CAPACITY],
    len: usize,
    pos: usize,
    sum: f64,
}

impl RmsRing {
    fn new() -> Self {
        Self {
            values: [0.0; RING_CAPACITY],
            len: 0,
            pos: 0,
            sum: 0.0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.len == RING_CAPACITY {
            self.sum -= self.values[self.pos];
        } else {
            self.len += 1;
        }
        self.values[self.pos] = value;
        self.sum += value;
        self.pos = (self.pos + 1) % RING_CAPACITY;
    }

    fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.sum / self.len as f64
    }

    fn clear(&mut self) {
        self.values = [0.0; RING_CAPACITY];
        self.len = 0;
        self.pos = 0;
        self.sum = 0.0;
    }
}

struct EchoState {
    speaking: bool,
    last_stop: Option<Instant>,
    ring: RmsRing,
}

/// Per-session echo suppressor
pub struct EchoSuppressor {
    enabled: bool,
    state: Mutex<EchoState>,
}

impl EchoSuppressor {
    /// Create a suppressor; a disabled suppressor never drops frames
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(EchoState {
                speaking: false,
                last_stop: None,
                ring: RmsRing::new(),
            }),
        }
    }

    /// Record a frame of outbound bot audio (called just before the frame
    /// is handed to the sender)
    pub fn register_outbound(&self, pcm: &[i16]) {
        if !self.enabled {
            return;
        }
        self.state.lock().ring.push(rms(pcm));
    }

    /// Update the bot-speaking flag
    pub fn set_speaking(&self, speaking: bool) {
        let mut state = self.state.lock();
        if state.speaking && !speaking {
            state.last_stop = Some(Instant::now());
            state.ring.clear();
        }
        state.speaking = speaking;
    }

    /// Whether the bot-speaking flag is up
    pub fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }

    /// Decide whether an inbound 16 kHz mono frame should be dropped
    pub fn should_drop(&self, pcm: &[i16]) -> bool {
        if !self.enabled {
            return false;
        }

        let state = self.state.lock();
        let inbound = rms(pcm);

        if state.speaking {
            let outbound_mean = state.ring.mean();
            if outbound_mean > 0.0 && inbound < outbound_mean * CORRELATION_FACTOR {
                trace!(inbound = %inbound, outbound_mean = %outbound_mean, "Dropping echo frame");
                return true;
            }
            return false;
        }

        if let Some(stopped) = state.last_stop {
            if (stopped.elapsed().as_millis() as u64) < ECHO_COOLDOWN_MS
                && inbound < COOLDOWN_RMS_FLOOR
            {
                trace!(inbound = %inbound, "Dropping cooldown echo frame");
                return true;
            }
        }

        false
    }
}
