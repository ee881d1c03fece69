//! Audio sender
//!
//! Paces 48 kHz stereo PCM into the transport in 20 ms frames and
//! surfaces a playing/idle edge the playback queue keys off.

use crate::audio::TRANSPORT_FRAME_BYTES;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cadence of transport frames
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Destination for transport-format PCM frames
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Write one frame (at most [`TRANSPORT_FRAME_BYTES`] bytes)
    async fn write_frame(&self, frame: Bytes) -> lyra_core::Result<()>;
}

/// A sink that discards audio; used when no transport is attached
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn write_frame(&self, _frame: Bytes) -> lyra_core::Result<()> {
        Ok(())
    }
}

enum SenderCmd {
    /// Append PCM bytes to the outgoing buffer
    Write(Bytes),
    /// Drop everything buffered and go idle now
    Stop,
    /// Terminate the pacing task
    Shutdown,
}

/// Callback invoked on the playing -> idle edge
pub type IdleCallback = Box<dyn Fn() + Send + Sync>;

/// Paced writer in front of an [`AudioSink`]
pub struct AudioSender {
    tx: mpsc::UnboundedSender<SenderCmd>,
    playing: Arc<AtomicBool>,
    idle_callbacks: Arc<Mutex<Vec<IdleCallback>>>,
}

impl AudioSender {
    /// Create a sender and spawn its pacing task
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let playing = Arc::new(AtomicBool::new(false));
        let idle_callbacks: Arc<Mutex<Vec<IdleCallback>>> = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(Self::run(
            sink,
            rx,
            playing.clone(),
            idle_callbacks.clone(),
        ));

        Self {
            tx,
            playing,
            idle_callbacks,
        }
    }

    /// Register an idle callback; fired every time the buffer drains or
    /// playback is stopped
    pub fn on_idle(&self, callback: IdleCallback) {
        self.idle_callbacks.lock().push(callback);
    }

    /// Whether frames are queued or in flight
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Append transport-format PCM; playback starts immediately if idle
    pub fn write(&self, pcm: Bytes) {
        if pcm.is_empty() {
            return;
        }
        self.playing.store(true, Ordering::SeqCst);
        let _ = self.tx.send(SenderCmd::Write(pcm));
    }

    /// Drop buffered audio and go idle
    pub fn stop(&self) {
        let _ = self.tx.send(SenderCmd::Stop);
    }

    /// Terminate the pacing task
    pub fn shutdown(&self) {
        let _ = self.tx.send(SenderCmd::Shutdown);
    }

    async fn run(
        sink: Arc<dyn AudioSink>,
        mut rx: mpsc::UnboundedReceiver<SenderCmd>,
        playing: Arc<AtomicBool>,
        idle_callbacks: Arc<Mutex<Vec<IdleCallback>>>,
    ) {
        let mut buffer: Vec<u8> = Vec::new();
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let go_idle = |playing: &AtomicBool, idle_callbacks: &Mutex<Vec<IdleCallback>>| {
            playing.store(false, Ordering::SeqCst);
            for callback in idle_callbacks.lock().iter() {
                callback();
            }
        };

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(SenderCmd::Write(pcm)) => {
                            buffer.extend_from_slice(&pcm);
                        }
                        Some(SenderCmd::Stop) => {
                            let dropped = buffer.len();
                            buffer.clear();
                            if dropped > 0 {
                                debug!(dropped_bytes = %dropped, "Audio sender stopped");
                            }
                            go_idle(&playing, &idle_callbacks);
                        }
                        Some(SenderCmd::Shutdown) | None => return,
                    }
                }
                _ = ticker.tick(), if !buffer.is_empty() => {
                    let take = buffer.len().min(TRANSPORT_FRAME_BYTES);
                    let frame: Vec<u8> = buffer.drain(..take).collect();
                    if let Err(e) = sink.write_frame(Bytes::from(frame)).await {
                        warn!(error = %e, "Transport write failed, dropping buffered audio");
                        buffer.clear();
                    }
                    if buffer.is_empty() {
                        go_idle(&playing, &idle_callbacks);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSink {
        frames: AtomicUsize,
        bytes: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for CountingSink {
        async fn write_frame(&self, frame: Bytes) -> lyra_core::Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(frame.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drains_and_goes_idle() {
        let sink = Arc::new(CountingSink {
            frames: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        });
        let sender = AudioSender::new(sink.clone());

        let idle_count = Arc::new(AtomicUsize::new(0));
        let idle_clone = idle_count.clone();
        sender.on_idle(Box::new(move || {
            idle_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Two transport frames worth of audio.
        sender.write(Bytes::from(vec![0u8; TRANSPORT_FRAME_BYTES * 2]));
        assert!(sender.is_playing());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!sender.is_playing());
        assert_eq!(sink.frames.load(Ordering::SeqCst), 2);
        assert_eq!(sink.bytes.load(Ordering::SeqCst), TRANSPORT_FRAME_BYTES * 2);
        assert_eq!(idle_count.load(Ordering::SeqCst), 1);

        sender.shutdown();
    }

    #[tokio::test]
    async fn test_stop_drops_buffered_audio() {
        let sink = Arc::new(CountingSink {
            frames: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        });
        let sender = AudioSender::new(sink.clone());

        // A second of audio, stopped immediately.
        sender.write(Bytes::from(vec![0u8; TRANSPORT_FRAME_BYTES * 50]));
        sender.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sender.is_playing());
        // At most a frame or two slipped out before the stop landed.
        assert!(sink.frames.load(Ordering::SeqCst) <= 2);

        sender.shutdown();
    }
}
