//! Playback queue
//!
//! Strict FIFO ordering over TTS streams whose synthesis overlaps: a
//! stream becomes "current" only when the queue reaches it and the sender
//! is idle, chunks received before promotion are buffered, and chunks
//! received while current are forwarded as they arrive. `clear` is the
//! barge-in path: every stream is cancelled, the sender stops, and the
//! bot-speaking flag drops.

use crate::audio::{bytes_to_pcm, pcm_to_bytes, to_transport_format};
use crate::echo::EchoSuppressor;
use crate::sender::AudioSender;
use bytes::Bytes;
use lyra_provider_voice::TtsStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue lifecycle events
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// A current entry produced its first audio
    Started,
    /// Every entry finished and the sender drained
    Idle,
    /// `clear` completed
    Cleared,
    /// The current entry failed; the next entry was promoted
    EntryError {
        /// Failure description
        message: String,
    },
}

#[derive(Default)]
struct EntryState {
    /// Chunks received before this entry became current
    buffered: Vec<Bytes>,
    current: bool,
    /// No more chunks will arrive
    finished: bool,
    /// Odd trailing byte kept for sample alignment across chunks
    leftover: Vec<u8>,
    emitted_audio: bool,
}

struct Entry {
    id: Uuid,
    sample_rate: u32,
    state: Mutex<EntryState>,
    cancel: CancellationToken,
}

struct QueueState {
    pending: VecDeque<Arc<Entry>>,
    current: Option<Arc<Entry>>,
    /// Set during `clear` so the sender's idle callback cannot promote
    draining: bool,
}

struct QueueInner {
    sender: Arc<AudioSender>,
    echo: Arc<EchoSuppressor>,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    idle: watch::Sender<bool>,
}

/// FIFO playback queue in front of the audio sender
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
}

impl PlaybackQueue {
    /// Create a queue wired to a sender and echo suppressor
    pub fn new(
        sender: Arc<AudioSender>,
        echo: Arc<EchoSuppressor>,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (idle, _) = watch::channel(true);

        let inner = Arc::new(QueueInner {
            sender: sender.clone(),
            echo,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                draining: false,
            }),
            events,
            idle,
        });

        let weak = Arc::downgrade(&inner);
        sender.on_idle(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                QueueInner::on_sender_idle(&inner);
            }
        }));

        (Self { inner }, events_rx)
    }

    /// Enqueue a TTS stream; playback order is enqueue order regardless
    /// of synthesis completion order
    pub fn enqueue(&self, stream: TtsStream) {
        let TtsStream {
            sample_rate,
            chunks,
            cancel: tts_cancel,
        } = stream;

        let entry = Arc::new(Entry {
            id: Uuid::new_v4(),
            sample_rate,
            state: Mutex::new(EntryState::default()),
            cancel: CancellationToken::new(),
        });

        {
            let mut state = self.inner.state.lock();
            if state.draining {
                tts_cancel.cancel();
                return;
            }
            state.pending.push_back(entry.clone());
        }
        debug!(entry_id = %entry.id, "Enqueued playback entry");

        let inner = self.inner.clone();
        let pump_entry = entry.clone();
        tokio::spawn(async move {
            let mut chunks = chunks;
            loop {
                tokio::select! {
                    _ = pump_entry.cancel.cancelled() => {
                        tts_cancel.cancel();
                        return;
                    }
                    chunk = chunks.recv() => {
                        match chunk {
                            Some(Ok(chunk)) => {
                                if !chunk.data.is_empty() {
                                    QueueInner::entry_chunk(&inner, &pump_entry, chunk.data);
                                }
                                if chunk.is_final {
                                    QueueInner::entry_finished(&inner, &pump_entry);
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                QueueInner::entry_failed(&inner, &pump_entry, e.to_string());
                                return;
                            }
                            None => {
                                QueueInner::entry_finished(&inner, &pump_entry);
                                return;
                            }
                        }
                    }
                }
            }
        });

        QueueInner::try_promote(&self.inner);
    }

    /// Barge-in: cancel every stream, stop the sender, drop the
    /// bot-speaking flag
    pub fn clear(&self) {
        let entries: Vec<Arc<Entry>> = {
            let mut state = self.inner.state.lock();
            state.draining = true;
            let mut entries: Vec<_> = state.pending.drain(..).collect();
            if let Some(current) = state.current.take() {
                entries.push(current);
            }
            entries
        };

        for entry in &entries {
            entry.cancel.cancel();
        }
        self.inner.sender.stop();
        self.inner.echo.set_speaking(false);

        self.inner.state.lock().draining = false;
        let _ = self.inner.idle.send(true);
        let _ = self.inner.events.send(PlaybackEvent::Cleared);
        debug!(cancelled = %entries.len(), "Playback queue cleared");
    }

    /// Whether an entry is current or audio is still draining
    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().current.is_some() || self.inner.sender.is_playing()
    }

    /// Number of entries waiting behind the current one
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Watch the queue's idle flag
    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.inner.idle.subscribe()
    }

    /// Resolve once the queue is fully drained
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        loop {
            if *rx.borrow() && !self.is_playing() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl QueueInner {
    /// A chunk arrived from a stream's pump task
    fn entry_chunk(inner: &Arc<QueueInner>, entry: &Arc<Entry>, data: Bytes) {
        let mut state = entry.state.lock();
        if state.current {
            Self::forward(inner, entry, &mut state, &data);
        } else {
            state.buffered.push(data);
        }
    }

    /// Convert a chunk to transport format and hand it to the sender,
    /// registering it with the echo suppressor first
    fn forward(inner: &Arc<QueueInner>, entry: &Arc<Entry>, state: &mut EntryState, data: &[u8]) {
        let mut bytes = std::mem::take(&mut state.leftover);
        bytes.extend_from_slice(data);
        if bytes.len() % 2 == 1 {
            state.leftover = vec![bytes.pop().expect("non-empty")];
        }
        if bytes.is_empty() {
            return;
        }

        let pcm = bytes_to_pcm(&bytes);
        inner.echo.register_outbound(&pcm);

        let transport = to_transport_format(&pcm, entry.sample_rate, 1);
        inner.sender.write(Bytes::from(pcm_to_bytes(&transport)));

        if !state.emitted_audio {
            state.emitted_audio = true;
            let _ = inner.events.send(PlaybackEvent::Started);
        }
    }

    /// A stream signalled end (or its channel closed)
    fn entry_finished(inner: &Arc<QueueInner>, entry: &Arc<Entry>) {
        entry.state.lock().finished = true;
        // A finished current entry with nothing left to play should not
        // wait for another idle edge.
        if !inner.sender.is_playing() {
            Self::on_sender_idle(inner);
        }
    }

    /// A stream errored
    fn entry_failed(inner: &Arc<QueueInner>, entry: &Arc<Entry>, message: String) {
        let was_current = {
            let mut state = inner.state.lock();
            if state
                .current
                .as_ref()
                .map(|c| c.id == entry.id)
                .unwrap_or(false)
            {
                state.current = None;
                true
            } else {
                // An entry that errors before becoming current is removed
                // silently.
                state.pending.retain(|e| e.id != entry.id);
                false
            }
        };

        if was_current {
            warn!(entry_id = %entry.id, error = %message, "Current playback entry failed");
            let _ = inner.events.send(PlaybackEvent::EntryError { message });
            Self::try_promote(inner);
        } else {
            debug!(entry_id = %entry.id, error = %message, "Pending playback entry dropped");
        }
    }

    /// Sender went idle: retire a finished current entry and promote
    fn on_sender_idle(inner: &Arc<QueueInner>) {
        {
            let mut state = inner.state.lock();
            if state.draining {
                return;
            }
            let retire = state
                .current
                .as_ref()
                .map(|c| c.state.lock().finished)
                .unwrap_or(false);
            if retire {
                state.current = None;
            }
        }
        Self::try_promote(inner);
    }

    /// Promote the next pending entry if nothing is current and the
    /// sender is idle
    fn try_promote(inner: &Arc<QueueInner>) {
        loop {
            let promoted = {
                let mut state = inner.state.lock();
                if state.draining || state.current.is_some() || inner.sender.is_playing() {
                    return;
                }
                match state.pending.pop_front() {
                    Some(entry) => {
                        state.current = Some(entry.clone());
                        Some(entry)
                    }
                    None => None,
                }
            };

            let Some(entry) = promoted else {
                // Fully drained.
                inner.echo.set_speaking(false);
                let _ = inner.idle.send(true);
                let _ = inner.events.send(PlaybackEvent::Idle);
                return;
            };

            inner.echo.set_speaking(true);
            let _ = inner.idle.send(false);
            debug!(entry_id = %entry.id, "Playback entry promoted");

            let finished_empty = {
                let mut state = entry.state.lock();
                state.current = true;
                let buffered: Vec<Bytes> = state.buffered.drain(..).collect();
                for data in &buffered {
                    Self::forward(inner, &entry, &mut state, data);
                }
                state.finished && !inner.sender.is_playing()
            };

            if finished_empty {
                // Nothing to play; retire and look at the next entry.
                inner.state.lock().current = None;
                continue;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{AudioSink, NullSink};
    use async_trait::async_trait;
    use lyra_provider_voice::{create_audio_stream, AudioChunk, AudioStreamSender};
    use std::time::Duration;

    fn make_queue() -> (PlaybackQueue, mpsc::UnboundedReceiver<PlaybackEvent>, Arc<AudioSender>) {
        let sender = Arc::new(AudioSender::new(Arc::new(NullSink)));
        let echo = Arc::new(EchoSuppressor::new(true));
        let (queue, events) = PlaybackQueue::new(sender.clone(), echo);
        (queue, events, sender)
    }

    fn make_stream(sample_rate: u32) -> (AudioStreamSender, TtsStream) {
        let (tx, rx) = create_audio_stream(32);
        (
            tx,
            TtsStream {
                sample_rate,
                chunks: rx,
                cancel: CancellationToken::new(),
            },
        )
    }

    async fn push(tx: &AudioStreamSender, bytes: usize, index: usize) {
        tx.send(Ok(AudioChunk {
            data: Bytes::from(vec![1u8; bytes]),
            index,
            is_final: false,
        }))
        .await
        .unwrap();
    }

    async fn finish(tx: &AudioStreamSender, index: usize) {
        tx.send(Ok(AudioChunk {
            data: Bytes::new(),
            index,
            is_final: true,
        }))
        .await
        .unwrap();
    }

    /// Sink that records the order in which entries' audio arrives via a
    /// marker byte.
    struct MarkerSink {
        markers: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl AudioSink for MarkerSink {
        async fn write_frame(&self, frame: Bytes) -> lyra_core::Result<()> {
            if let Some(&first) = frame.first() {
                let mut markers = self.markers.lock();
                if markers.last() != Some(&first) {
                    markers.push(first);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fifo_order_with_interleaved_synthesis() {
        let sink = Arc::new(MarkerSink {
            markers: Mutex::new(Vec::new()),
        });
        let sender = Arc::new(AudioSender::new(sink.clone()));
        let echo = Arc::new(EchoSuppressor::new(false));
        let (queue, _events) = PlaybackQueue::new(sender, echo);

        let (tx1, stream1) = make_stream(48000);
        let (tx2, stream2) = make_stream(48000);
        queue.enqueue(stream1);
        queue.enqueue(stream2);

        // Stream 2 finishes synthesis first.
        tx2.send(Ok(AudioChunk {
            data: Bytes::from(vec![2u8; 3840]),
            index: 0,
            is_final: false,
        }))
        .await
        .unwrap();
        finish(&tx2, 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        tx1.send(Ok(AudioChunk {
            data: Bytes::from(vec![1u8; 3840]),
            index: 0,
            is_final: false,
        }))
        .await
        .unwrap();
        finish(&tx1, 1).await;

        queue.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let markers = sink.markers.lock().clone();
        assert_eq!(markers, vec![1, 2], "playback order must match enqueue order");
    }

    #[tokio::test]
    async fn test_clear_is_atomic() {
        let (queue, mut events, sender) = make_queue();

        let (tx1, stream1) = make_stream(48000);
        let (_tx2, stream2) = make_stream(48000);
        queue.enqueue(stream1);
        queue.enqueue(stream2);

        push(&tx1, 3840 * 20, 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_playing());

        queue.clear();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!queue.is_playing());
        assert!(!sender.is_playing());
        assert_eq!(queue.pending_len(), 0);

        // Chunks sent after the clear must not restart playback.
        let _ = tx1
            .send(Ok(AudioChunk {
                data: Bytes::from(vec![1u8; 3840]),
                index: 1,
                is_final: false,
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!queue.is_playing());

        let mut saw_cleared = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PlaybackEvent::Cleared) {
                saw_cleared = true;
            }
        }
        assert!(saw_cleared);
    }

    #[tokio::test]
    async fn test_pending_error_is_silent_and_skipped() {
        let (queue, mut events, _sender) = make_queue();

        let (tx1, stream1) = make_stream(48000);
        let (tx2, stream2) = make_stream(48000);
        let (tx3, stream3) = make_stream(48000);
        queue.enqueue(stream1);
        queue.enqueue(stream2);
        queue.enqueue(stream3);

        // Entry 2 errors before ever becoming current.
        tx2.send(Err(lyra_core::LyraError::provider("tts 500")))
            .await
            .unwrap();

        push(&tx1, 3840, 0).await;
        finish(&tx1, 1).await;
        push(&tx3, 3840, 0).await;
        finish(&tx3, 1).await;

        queue.wait_idle().await;

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PlaybackEvent::EntryError { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 0, "pre-current errors are removed silently");
    }

    #[tokio::test]
    async fn test_current_error_is_surfaced() {
        let (queue, mut events, _sender) = make_queue();

        let (tx1, stream1) = make_stream(48000);
        queue.enqueue(stream1);

        push(&tx1, 3840, 0).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx1.send(Err(lyra_core::LyraError::provider("stream died")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let PlaybackEvent::EntryError { message } = event {
                assert!(message.contains("stream died"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_started_event_fires_on_first_audio() {
        let (queue, mut events, _sender) = make_queue();
        let (tx, stream) = make_stream(48000);
        queue.enqueue(stream);

        push(&tx, 3840, 0).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PlaybackEvent::Started) {
                saw_started = true;
            }
        }
        assert!(saw_started);

        finish(&tx, 1).await;
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn test_echo_speaking_flag_tracks_queue() {
        let sender = Arc::new(AudioSender::new(Arc::new(NullSink)));
        let echo = Arc::new(EchoSuppressor::new(true));
        let (queue, _events) = PlaybackQueue::new(sender, echo.clone());

        let (tx, stream) = make_stream(48000);
        queue.enqueue(stream);
        push(&tx, 3840, 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(echo.is_speaking());

        finish(&tx, 1).await;
        queue.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!echo.is_speaking());
    }

    #[tokio::test]
    async fn test_rapid_enqueue_drains_fully() {
        let (queue, _events, _sender) = make_queue();

        for _ in 0..5 {
            let (tx, stream) = make_stream(48000);
            queue.enqueue(stream);
            tokio::spawn(async move {
                push(&tx, 3840, 0).await;
                finish(&tx, 1).await;
            });
        }

        queue.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.wait_idle().await;
        assert_eq!(queue.pending_len(), 0);
    }
}
