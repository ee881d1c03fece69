//! End-to-end session scenarios over mock providers and transport

use async_trait::async_trait;
use bytes::Bytes;
use lyra_adaptor_discord::agent::{AgentDispatcher, DispatchContext};
use lyra_adaptor_discord::engine::{ConversationEngine, EngineEvent, EngineMode, PipelineEngine};
use lyra_adaptor_discord::sender::NullSink;
use lyra_adaptor_discord::session::{SessionContext, SessionState, VoiceSession};
use lyra_adaptor_discord::settings::{VoiceMode, VoiceSettings};
use lyra_core::{create_text_stream, ConversationTurn, Result, TextChunk, TextStream};
use lyra_provider_voice::{
    create_audio_stream, AudioChunk, AudioData, SttEngine, TranscriptionResult, TtsEngine,
    TtsStream,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn test_settings() -> VoiceSettings {
    let mut settings = VoiceSettings::default();
    settings.mode = VoiceMode::Pipeline;
    settings.vad.engine = "rms".to_string();
    settings.vad.threshold = 0.5; // 800 in int16 RMS units
    settings.vad.silence_duration_ms = 100;
    settings
}

fn session_with(settings: VoiceSettings, dispatcher: Arc<dyn AgentDispatcher>) -> Arc<VoiceSession> {
    VoiceSession::new(
        SessionContext {
            guild_id: 100,
            channel_id: 200,
            settings,
        },
        Arc::new(NullSink),
        dispatcher,
    )
}

/// 20 ms of 48 kHz stereo at a fixed amplitude
fn frame_48k(amplitude: i16) -> Vec<i16> {
    vec![amplitude; 1920]
}

async fn feed_silence(session: &VoiceSession, user_id: u64, frames: usize) {
    for _ in 0..frames {
        session.handle_frame(user_id, &frame_48k(0)).await;
    }
}

async fn wait_for_state(session: &VoiceSession, target: SessionState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if session.state() == target {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Mock providers
// ---------------------------------------------------------------------------

struct FixedStt {
    text: String,
}

#[async_trait]
impl SttEngine for FixedStt {
    fn name(&self) -> &str {
        "fixed"
    }
    async fn transcribe(&self, _audio: &AudioData) -> Result<TranscriptionResult> {
        Ok(TranscriptionResult::new(self.text.clone()))
    }
}

/// TTS emitting a short burst of audio per sentence, recording submissions
struct BurstTts {
    texts: Arc<Mutex<Vec<String>>>,
    chunks_per_stream: usize,
}

#[async_trait]
impl TtsEngine for BurstTts {
    fn name(&self) -> &str {
        "burst"
    }
    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream> {
        self.texts.lock().push(text.to_string());
        let (tx, rx) = create_audio_stream(16);
        let count = self.chunks_per_stream;
        tokio::spawn(async move {
            for i in 0..count {
                let _ = tx
                    .send(Ok(AudioChunk {
                        data: Bytes::from(vec![50u8; 960]),
                        index: i,
                        is_final: false,
                    }))
                    .await;
            }
            let _ = tx
                .send(Ok(AudioChunk {
                    data: Bytes::new(),
                    index: count,
                    is_final: true,
                }))
                .await;
        });
        Ok(TtsStream {
            sample_rate: 24000,
            chunks: rx,
            cancel: CancellationToken::new(),
        })
    }
}

struct ScriptedDispatcher {
    blocks: Vec<String>,
}

#[async_trait]
impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, _ctx: DispatchContext) -> Result<TextStream> {
        let (tx, rx) = create_text_stream(8);
        let blocks = self.blocks.clone();
        tokio::spawn(async move {
            let len = blocks.len();
            for (i, block) in blocks.into_iter().enumerate() {
                let _ = tx
                    .send(Ok(TextChunk {
                        text: block,
                        is_final: i + 1 == len,
                    }))
                    .await;
            }
        });
        Ok(rx)
    }
}

/// Engine that only counts calls; used for barge-in accounting
struct CountingEngine {
    interrupts: Arc<AtomicUsize>,
    eos: Arc<AtomicUsize>,
    /// Held so the session's event loop stays alive
    _events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl CountingEngine {
    fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let interrupts = Arc::new(AtomicUsize::new(0));
        let eos = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                interrupts: interrupts.clone(),
                eos: eos.clone(),
                _events_tx: tx,
                events_rx: Some(rx),
            },
            interrupts,
            eos,
        )
    }
}

#[async_trait]
impl ConversationEngine for CountingEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Pipeline
    }
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn feed_audio(&self, _user_id: u64, _pcm: &[i16]) -> Result<()> {
        Ok(())
    }
    async fn end_of_speech(&self, _user_id: u64) -> Result<()> {
        self.eos.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn inject_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn history(&self) -> Vec<ConversationTurn> {
        Vec::new()
    }
    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.take()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_round_trip() {
    let session = session_with(
        test_settings(),
        Arc::new(ScriptedDispatcher {
            blocks: vec![
                "It is noon. ".to_string(),
                "Let me know if you need more.".to_string(),
            ],
        }),
    );

    let texts = Arc::new(Mutex::new(Vec::new()));
    let engine = PipelineEngine::new(
        Arc::new(FixedStt {
            text: "What time is it?".to_string(),
        }),
        None,
        Arc::new(BurstTts {
            texts: texts.clone(),
            chunks_per_stream: 2,
        }),
        None,
        session.bridge(),
        session.queue(),
        50,
        60_000,
    );
    session.start_with_engine(Box::new(engine)).await.unwrap();
    assert_eq!(session.state(), SessionState::Listening);

    // The user speaks, then goes quiet past the silence window.
    for _ in 0..10 {
        session.handle_frame(7, &frame_48k(4000)).await;
    }
    feed_silence(&session, 7, 8).await;

    assert!(
        wait_for_state(&session, SessionState::Speaking, Duration::from_secs(3)).await,
        "first sentence should reach playback"
    );
    assert!(
        wait_for_state(&session, SessionState::Listening, Duration::from_secs(5)).await,
        "turn should end back in listening"
    );

    // Both sentences were synthesized, in order.
    assert_eq!(
        texts.lock().clone(),
        vec!["It is noon.", "Let me know if you need more."]
    );

    // Two turns on record.
    let history = session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "What time is it?");

    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn barge_in_reaches_listening_with_one_interrupt() {
    let session = session_with(test_settings(), Arc::new(ScriptedDispatcher { blocks: vec![] }));

    let (engine, interrupts, _eos) = CountingEngine::new();
    session.start_with_engine(Box::new(engine)).await.unwrap();

    // Put the session into speaking state via a quiet playback stream.
    let (tx, rx) = create_audio_stream(16);
    session.queue().enqueue(TtsStream {
        sample_rate: 24000,
        chunks: rx,
        cancel: CancellationToken::new(),
    });
    for i in 0..30 {
        tx.send(Ok(AudioChunk {
            data: Bytes::from(vec![20u8; 960]),
            index: i,
            is_final: false,
        }))
        .await
        .unwrap();
    }
    assert!(
        wait_for_state(&session, SessionState::Speaking, Duration::from_secs(2)).await,
        "playback should move the session to speaking"
    );

    // Loud user speech over the quiet bot audio: barge-in.
    for _ in 0..5 {
        session.handle_frame(7, &frame_48k(12000)).await;
    }

    assert!(
        wait_for_state(&session, SessionState::Listening, Duration::from_secs(1)).await,
        "barge-in should return to listening"
    );
    assert_eq!(interrupts.load(Ordering::SeqCst), 1, "exactly one interrupt");
    assert!(!session.queue().is_playing());

    session.stop().await.unwrap();
}

#[tokio::test]
async fn barge_in_disabled_keeps_speaking() {
    let mut settings = test_settings();
    settings.behavior.barge_in = false;
    let session = session_with(settings, Arc::new(ScriptedDispatcher { blocks: vec![] }));

    let (engine, interrupts, _eos) = CountingEngine::new();
    session.start_with_engine(Box::new(engine)).await.unwrap();

    let (tx, rx) = create_audio_stream(16);
    session.queue().enqueue(TtsStream {
        sample_rate: 24000,
        chunks: rx,
        cancel: CancellationToken::new(),
    });
    for i in 0..30 {
        tx.send(Ok(AudioChunk {
            data: Bytes::from(vec![20u8; 960]),
            index: i,
            is_final: false,
        }))
        .await
        .unwrap();
    }
    assert!(wait_for_state(&session, SessionState::Speaking, Duration::from_secs(2)).await);

    for _ in 0..5 {
        session.handle_frame(7, &frame_48k(12000)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.state(), SessionState::Speaking);
    assert_eq!(interrupts.load(Ordering::SeqCst), 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn allowed_users_filter() {
    let mut settings = test_settings();
    settings.behavior.allowed_users = vec![1];
    let session = session_with(settings, Arc::new(ScriptedDispatcher { blocks: vec![] }));

    let (engine, _interrupts, eos) = CountingEngine::new();
    session.start_with_engine(Box::new(engine)).await.unwrap();

    // A stranger speaks and goes silent: nothing should reach the engine.
    for _ in 0..10 {
        session.handle_frame(99, &frame_48k(4000)).await;
    }
    feed_silence(&session, 99, 8).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(eos.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Listening);

    // The allowed user is heard.
    for _ in 0..10 {
        session.handle_frame(1, &frame_48k(4000)).await;
    }
    feed_silence(&session, 1, 8).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(eos.load(Ordering::SeqCst), 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn echo_rejection_during_playback() {
    // While the bot plays loud audio, a muted loopback frame must not
    // reach the VAD/engine, but a much louder user must.
    let session = session_with(test_settings(), Arc::new(ScriptedDispatcher { blocks: vec![] }));

    let (engine, interrupts, _eos) = CountingEngine::new();
    session.start_with_engine(Box::new(engine)).await.unwrap();

    // Loud outbound audio (~8000 RMS after the int16 samples 0x1f1f).
    let (tx, rx) = create_audio_stream(16);
    session.queue().enqueue(TtsStream {
        sample_rate: 24000,
        chunks: rx,
        cancel: CancellationToken::new(),
    });
    for i in 0..40 {
        tx.send(Ok(AudioChunk {
            data: Bytes::from(vec![0x1fu8; 960]),
            index: i,
            is_final: false,
        }))
        .await
        .unwrap();
    }
    assert!(wait_for_state(&session, SessionState::Speaking, Duration::from_secs(2)).await);

    // Loopback at ~20% of outbound: suppressed, no barge-in.
    for _ in 0..5 {
        session.handle_frame(7, &frame_48k(1600)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(interrupts.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Speaking);

    // A user at ~2x outbound gets through and interrupts.
    for _ in 0..5 {
        session.handle_frame(7, &frame_48k(16000)).await;
    }
    assert!(wait_for_state(&session, SessionState::Listening, Duration::from_secs(1)).await);
    assert_eq!(interrupts.load(Ordering::SeqCst), 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn speak_requires_started_session() {
    let session = session_with(test_settings(), Arc::new(ScriptedDispatcher { blocks: vec![] }));
    assert!(session.speak("hello").await.is_err());
}
