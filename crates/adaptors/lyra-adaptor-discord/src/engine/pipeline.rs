//! Pipeline engine: STT -> agent -> sentence-split -> TTS
//!
//! The latency trick is sentence pipelining: each complete sentence from
//! the agent's token stream is handed to TTS and enqueued immediately, so
//! the first sentence is playing while the model is still generating the
//! rest of the reply.

use crate::agent::AgentBridge;
use crate::audio::{pcm_to_bytes, PROCESSING_SAMPLE_RATE};
use crate::engine::sentence::SentenceSplitter;
use crate::engine::{ConversationEngine, EngineEvent, EngineMode};
use crate::playback::PlaybackQueue;
use async_trait::async_trait;
use lyra_core::{ConversationLog, ConversationTurn, LyraError, ReplyReader, Result};
use lyra_provider_voice::{AudioData, SttEngine, SttStream, TtsEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sentences longer than this are truncated before synthesis
pub const TTS_MAX_CHARS: usize = 4000;

/// How long to wait for a streaming STT final after end-of-speech
const STREAMING_FINAL_TIMEOUT: Duration = Duration::from_secs(10);

struct PipelineInner {
    stt: Arc<dyn SttEngine>,
    stt_fallback: Option<Arc<dyn SttEngine>>,
    tts: Arc<dyn TtsEngine>,
    tts_fallback: Option<Arc<dyn TtsEngine>>,
    bridge: Arc<AgentBridge>,
    queue: Arc<PlaybackQueue>,
    conversation: parking_lot::Mutex<ConversationLog>,
    events: mpsc::Sender<EngineEvent>,
    /// One utterance at a time; end-of-speech during processing is dropped
    is_processing: AtomicBool,
    /// Barge-in flag; suppresses sentence and chunk emissions
    interrupted: AtomicBool,
    stopped: AtomicBool,
    /// Per-user accumulated utterance audio (batch STT and stream fallback)
    capture: parking_lot::Mutex<HashMap<u64, Vec<i16>>>,
    /// Per-user live streaming STT sessions
    streams: tokio::sync::Mutex<HashMap<u64, SttStream>>,
    /// Utterance cap in samples
    max_capture_samples: usize,
    cancel: CancellationToken,
}

/// STT -> agent -> TTS engine
pub struct PipelineEngine {
    inner: Arc<PipelineInner>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl PipelineEngine {
    /// Build a pipeline engine over resolved providers
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Arc<dyn SttEngine>,
        stt_fallback: Option<Arc<dyn SttEngine>>,
        tts: Arc<dyn TtsEngine>,
        tts_fallback: Option<Arc<dyn TtsEngine>>,
        bridge: Arc<AgentBridge>,
        queue: Arc<PlaybackQueue>,
        max_conversation_turns: usize,
        max_recording_ms: u64,
    ) -> Self {
        let (events, events_rx) = mpsc::channel(128);
        Self {
            inner: Arc::new(PipelineInner {
                stt,
                stt_fallback,
                tts,
                tts_fallback,
                bridge,
                queue,
                conversation: parking_lot::Mutex::new(ConversationLog::new(max_conversation_turns)),
                events,
                is_processing: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                capture: parking_lot::Mutex::new(HashMap::new()),
                streams: tokio::sync::Mutex::new(HashMap::new()),
                max_capture_samples: (max_recording_ms as usize)
                    * PROCESSING_SAMPLE_RATE as usize
                    / 1000,
                cancel: CancellationToken::new(),
            }),
            events_rx: Some(events_rx),
        }
    }
}

impl PipelineInner {
    /// Resolve one utterance to text: streaming final first, then batch
    /// primary, then batch fallback
    async fn transcribe(
        &self,
        user_id: u64,
        stream: Option<SttStream>,
        samples: &[i16],
    ) -> Result<String> {
        if let Some(mut stream) = stream {
            if stream.finish().await.is_ok() {
                loop {
                    match tokio::time::timeout(STREAMING_FINAL_TIMEOUT, stream.events.recv()).await
                    {
                        Ok(Some(Ok(event))) => {
                            if event.is_final {
                                stream.cancel();
                                if !event.text.trim().is_empty() {
                                    return Ok(event.text);
                                }
                                break;
                            }
                        }
                        Ok(Some(Err(e))) => {
                            warn!(user_id = %user_id, error = %e, "Streaming STT failed, trying batch");
                            break;
                        }
                        Ok(None) | Err(_) => {
                            warn!(user_id = %user_id, "Streaming STT produced no final, trying batch");
                            break;
                        }
                    }
                }
            }
            stream.cancel();
        }

        if samples.is_empty() {
            return Ok(String::new());
        }

        let audio = AudioData::new(
            bytes::Bytes::from(pcm_to_bytes(samples)),
            PROCESSING_SAMPLE_RATE,
            1,
        );

        let mut last_error: Option<LyraError> = None;
        for engine in std::iter::once(&self.stt).chain(self.stt_fallback.iter()) {
            match engine.transcribe(&audio).await {
                Ok(result) => return Ok(result.text),
                Err(e) => {
                    warn!(engine = %engine.name(), error = %e, "Batch STT failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LyraError::provider("no STT engine configured")))
    }

    /// Truncate, synthesize and enqueue one sentence
    async fn speak_sentence(&self, sentence: &str) {
        if self.interrupted.load(Ordering::SeqCst) {
            return;
        }

        let text: String = if sentence.len() > TTS_MAX_CHARS {
            sentence.chars().take(TTS_MAX_CHARS).collect()
        } else {
            sentence.to_string()
        };

        for engine in std::iter::once(&self.tts).chain(self.tts_fallback.iter()) {
            match engine.synthesize_stream(&text).await {
                Ok(stream) => {
                    if self.interrupted.load(Ordering::SeqCst) {
                        stream.cancel();
                        return;
                    }
                    self.queue.enqueue(stream);
                    return;
                }
                Err(e) => {
                    warn!(engine = %engine.name(), error = %e, "TTS synthesis failed");
                }
            }
        }

        let _ = self
            .events
            .send(EngineEvent::Error {
                message: "All TTS engines failed for a sentence".to_string(),
                fatal: false,
            })
            .await;
    }

    /// Run one utterance through the agent and the TTS queue
    async fn process_utterance(self: Arc<Self>, user_id: u64, text: String) {
        self.interrupted.store(false, Ordering::SeqCst);
        self.conversation.lock().push_user(user_id, None, text.clone());
        let _ = self
            .events
            .send(EngineEvent::TranscriptIn {
                user_id,
                text: text.clone(),
            })
            .await;

        let history = self.conversation.lock().snapshot();
        let stream = match self.bridge.stream_response(user_id, None, &text, history).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Agent dispatch failed");
                let _ = self
                    .events
                    .send(EngineEvent::Error {
                        message: format!("Agent dispatch failed: {}", e),
                        fatal: false,
                    })
                    .await;
                self.is_processing.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut reader = ReplyReader::new(stream);
        let mut splitter = SentenceSplitter::new();

        while let Some(block) = reader.next_block().await {
            if self.interrupted.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                break;
            }
            match block {
                Ok(block) => {
                    for sentence in splitter.push(&block) {
                        self.speak_sentence(&sentence).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Agent stream error");
                    break;
                }
            }
        }

        if !self.interrupted.load(Ordering::SeqCst) {
            if let Some(residual) = splitter.flush() {
                self.speak_sentence(&residual).await;
            }
        }

        // A barge-in mid-reply still leaves the partial turn on record.
        let reply = reader.into_reply();
        if !reply.trim().is_empty() {
            self.conversation.lock().push_assistant(reply.clone());
            let _ = self
                .events
                .send(EngineEvent::AssistantText { text: reply })
                .await;
        }

        if !self.interrupted.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            // The turn ends when every queued sentence has played out.
            self.queue.wait_idle().await;
            let _ = self.events.send(EngineEvent::TurnEnd).await;
        }

        self.is_processing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationEngine for PipelineEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Pipeline
    }

    async fn start(&mut self) -> Result<()> {
        info!(stt = %self.inner.stt.name(), tts = %self.inner.tts.name(), "Pipeline engine started");
        Ok(())
    }

    async fn feed_audio(&self, user_id: u64, pcm: &[i16]) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut capture = self.inner.capture.lock();
            let buffer = capture.entry(user_id).or_default();
            // Cap the utterance; further audio is dropped until EOS.
            let room = self.inner.max_capture_samples.saturating_sub(buffer.len());
            if room > 0 {
                buffer.extend_from_slice(&pcm[..pcm.len().min(room)]);
            }
        }

        if self.inner.stt.supports_streaming() {
            let mut streams = self.inner.streams.lock().await;
            if !streams.contains_key(&user_id) {
                match self.inner.stt.open_stream(PROCESSING_SAMPLE_RATE).await {
                    Ok(stream) => {
                        streams.insert(user_id, stream);
                    }
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "STT stream open failed, batch path will be used");
                        return Ok(());
                    }
                }
            }
            if let Some(stream) = streams.get(&user_id) {
                if let Err(e) = stream
                    .send_audio(bytes::Bytes::from(pcm_to_bytes(pcm)))
                    .await
                {
                    debug!(user_id = %user_id, error = %e, "STT stream send failed");
                    if let Some(stream) = streams.remove(&user_id) {
                        stream.cancel();
                    }
                }
            }
        }

        Ok(())
    }

    async fn end_of_speech(&self, user_id: u64) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let samples = self.inner.capture.lock().remove(&user_id).unwrap_or_default();
        let stream = self.inner.streams.lock().await.remove(&user_id);

        // Single-speaker assumption: a second utterance finishing while
        // one is processing is dropped.
        if self.inner.is_processing.swap(true, Ordering::SeqCst) {
            debug!(user_id = %user_id, "Discarding utterance, already processing");
            if let Some(stream) = stream {
                stream.cancel();
            }
            return Ok(());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let text = match inner.transcribe(user_id, stream, &samples).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Transcription failed");
                    let _ = inner
                        .events
                        .send(EngineEvent::Error {
                            message: format!("Transcription failed: {}", e),
                            fatal: false,
                        })
                        .await;
                    inner.is_processing.store(false, Ordering::SeqCst);
                    return;
                }
            };

            if text.trim().is_empty() {
                debug!(user_id = %user_id, "Empty transcript, skipping");
                inner.is_processing.store(false, Ordering::SeqCst);
                return;
            }

            info!(user_id = %user_id, text = %text, "User utterance transcribed");
            inner.process_utterance(user_id, text).await;
        });

        Ok(())
    }

    async fn inject_text(&self, text: &str) -> Result<()> {
        self.inner.conversation.lock().push_assistant(text);
        self.inner.speak_sentence(text).await;
        Ok(())
    }

    fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    async fn stop(&mut self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let mut streams = self.inner.streams.lock().await;
        for (_, stream) in streams.drain() {
            stream.cancel();
        }
        info!("Pipeline engine stopped");
        Ok(())
    }

    fn history(&self) -> Vec<ConversationTurn> {
        self.inner.conversation.lock().snapshot()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentDispatcher, DispatchContext};
    use crate::echo::EchoSuppressor;
    use crate::sender::{AudioSender, NullSink};
    use lyra_core::{create_text_stream, TextChunk, TextStream};
    use lyra_provider_voice::{
        create_audio_stream, AudioChunk, TranscriptionResult, TtsStream,
    };
    use parking_lot::Mutex;
    use std::time::Duration;

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

    struct FailingStt;

    #[async_trait]
    impl SttEngine for FailingStt {
        fn name(&self) -> &str {
            "failing"
        }
        async fn transcribe(&self, _audio: &AudioData) -> Result<TranscriptionResult> {
            Err(LyraError::provider("stt down"))
        }
    }

    /// TTS that emits one small chunk per request and records inputs
    struct RecordingTts {
        texts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TtsEngine for RecordingTts {
        fn name(&self) -> &str {
            "recording"
        }
        async fn synthesize_stream(&self, text: &str) -> Result<TtsStream> {
            self.texts.lock().push(text.to_string());
            let (tx, rx) = create_audio_stream(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(AudioChunk {
                        data: bytes::Bytes::from(vec![0u8; 640]),
                        index: 0,
                        is_final: false,
                    }))
                    .await;
                let _ = tx
                    .send(Ok(AudioChunk {
                        data: bytes::Bytes::new(),
                        index: 1,
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

    fn engine_with(
        stt: Arc<dyn SttEngine>,
        stt_fallback: Option<Arc<dyn SttEngine>>,
        blocks: Vec<String>,
    ) -> (PipelineEngine, Arc<Mutex<Vec<String>>>) {
        let sender = Arc::new(AudioSender::new(Arc::new(NullSink)));
        let echo = Arc::new(EchoSuppressor::new(false));
        let (queue, _events) = PlaybackQueue::new(sender, echo);
        let texts = Arc::new(Mutex::new(Vec::new()));
        let tts = Arc::new(RecordingTts {
            texts: texts.clone(),
        });
        let bridge = Arc::new(AgentBridge::new(
            Arc::new(ScriptedDispatcher { blocks }),
            None,
        ));
        let engine = PipelineEngine::new(
            stt,
            stt_fallback,
            tts,
            None,
            bridge,
            Arc::new(queue),
            50,
            60_000,
        );
        (engine, texts)
    }

    #[tokio::test]
    async fn test_round_trip_sentence_pipelining() {
        let (mut engine, texts) = engine_with(
            Arc::new(FixedStt {
                text: "What time is it?".to_string(),
            }),
            None,
            vec![
                "It is noon. ".to_string(),
                "Let me know if you need more.".to_string(),
            ],
        );
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        engine.feed_audio(1, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(1).await.unwrap();

        // Wait for the turn to complete.
        let mut saw_transcript = false;
        let mut saw_turn_end = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline && !saw_turn_end {
            match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                Ok(Some(EngineEvent::TranscriptIn { user_id, text })) => {
                    assert_eq!(user_id, 1);
                    assert_eq!(text, "What time is it?");
                    saw_transcript = true;
                }
                Ok(Some(EngineEvent::TurnEnd)) => saw_turn_end = true,
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_transcript);
        assert!(saw_turn_end);

        // Two sentences, two TTS submissions, in order.
        let recorded = texts.lock().clone();
        assert_eq!(
            recorded,
            vec!["It is noon.", "Let me know if you need more."]
        );

        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "What time is it?");
        assert_eq!(
            history[1].content,
            "It is noon. Let me know if you need more."
        );
    }

    #[tokio::test]
    async fn test_stt_fallback() {
        let (mut engine, _texts) = engine_with(
            Arc::new(FailingStt),
            Some(Arc::new(FixedStt {
                text: "fallback heard me".to_string(),
            })),
            vec!["Ok.".to_string()],
        );
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        engine.feed_audio(1, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(1).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::TranscriptIn { text, .. } => assert_eq!(text, "fallback heard me"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overlapping_eos_discarded() {
        let (mut engine, _texts) = engine_with(
            Arc::new(FixedStt {
                text: "hello".to_string(),
            }),
            None,
            vec!["Hi. ".to_string()],
        );
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        engine.feed_audio(1, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(1).await.unwrap();
        // Second EOS lands while the first is processing.
        engine.feed_audio(2, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(2).await.unwrap();

        let mut transcripts = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
                Ok(Some(EngineEvent::TranscriptIn { .. })) => transcripts += 1,
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert_eq!(transcripts, 1);
    }

    #[tokio::test]
    async fn test_interrupt_suppresses_sentences() {
        let (mut engine, texts) = engine_with(
            Arc::new(FixedStt {
                text: "tell me a story".to_string(),
            }),
            None,
            vec!["One. ".to_string()],
        );
        engine.start().await.unwrap();
        let _events = engine.take_events().unwrap();

        // Interrupted before the utterance even starts: no synthesis.
        engine.interrupt();
        engine.interrupt(); // idempotent

        // interrupt() only gates the in-flight turn; a new utterance
        // clears it.
        engine.feed_audio(1, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(texts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_transcript_skipped() {
        let (mut engine, texts) = engine_with(
            Arc::new(FixedStt {
                text: "   ".to_string(),
            }),
            None,
            vec!["Should not be spoken.".to_string()],
        );
        engine.start().await.unwrap();
        engine.feed_audio(1, &[100i16; 320]).await.unwrap();
        engine.end_of_speech(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(texts.lock().is_empty());
    }
}
