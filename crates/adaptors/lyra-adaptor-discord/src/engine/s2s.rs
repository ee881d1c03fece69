//! Speech-to-speech engine
//!
//! Wraps a native provider session (OpenAI Realtime or Gemini Live)
//! behind the common engine contract: user PCM is forwarded continuously,
//! provider events are demultiplexed into engine events, provider audio
//! flows through the playback queue, and provider tool calls are bridged
//! through the shared registry.

use crate::agent::AgentBridge;
use crate::audio::resample;
use crate::engine::{ConversationEngine, EngineEvent, EngineMode};
use crate::playback::PlaybackQueue;
use async_trait::async_trait;
use lyra_core::{ConversationLog, ConversationTurn, Result};
use lyra_provider_voice::{
    create_audio_stream, AudioChunk, AudioStreamSender, S2sEvent, S2sSession, TtsStream,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::PROCESSING_SAMPLE_RATE;

struct S2sInner {
    session: Arc<dyn S2sSession>,
    bridge: Arc<AgentBridge>,
    queue: Arc<PlaybackQueue>,
    conversation: Arc<parking_lot::Mutex<ConversationLog>>,
    events: mpsc::Sender<EngineEvent>,
    stopped: AtomicBool,
    /// The user whose audio most recently reached the provider; input
    /// transcripts are attributed to them
    last_user: AtomicU64,
    /// Assistant transcript deltas accumulated for the history turn
    assistant_partial: parking_lot::Mutex<String>,
    /// Chunk sender for the in-flight provider audio turn
    live_audio: parking_lot::Mutex<Option<AudioStreamSender>>,
    cancel: CancellationToken,
}

/// Engine over a native speech-to-speech provider session
pub struct S2sEngine {
    inner: Arc<S2sInner>,
    provider_events: Option<mpsc::Receiver<S2sEvent>>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl S2sEngine {
    /// Wrap a connected provider session
    pub fn new(
        session: Arc<dyn S2sSession>,
        provider_events: mpsc::Receiver<S2sEvent>,
        bridge: Arc<AgentBridge>,
        queue: Arc<PlaybackQueue>,
        conversation: Arc<parking_lot::Mutex<ConversationLog>>,
    ) -> Self {
        let (events, events_rx) = mpsc::channel(128);
        Self {
            inner: Arc::new(S2sInner {
                session,
                bridge,
                queue,
                conversation,
                events,
                stopped: AtomicBool::new(false),
                last_user: AtomicU64::new(0),
                assistant_partial: parking_lot::Mutex::new(String::new()),
                live_audio: parking_lot::Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            provider_events: Some(provider_events),
            events_rx: Some(events_rx),
        }
    }
}

impl S2sInner {
    /// Push one provider audio delta into the playback queue, opening a
    /// live entry on the first delta of a turn
    fn push_audio(&self, pcm: bytes::Bytes, sample_rate: u32) {
        let tx = {
            let mut live = self.live_audio.lock();
            if live.is_none() {
                let (tx, rx) = create_audio_stream(256);
                self.queue.enqueue(TtsStream {
                    sample_rate,
                    chunks: rx,
                    cancel: CancellationToken::new(),
                });
                *live = Some(tx);
            }
            live.as_ref().expect("just set").clone()
        };

        if tx
            .try_send(Ok(AudioChunk {
                data: pcm,
                index: 0,
                is_final: false,
            }))
            .is_err()
        {
            debug!("Live audio entry gone, dropping provider delta");
            self.live_audio.lock().take();
        }
    }

    /// Close the in-flight live audio entry, if any
    fn finish_live_audio(&self) {
        if let Some(tx) = self.live_audio.lock().take() {
            let _ = tx.try_send(Ok(AudioChunk {
                data: bytes::Bytes::new(),
                index: usize::MAX,
                is_final: true,
            }));
        }
    }

    /// Main demultiplexer over provider events
    async fn pump(self: Arc<Self>, mut provider_events: mpsc::Receiver<S2sEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = provider_events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                S2sEvent::AudioDelta { pcm, sample_rate } => {
                    self.push_audio(pcm, sample_rate);
                }
                S2sEvent::AssistantTranscriptDelta { text } => {
                    self.assistant_partial.lock().push_str(&text);
                    let _ = self.events.send(EngineEvent::AssistantText { text }).await;
                }
                S2sEvent::InputTranscript { text } => {
                    let user_id = self.last_user.load(Ordering::SeqCst);
                    self.conversation.lock().push_user(user_id, None, text.clone());
                    let _ = self
                        .events
                        .send(EngineEvent::TranscriptIn { user_id, text })
                        .await;
                }
                S2sEvent::ToolCall(call) => {
                    // Executed off the pump so a slow tool cannot stall
                    // audio. Failures become {"error"} results.
                    let inner = self.clone();
                    tokio::spawn(async move {
                        info!(tool = %call.name, call_id = %call.call_id, "Bridging provider tool call");
                        let result = inner.bridge.execute_tool(&call.name, call.arguments).await;
                        if let Err(e) = inner.session.send_tool_result(&call.call_id, result).await {
                            warn!(call_id = %call.call_id, error = %e, "Failed to return tool result");
                        }
                    });
                }
                S2sEvent::Interrupted => {
                    self.finish_live_audio();
                    let _ = self.events.send(EngineEvent::Interrupted).await;
                }
                S2sEvent::TurnComplete => {
                    self.finish_live_audio();
                    let reply = std::mem::take(&mut *self.assistant_partial.lock());
                    if !reply.trim().is_empty() {
                        self.conversation.lock().push_assistant(reply);
                    }
                    // The turn ends for the session once playback drains.
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.queue.wait_idle().await;
                        let _ = inner.events.send(EngineEvent::TurnEnd).await;
                    });
                }
                S2sEvent::Closed { rotating } => {
                    if rotating {
                        debug!("Provider socket retired by rotation");
                    } else if !self.stopped.load(Ordering::SeqCst) {
                        let _ = self
                            .events
                            .send(EngineEvent::Error {
                                message: "Speech-to-speech socket closed unexpectedly".to_string(),
                                fatal: true,
                            })
                            .await;
                        return;
                    }
                }
                S2sEvent::Error { message } => {
                    warn!(error = %message, "Provider error event");
                    let _ = self
                        .events
                        .send(EngineEvent::Error {
                            message,
                            fatal: false,
                        })
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl ConversationEngine for S2sEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::SpeechToSpeech
    }

    async fn start(&mut self) -> Result<()> {
        let provider_events = self
            .provider_events
            .take()
            .ok_or_else(|| lyra_core::LyraError::engine("S2S engine already started"))?;
        info!(provider = %self.inner.session.provider(), "Speech-to-speech engine started");
        tokio::spawn(self.inner.clone().pump(provider_events));
        Ok(())
    }

    async fn feed_audio(&self, user_id: u64, pcm: &[i16]) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.last_user.store(user_id, Ordering::SeqCst);

        let target_rate = self.inner.session.input_sample_rate();
        let pcm = resample(pcm, PROCESSING_SAMPLE_RATE, target_rate);
        self.inner.session.send_audio(&pcm).await
    }

    async fn end_of_speech(&self, _user_id: u64) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.session.end_of_speech().await
    }

    async fn inject_text(&self, text: &str) -> Result<()> {
        self.inner.session.inject_text(text).await
    }

    fn interrupt(&self) {
        let inner = self.inner.clone();
        inner.finish_live_audio();
        // response.cancel is issued only while the provider tracks an
        // in-flight response, so repeated calls are harmless.
        tokio::spawn(async move {
            if let Err(e) = inner.session.cancel_response().await {
                debug!(error = %e, "cancel_response failed");
            }
        });
    }

    async fn stop(&mut self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.finish_live_audio();
        if let Err(e) = self.inner.session.close().await {
            debug!(error = %e, "Provider session close failed");
        }
        info!("Speech-to-speech engine stopped");
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
    use lyra_core::{create_text_stream, create_tool_definition, TextStream, ToolHandler};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct NoopDispatcher;

    #[async_trait]
    impl AgentDispatcher for NoopDispatcher {
        async fn dispatch(&self, _ctx: DispatchContext) -> Result<TextStream> {
            let (_tx, rx) = create_text_stream(1);
            Ok(rx)
        }
    }

    /// Scripted provider session capturing everything sent to it
    struct MockSession {
        sent_audio: Mutex<Vec<usize>>,
        tool_results: Mutex<Vec<(String, serde_json::Value)>>,
        cancels: std::sync::atomic::AtomicUsize,
        input_rate: u32,
    }

    impl MockSession {
        fn new(input_rate: u32) -> Self {
            Self {
                sent_audio: Mutex::new(Vec::new()),
                tool_results: Mutex::new(Vec::new()),
                cancels: std::sync::atomic::AtomicUsize::new(0),
                input_rate,
            }
        }
    }

    #[async_trait]
    impl S2sSession for MockSession {
        fn provider(&self) -> &str {
            "mock"
        }
        fn input_sample_rate(&self) -> u32 {
            self.input_rate
        }
        fn output_sample_rate(&self) -> u32 {
            24000
        }
        async fn send_audio(&self, pcm: &[i16]) -> Result<()> {
            self.sent_audio.lock().push(pcm.len());
            Ok(())
        }
        async fn end_of_speech(&self) -> Result<()> {
            Ok(())
        }
        async fn inject_text(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn send_tool_result(&self, call_id: &str, payload: serde_json::Value) -> Result<()> {
            self.tool_results.lock().push((call_id.to_string(), payload));
            Ok(())
        }
        async fn cancel_response(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn build_engine(
        session: Arc<MockSession>,
    ) -> (S2sEngine, mpsc::Sender<S2sEvent>, Arc<AgentBridge>) {
        let (provider_tx, provider_rx) = mpsc::channel(64);
        let sender = Arc::new(AudioSender::new(Arc::new(NullSink)));
        let echo = Arc::new(EchoSuppressor::new(false));
        let (queue, _queue_events) = PlaybackQueue::new(sender, echo);
        let bridge = Arc::new(AgentBridge::new(Arc::new(NoopDispatcher), None));
        let conversation = Arc::new(parking_lot::Mutex::new(ConversationLog::new(50)));
        let engine = S2sEngine::new(
            session,
            provider_rx,
            bridge.clone(),
            Arc::new(queue),
            conversation,
        );
        (engine, provider_tx, bridge)
    }

    #[tokio::test]
    async fn test_audio_resampled_to_provider_rate() {
        let session = Arc::new(MockSession::new(24000));
        let (mut engine, _tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();

        // 320 samples at 16 kHz -> 480 at 24 kHz.
        engine.feed_audio(7, &[0i16; 320]).await.unwrap();
        assert_eq!(session.sent_audio.lock().as_slice(), &[480]);
    }

    #[tokio::test]
    async fn test_tool_call_bridging() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, provider_tx, bridge) = build_engine(session.clone());

        let handler: ToolHandler = Arc::new(|args| {
            Box::pin(async move { Ok(serde_json::json!({ "echoed": args })) })
        });
        bridge
            .register_tool(
                create_tool_definition("discord_voice", "Voice control", serde_json::json!({"type": "object"})),
                handler,
            )
            .await;

        engine.start().await.unwrap();

        provider_tx
            .send(S2sEvent::ToolCall(lyra_core::ToolCall {
                call_id: "call-9".to_string(),
                name: "discord_voice".to_string(),
                arguments: serde_json::json!({ "action": "status", "guildId": "G" }),
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let results = session.tool_results.lock().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "call-9");
        assert_eq!(results[0].1["echoed"]["action"], "status");
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_error_payload() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, provider_tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();

        provider_tx
            .send(S2sEvent::ToolCall(lyra_core::ToolCall {
                call_id: "call-1".to_string(),
                name: "missing_tool".to_string(),
                arguments: serde_json::json!({}),
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let results = session.tool_results.lock().clone();
        assert_eq!(results.len(), 1);
        assert!(results[0].1["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_transcripts_build_history() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, provider_tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        engine.feed_audio(42, &[0i16; 320]).await.unwrap();
        provider_tx
            .send(S2sEvent::InputTranscript {
                text: "what time is it".to_string(),
            })
            .await
            .unwrap();
        provider_tx
            .send(S2sEvent::AssistantTranscriptDelta {
                text: "It is ".to_string(),
            })
            .await
            .unwrap();
        provider_tx
            .send(S2sEvent::AssistantTranscriptDelta {
                text: "noon.".to_string(),
            })
            .await
            .unwrap();
        provider_tx.send(S2sEvent::TurnComplete).await.unwrap();

        let mut saw_transcript = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
                Ok(Some(EngineEvent::TranscriptIn { user_id, text })) => {
                    assert_eq!(user_id, 42);
                    assert_eq!(text, "what time is it");
                    saw_transcript = true;
                }
                Ok(Some(EngineEvent::TurnEnd)) => break,
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_transcript);

        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "what time is it");
        assert_eq!(history[1].content, "It is noon.");
    }

    #[tokio::test]
    async fn test_unplanned_close_is_fatal() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, provider_tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        provider_tx
            .send(S2sEvent::Closed { rotating: false })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::Error { fatal, .. } => assert!(fatal),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rotation_close_is_silent() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, provider_tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();
        let mut events = engine.take_events().unwrap();

        provider_tx
            .send(S2sEvent::Closed { rotating: true })
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(result.is_err(), "rotation close must not produce events");
    }

    #[tokio::test]
    async fn test_interrupt_cancels_response() {
        let session = Arc::new(MockSession::new(16000));
        let (mut engine, _tx, _bridge) = build_engine(session.clone());
        engine.start().await.unwrap();

        engine.interrupt();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.cancels.load(Ordering::SeqCst), 1);
    }
}
