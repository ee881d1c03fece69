//! Per-guild voice session
//!
//! Owns the whole audio plane for one guild: per-user VADs created lazily
//! on first frame, the echo gate ahead of both VAD and engine, the
//! playback queue and sender, and the state machine driving barge-in.
//!
//! State machine:
//!
//! | From       | Event                                | To         |
//! |------------|--------------------------------------|------------|
//! | idle       | start succeeds                       | listening  |
//! | listening  | VAD speech-end / transcript-in       | processing |
//! | processing | first playback audio                 | speaking   |
//! | speaking   | engine turn-end                      | listening  |
//! | speaking   | user speech-start with barge-in      | listening  |
//! | any        | stop                                 | idle       |

use crate::agent::{AgentBridge, AgentDispatcher};
use crate::audio::to_processing_format;
use crate::echo::EchoSuppressor;
use crate::engine::{create_engine, ConversationEngine, EngineEvent, EngineMode};
use crate::playback::{PlaybackEvent, PlaybackQueue};
use crate::sender::{AudioSender, AudioSink};
use crate::settings::VoiceSettings;
use crate::vad::{VadEvent, VoiceDetector};
use lyra_core::{ConversationTurn, LyraError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started or stopped
    Idle,
    /// Waiting for user speech
    Listening,
    /// An utterance is in flight through the engine
    Processing,
    /// Bot audio is playing
    Speaking,
}

impl SessionState {
    /// State as a wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

/// Events the session surfaces to the manager
#[derive(Debug)]
pub enum SessionEvent {
    /// Session-fatal failure; the session is stopping itself
    Fatal {
        /// Failure description
        message: String,
    },
}

/// Immutable per-session context
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Guild this session serves
    pub guild_id: u64,
    /// Voice channel joined
    pub channel_id: u64,
    /// Resolved configuration
    pub settings: VoiceSettings,
}

/// One guild's real-time voice session
pub struct VoiceSession {
    ctx: SessionContext,
    engine: Mutex<Option<Box<dyn ConversationEngine>>>,
    mode: parking_lot::Mutex<Option<EngineMode>>,
    vads: parking_lot::Mutex<HashMap<u64, VoiceDetector>>,
    echo: Arc<EchoSuppressor>,
    queue: Arc<PlaybackQueue>,
    sender: Arc<AudioSender>,
    bridge: Arc<AgentBridge>,
    state: watch::Sender<SessionState>,
    queue_events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PlaybackEvent>>>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    session_events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    last_activity: parking_lot::Mutex<Instant>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    /// Back-reference for spawning tasks that hold the session alive
    weak: Weak<VoiceSession>,
}

impl VoiceSession {
    /// Build a session around a transport sink and the host dispatcher
    pub fn new(
        ctx: SessionContext,
        sink: Arc<dyn AudioSink>,
        dispatcher: Arc<dyn AgentDispatcher>,
    ) -> Arc<Self> {
        let echo = Arc::new(EchoSuppressor::new(ctx.settings.behavior.echo_suppression));
        let sender = Arc::new(AudioSender::new(sink));
        let (queue, queue_events) = PlaybackQueue::new(sender.clone(), echo.clone());
        let bridge = Arc::new(AgentBridge::new(
            dispatcher,
            ctx.settings.behavior.system_prompt.clone(),
        ));
        let (state, _) = watch::channel(SessionState::Idle);
        let (session_events, session_events_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak| Self {
            ctx,
            engine: Mutex::new(None),
            mode: parking_lot::Mutex::new(None),
            vads: parking_lot::Mutex::new(HashMap::new()),
            echo,
            queue: Arc::new(queue),
            sender,
            bridge,
            state,
            queue_events: parking_lot::Mutex::new(Some(queue_events)),
            session_events,
            session_events_rx: parking_lot::Mutex::new(Some(session_events_rx)),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    /// Start with an engine resolved from configuration
    pub async fn start(&self) -> Result<()> {
        let engine = create_engine(&self.ctx.settings, self.bridge.clone(), self.queue.clone())
            .await?;
        self.start_with_engine(engine).await
    }

    /// Start with a pre-built engine (tests, custom wiring)
    pub async fn start_with_engine(
        &self,
        mut engine: Box<dyn ConversationEngine>,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LyraError::session("session already stopped"));
        }

        engine.start().await?;
        let mode = engine.mode();
        *self.mode.lock() = Some(mode);

        let engine_events = engine
            .take_events()
            .ok_or_else(|| LyraError::engine("engine events already taken"))?;
        let queue_events = self
            .queue_events
            .lock()
            .take()
            .ok_or_else(|| LyraError::session("session already started"))?;

        *self.engine.lock().await = Some(engine);
        self.set_state(SessionState::Listening);
        info!(
            guild_id = %self.ctx.guild_id,
            channel_id = %self.ctx.channel_id,
            mode = %mode.as_str(),
            "Voice session started"
        );

        let session = self
            .weak
            .upgrade()
            .ok_or_else(|| LyraError::session("session dropped during start"))?;
        tokio::spawn(session.event_loop(engine_events, queue_events));
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Engine mode once started
    pub fn mode(&self) -> Option<EngineMode> {
        *self.mode.lock()
    }

    /// Guild this session serves
    pub fn guild_id(&self) -> u64 {
        self.ctx.guild_id
    }

    /// Channel this session joined
    pub fn channel_id(&self) -> u64 {
        self.ctx.channel_id
    }

    /// The agent bridge (tool registration happens before start)
    pub fn bridge(&self) -> Arc<AgentBridge> {
        self.bridge.clone()
    }

    /// The playback queue, for wiring a custom-built engine
    pub fn queue(&self) -> Arc<PlaybackQueue> {
        self.queue.clone()
    }

    /// Take the manager-facing event receiver; available exactly once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.session_events_rx.lock().take()
    }

    /// Whether no audio has arrived for `timeout`
    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }

    fn set_state(&self, next: SessionState) {
        let prev = *self.state.borrow();
        if prev != next {
            debug!(guild_id = %self.ctx.guild_id, from = %prev.as_str(), to = %next.as_str(), "Session state");
            let _ = self.state.send(next);
        }
    }

    /// Ingest one decoded 48 kHz stereo frame for a user
    pub async fn handle_frame(&self, user_id: u64, pcm_48k_stereo: &[i16]) {
        if self.stopped.load(Ordering::SeqCst) || pcm_48k_stereo.is_empty() {
            return;
        }

        let allowed = &self.ctx.settings.behavior.allowed_users;
        if !allowed.is_empty() && !allowed.contains(&user_id) {
            return;
        }

        let pcm = to_processing_format(pcm_48k_stereo);
        if self.echo.should_drop(&pcm) {
            return;
        }

        *self.last_activity.lock() = Instant::now();

        // VAD sees the frame first; it is created lazily per user.
        let vad_events = {
            let mut vads = self.vads.lock();
            let vad = vads
                .entry(user_id)
                .or_insert_with(|| VoiceDetector::new(self.ctx.settings.vad.clone()));
            vad.process(&pcm)
        };

        for event in vad_events {
            match event {
                VadEvent::SpeechStart => self.on_speech_start(user_id).await,
                VadEvent::SpeechEnd => self.on_speech_end(user_id).await,
            }
        }

        // While the bot speaks, frames reach the VAD (for barge-in) but
        // not the engine.
        if self.state() != SessionState::Speaking {
            let engine = self.engine.lock().await;
            if let Some(engine) = engine.as_ref() {
                if let Err(e) = engine.feed_audio(user_id, &pcm).await {
                    debug!(user_id = %user_id, error = %e, "Engine rejected audio frame");
                }
            }
        }
    }

    /// Transport speaking-state edge for a user
    pub fn handle_speaking(&self, user_id: u64, speaking: bool) {
        debug!(guild_id = %self.ctx.guild_id, user_id = %user_id, speaking = %speaking, "User speaking state");
    }

    async fn on_speech_start(&self, user_id: u64) {
        debug!(guild_id = %self.ctx.guild_id, user_id = %user_id, "Speech start");
        if self.state() == SessionState::Speaking && self.ctx.settings.behavior.barge_in {
            self.handle_barge_in(user_id).await;
        }
    }

    async fn on_speech_end(&self, user_id: u64) {
        debug!(guild_id = %self.ctx.guild_id, user_id = %user_id, "Speech end");
        if self.state() == SessionState::Listening {
            self.set_state(SessionState::Processing);
        }
        let engine = self.engine.lock().await;
        if let Some(engine) = engine.as_ref() {
            if let Err(e) = engine.end_of_speech(user_id).await {
                warn!(user_id = %user_id, error = %e, "end_of_speech failed");
            }
        }
    }

    /// Barge-in: one engine interrupt, playback cleared, back to listening
    async fn handle_barge_in(&self, user_id: u64) {
        info!(guild_id = %self.ctx.guild_id, user_id = %user_id, "Barge-in");
        {
            let engine = self.engine.lock().await;
            if let Some(engine) = engine.as_ref() {
                engine.interrupt();
            }
        }
        self.queue.clear();
        self.set_state(SessionState::Listening);
    }

    /// Speak text directly (management `voice.speak`)
    pub async fn speak(&self, text: &str) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LyraError::session("session stopped"));
        }
        let engine = self.engine.lock().await;
        let engine = engine
            .as_ref()
            .ok_or_else(|| LyraError::session("session not started"))?;
        engine.inject_text(text).await
    }

    /// Conversation history snapshot
    pub async fn history(&self) -> Vec<ConversationTurn> {
        let engine = self.engine.lock().await;
        engine.as_ref().map(|e| e.history()).unwrap_or_default()
    }

    /// Stop the session; terminal and idempotent
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(guild_id = %self.ctx.guild_id, "Stopping voice session");

        self.cancel.cancel();
        self.queue.clear();

        if let Some(mut engine) = self.engine.lock().await.take() {
            if let Err(e) = engine.stop().await {
                warn!(error = %e, "Engine stop failed");
            }
        }

        let mut vads: Vec<VoiceDetector> = {
            let mut map = self.vads.lock();
            map.drain().map(|(_, vad)| vad).collect()
        };
        for vad in &mut vads {
            vad.dispose().await;
        }

        self.sender.shutdown();
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Drive engine and playback events into state transitions
    async fn event_loop(
        self: Arc<Self>,
        mut engine_events: mpsc::Receiver<EngineEvent>,
        mut queue_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = engine_events.recv() => {
                    let Some(event) = event else { return };
                    self.on_engine_event(event).await;
                }
                event = queue_events.recv() => {
                    let Some(event) = event else { return };
                    self.on_queue_event(event);
                }
            }
        }
    }

    async fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TranscriptIn { user_id, text } => {
                debug!(user_id = %user_id, text = %text, "Transcript");
                if self.state() == SessionState::Listening {
                    self.set_state(SessionState::Processing);
                }
            }
            EngineEvent::AssistantText { .. } => {}
            EngineEvent::Interrupted => {
                // Provider-side barge-in detection (S2S).
                if self.ctx.settings.behavior.barge_in {
                    self.queue.clear();
                    self.set_state(SessionState::Listening);
                }
            }
            EngineEvent::TurnEnd => {
                if self.state() == SessionState::Speaking
                    || self.state() == SessionState::Processing
                {
                    self.set_state(SessionState::Listening);
                }
            }
            EngineEvent::Error { message, fatal } => {
                if fatal {
                    error!(guild_id = %self.ctx.guild_id, error = %message, "Fatal engine error");
                    let _ = self.session_events.send(SessionEvent::Fatal {
                        message: message.clone(),
                    });
                    if let Some(session) = self.weak.upgrade() {
                        tokio::spawn(async move {
                            let _ = session.stop().await;
                        });
                    }
                } else {
                    warn!(guild_id = %self.ctx.guild_id, error = %message, "Engine error");
                }
            }
        }
    }

    fn on_queue_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => {
                if self.state() == SessionState::Processing
                    || self.state() == SessionState::Listening
                {
                    self.set_state(SessionState::Speaking);
                }
            }
            PlaybackEvent::Idle | PlaybackEvent::Cleared => {}
            PlaybackEvent::EntryError { message } => {
                warn!(guild_id = %self.ctx.guild_id, error = %message, "Playback entry failed");
            }
        }
    }
}
