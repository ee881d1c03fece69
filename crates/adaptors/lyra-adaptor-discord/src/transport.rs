//! Voice transport
//!
//! The narrow interface the session core needs from Discord voice: a PCM
//! sink for playback, per-user decoded frames in, and connect/disconnect.
//! The songbird-backed implementation lives behind the `discord` feature
//! so the audio plane tests run without a gateway.

use crate::sender::AudioSink;
use crate::session::VoiceSession;
use async_trait::async_trait;
use lyra_core::Result;
use std::sync::Arc;
use std::time::Duration;

/// Time allowed for the voice connection to become ready
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Window in which the transport library may self-heal a disconnect
/// before a manual rejoin starts
pub const SELF_HEAL_WINDOW: Duration = Duration::from_secs(5);

/// Base delay of the manual rejoin backoff (doubles per attempt)
pub const REJOIN_BACKOFF_BASE_MS: u64 = 500;

/// Manual rejoin attempts before giving up and leaving
pub const REJOIN_MAX_ATTEMPTS: u32 = 5;

/// Rejoin delay for attempt `n` (1-based): `500 * 2^(n-1)` ms
pub fn rejoin_backoff(attempt: u32) -> Duration {
    Duration::from_millis(REJOIN_BACKOFF_BASE_MS << attempt.saturating_sub(1).min(16))
}

/// Guild voice connections, one per session
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join a voice channel and return the playback sink
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<Arc<dyn AudioSink>>;

    /// Start delivering decoded per-user frames into the session
    async fn attach(&self, guild_id: u64, session: Arc<VoiceSession>) -> Result<()>;

    /// Leave a guild's voice channel
    async fn disconnect(&self, guild_id: u64) -> Result<()>;

    /// Tear down the shared client
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(feature = "discord")]
pub use songbird_transport::SongbirdTransport;

#[cfg(feature = "discord")]
mod songbird_transport {
    use super::*;
    use crate::audio::TRANSPORT_FRAME_BYTES;
    use bytes::Bytes;
    use lyra_core::LyraError;
    use serenity::model::id::{ChannelId, GuildId};
    use songbird::events::context_data::VoiceTick;
    use songbird::events::{Event, EventContext, EventHandler};
    use songbird::input::{Input, RawAdapter};
    use songbird::Songbird;
    use std::io::{Read, Seek, SeekFrom};
    use std::sync::mpsc as std_mpsc;
    use tracing::{debug, info, warn};

    /// Feeds queued PCM frames into songbird's raw input as a byte stream,
    /// padding with silence when the queue is dry so the track never ends.
    /// The receiver sits behind a mutex to satisfy MediaSource's Sync bound.
    struct ChannelReader {
        rx: std::sync::Mutex<std_mpsc::Receiver<Bytes>>,
        leftover: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.leftover.is_empty() {
                let rx = self.rx.lock().expect("reader lock");
                match rx.try_recv() {
                    Ok(frame) => self.leftover = frame.to_vec(),
                    Err(std_mpsc::TryRecvError::Empty) => {
                        // Silence keeps the track alive between replies.
                        self.leftover = vec![0u8; TRANSPORT_FRAME_BYTES];
                    }
                    Err(std_mpsc::TryRecvError::Disconnected) => return Ok(0),
                }
            }
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Ok(n)
        }
    }

    impl Seek for ChannelReader {
        fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "live stream",
            ))
        }
    }

    impl songbird::input::core::io::MediaSource for ChannelReader {
        fn is_seekable(&self) -> bool {
            false
        }
        fn byte_len(&self) -> Option<u64> {
            None
        }
    }

    /// Playback sink writing frames into the live raw track
    struct SongbirdSink {
        tx: parking_lot::Mutex<std_mpsc::Sender<Bytes>>,
    }

    #[async_trait]
    impl AudioSink for SongbirdSink {
        async fn write_frame(&self, frame: Bytes) -> Result<()> {
            self.tx
                .lock()
                .send(frame)
                .map_err(|_| LyraError::transport("voice track ended"))
        }
    }

    /// Driver disconnect recovery: give the library its self-heal window,
    /// then rejoin manually with backoff, and leave if that fails too.
    struct DisconnectHandler {
        songbird: Arc<Songbird>,
        guild: GuildId,
        channel: ChannelId,
    }

    #[async_trait]
    impl EventHandler for DisconnectHandler {
        async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
            if !matches!(ctx, EventContext::DriverDisconnect(_)) {
                return None;
            }
            warn!(guild_id = %self.guild, "Voice driver disconnected");

            let songbird = self.songbird.clone();
            let guild = self.guild;
            let channel = self.channel;
            tokio::spawn(async move {
                tokio::time::sleep(SELF_HEAL_WINDOW).await;
                let healed = match songbird.get(guild) {
                    Some(call) => call.lock().await.current_connection().is_some(),
                    None => return,
                };
                if healed {
                    debug!(guild_id = %guild, "Voice connection self-healed");
                    return;
                }

                for attempt in 1..=REJOIN_MAX_ATTEMPTS {
                    tokio::time::sleep(rejoin_backoff(attempt)).await;
                    match songbird.join(guild, channel).await {
                        Ok(_) => {
                            info!(guild_id = %guild, attempt = %attempt, "Rejoined voice channel");
                            return;
                        }
                        Err(e) => {
                            warn!(guild_id = %guild, attempt = %attempt, error = %e, "Rejoin failed");
                        }
                    }
                }
                warn!(guild_id = %guild, "Rejoin attempts exhausted, leaving");
                let _ = songbird.remove(guild).await;
            });
            None
        }
    }

    /// VoiceTick handler forwarding decoded frames into the session
    struct SessionFrameHandler {
        session: Arc<VoiceSession>,
    }

    #[async_trait]
    impl EventHandler for SessionFrameHandler {
        async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
            match ctx {
                EventContext::VoiceTick(VoiceTick { speaking, .. }) => {
                    for (&ssrc, data) in speaking.iter() {
                        if let Some(audio) = &data.decoded_voice {
                            if !audio.is_empty() {
                                self.session.handle_frame(ssrc as u64, audio).await;
                            }
                        }
                    }
                }
                EventContext::SpeakingStateUpdate(state) => {
                    self.session
                        .handle_speaking(state.ssrc as u64, state.speaking.microphone());
                }
                _ => {}
            }
            None
        }
    }

    /// Songbird-backed transport; the client is process-wide shared
    pub struct SongbirdTransport {
        songbird: Arc<Songbird>,
    }

    impl SongbirdTransport {
        /// Wrap a songbird manager
        pub fn new(songbird: Arc<Songbird>) -> Self {
            Self { songbird }
        }

        async fn join_with_backoff(&self, guild: GuildId, channel: ChannelId) -> Result<()> {
            let mut attempt = 1u32;
            loop {
                match tokio::time::timeout(JOIN_TIMEOUT, self.songbird.join(guild, channel)).await
                {
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(e)) if attempt >= REJOIN_MAX_ATTEMPTS => {
                        return Err(LyraError::transport(format!(
                            "join failed after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    Ok(Err(e)) => {
                        let delay = rejoin_backoff(attempt);
                        warn!(guild_id = %guild, attempt = %attempt, error = %e, "Join failed, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(_) => {
                        return Err(LyraError::timeout(format!(
                            "voice join did not become ready within {:?}",
                            JOIN_TIMEOUT
                        )));
                    }
                }
            }
        }
    }

    #[async_trait]
    impl VoiceTransport for SongbirdTransport {
        async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<Arc<dyn AudioSink>> {
            let guild = GuildId::new(guild_id);
            let channel = ChannelId::new(channel_id);

            self.join_with_backoff(guild, channel).await?;
            info!(guild_id = %guild_id, channel_id = %channel_id, "Joined voice channel");

            let call = self
                .songbird
                .get(guild)
                .ok_or_else(|| LyraError::transport("call handle missing after join"))?;

            let (tx, rx) = std_mpsc::channel::<Bytes>();
            let reader = ChannelReader {
                rx: std::sync::Mutex::new(rx),
                leftover: Vec::new(),
            };
            let input: Input = RawAdapter::new(reader, 48_000, 2).into();

            let mut call = call.lock().await;
            call.add_global_event(
                Event::Core(songbird::CoreEvent::DriverDisconnect),
                DisconnectHandler {
                    songbird: self.songbird.clone(),
                    guild,
                    channel,
                },
            );
            let _track = call.play_input(input);
            debug!(guild_id = %guild_id, "Raw playback track started");

            Ok(Arc::new(SongbirdSink {
                tx: parking_lot::Mutex::new(tx),
            }))
        }

        async fn attach(&self, guild_id: u64, session: Arc<VoiceSession>) -> Result<()> {
            let call = self
                .songbird
                .get(GuildId::new(guild_id))
                .ok_or_else(|| LyraError::transport("not connected"))?;

            let mut call = call.lock().await;
            call.add_global_event(
                Event::Core(songbird::CoreEvent::VoiceTick),
                SessionFrameHandler {
                    session: session.clone(),
                },
            );
            call.add_global_event(
                Event::Core(songbird::CoreEvent::SpeakingStateUpdate),
                SessionFrameHandler { session },
            );
            Ok(())
        }

        async fn disconnect(&self, guild_id: u64) -> Result<()> {
            if let Err(e) = self.songbird.remove(GuildId::new(guild_id)).await {
                warn!(guild_id = %guild_id, error = %e, "Error leaving voice channel");
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            // Per-guild calls were removed on leave; nothing global to drop.
            Ok(())
        }
    }
}
