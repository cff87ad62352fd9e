//! Voice connection seam.
//!
//! The player only talks to [`VoiceTransport`]; production uses songbird,
//! tests plug in a fake that flips the status channel by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{Input, RawAdapter};
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::normalizer::Normalizer;
use super::stream::{CHANNELS, SAMPLE_RATE};
use crate::error::PlayError;

/// Bitrate por defecto del canal de voz
pub const DEFAULT_BITRATE: u32 = 96_000;

/// Estado observable del reproductor de voz
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Idle,
    Buffering,
    Playing,
    Paused,
    Errored(String),
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn join(&self, channel_id: u64) -> Result<(), PlayError>;

    /// Canal de voz actual
    fn channel_id(&self) -> Option<u64>;

    /// Reemplaza lo que esté sonando por `pcm`
    async fn play(&self, pcm: Normalizer, volume: f32) -> Result<(), PlayError>;

    fn status(&self) -> watch::Receiver<TransportStatus>;

    fn stop(&self);

    fn pause(&self) -> bool;

    fn resume(&self) -> bool;

    /// Cambia el volumen en vivo; `false` si no hay nada sonando
    fn set_volume(&self, volume: f32) -> bool;

    /// Posición dentro del recurso actual
    async fn position(&self) -> Duration;

    fn bitrate(&self) -> u32 {
        DEFAULT_BITRATE
    }

    /// Si el transporte aplica el volumen por sí mismo
    fn supports_volume(&self) -> bool {
        true
    }

    async fn disconnect(&self);
}

/// Transporte sobre songbird para una guild
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    track: Mutex<Option<TrackHandle>>,
    channel: Mutex<Option<u64>>,
    /// Los eventos de pistas anteriores se descartan
    generation: Arc<AtomicU64>,
    status: Arc<watch::Sender<TransportStatus>>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, guild_id: GuildId) -> Self {
        let (status, _) = watch::channel(TransportStatus::Idle);
        Self {
            manager,
            guild_id,
            track: Mutex::new(None),
            channel: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            status: Arc::new(status),
        }
    }

    fn register(&self, handle: &TrackHandle, generation: u64) -> Result<(), PlayError> {
        for event in [
            TrackEvent::Play,
            TrackEvent::Pause,
            TrackEvent::End,
            TrackEvent::Error,
        ] {
            handle
                .add_event(
                    Event::Track(event),
                    StatusHandler {
                        generation,
                        current: self.generation.clone(),
                        status: self.status.clone(),
                    },
                )
                .map_err(|e| PlayError::Transport(format!("no se pudo registrar el evento: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn is_connected(&self) -> bool {
        match self.manager.get(self.guild_id) {
            Some(call) => call.lock().await.current_connection().is_some(),
            None => false,
        }
    }

    async fn join(&self, channel_id: u64) -> Result<(), PlayError> {
        if channel_id == 0 {
            return Err(PlayError::Transport("canal de voz inválido".to_string()));
        }
        let call = self
            .manager
            .join(self.guild_id, ChannelId::new(channel_id))
            .await
            .map_err(|e| PlayError::Transport(format!("no se pudo unir al canal: {}", e)))?;
        if let Err(e) = call.lock().await.deafen(true).await {
            warn!("⚠️ No se pudo ensordecer al bot: {}", e);
        }
        *self.channel.lock() = Some(channel_id);
        info!("🔊 Conectado al canal de voz {} (guild {})", channel_id, self.guild_id);
        Ok(())
    }

    fn channel_id(&self) -> Option<u64> {
        *self.channel.lock()
    }

    async fn play(&self, pcm: Normalizer, volume: f32) -> Result<(), PlayError> {
        let call = self.manager.get(self.guild_id).ok_or(PlayError::NotConnected)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(TransportStatus::Buffering);

        let input: Input = RawAdapter::new(pcm, SAMPLE_RATE, CHANNELS).into();
        let handle = {
            let mut call = call.lock().await;
            call.stop();
            call.play_input(input)
        };
        if let Err(e) = handle.set_volume(volume) {
            warn!("⚠️ No se pudo aplicar el volumen {}: {}", volume, e);
        }
        self.register(&handle, generation)?;

        *self.track.lock() = Some(handle);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.track.lock().take() {
            let _ = handle.stop();
        }
        self.status.send_replace(TransportStatus::Idle);
    }

    fn pause(&self) -> bool {
        let paused = self
            .track
            .lock()
            .as_ref()
            .map(|handle| handle.pause().is_ok())
            .unwrap_or(false);
        if paused {
            self.status.send_replace(TransportStatus::Paused);
        }
        paused
    }

    fn resume(&self) -> bool {
        let resumed = self
            .track
            .lock()
            .as_ref()
            .map(|handle| handle.play().is_ok())
            .unwrap_or(false);
        if resumed {
            self.status.send_replace(TransportStatus::Playing);
        }
        resumed
    }

    fn set_volume(&self, volume: f32) -> bool {
        self.track
            .lock()
            .as_ref()
            .map(|handle| handle.set_volume(volume).is_ok())
            .unwrap_or(false)
    }

    async fn position(&self) -> Duration {
        let handle = self.track.lock().clone();
        match handle {
            Some(handle) => handle
                .get_info()
                .await
                .map(|state| state.position)
                .unwrap_or_default(),
            None => Duration::ZERO,
        }
    }

    async fn disconnect(&self) {
        self.stop();
        *self.channel.lock() = None;
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!("remove(): {}", e);
        }
        info!("👋 Desconectado del canal de voz (guild {})", self.guild_id);
    }
}

/// Traduce los eventos de pista de songbird al canal de estado
struct StatusHandler {
    generation: u64,
    current: Arc<AtomicU64>,
    status: Arc<watch::Sender<TransportStatus>>,
}

#[async_trait]
impl VoiceEventHandler for StatusHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return None;
        }
        let EventContext::Track(tracks) = ctx else {
            return None;
        };
        let Some((state, _)) = tracks.first() else {
            return None;
        };

        let next = match &state.playing {
            PlayMode::Play => TransportStatus::Playing,
            PlayMode::Pause => TransportStatus::Paused,
            PlayMode::Stop | PlayMode::End => TransportStatus::Idle,
            PlayMode::Errored(e) => {
                error!("❌ Error en la pista de voz: {}", e);
                TransportStatus::Errored(e.to_string())
            }
            _ => return None,
        };
        debug!("🎚️ Estado del transporte: {:?}", next);
        self.status.send_replace(next);
        None
    }
}
