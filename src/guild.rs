//! Per-guild container and the registry that owns them.
//!
//! A [`GuildDataContainer`] bundles everything one guild needs: its queue,
//! its play manager, the text channel the bot answers in, effect settings,
//! the voice join lock and the cancellation handles of long-running tasks.
//! Guilds never share mutable playback state.

use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::effects::{Effect, EffectPrefs};
use crate::audio::player::PlayManager;
use crate::audio::queue::{Added, AddedBy, PlaylistProgress, QueueEntry, QueueManager};
use crate::audio::stream::StreamResolver;
use crate::audio::transport::VoiceTransport;
use crate::backup::GuildStatus;
use crate::error::{PlayError, QueueError};
use crate::sources::{custom, soundcloud, spotify, youtube, ExportedSource, ResolveRequest, Resolver};

/// Versión actual del formato YMX
pub const YMX_VERSION: u32 = 5;

/// Canción exportada: snapshot de la fuente + quién la agregó
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YmxItem {
    #[serde(flatten)]
    pub source: ExportedSource,
    pub add_by: AddedBy,
    /// Servicio de origen; sin él se detecta por URL
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Cola persistida
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YmxFormat {
    pub version: u32,
    pub data: Vec<YmxItem>,
}

/// Resultado de `play_from_url`
#[derive(Debug)]
pub enum PlayOutcome {
    Single(Added),
    Playlist { added: usize },
}

/// Handle de cancelación de una tarea larga ligada a la guild
#[derive(Debug, Clone)]
pub struct TaskCancellation {
    id: u64,
    token: CancellationToken,
}

impl TaskCancellation {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `true` si todavía no estaba cancelada
    pub fn cancel(&self) -> bool {
        let pending = !self.token.is_cancelled();
        self.token.cancel();
        pending
    }
}

pub struct GuildDataContainer {
    guild_id: u64,
    queue: Arc<QueueManager>,
    player: Arc<PlayManager>,
    effects: Arc<RwLock<EffectPrefs>>,
    bound_channel: AtomicU64,
    /// Serializa los intentos de unirse a voz
    join_lock: tokio::sync::Mutex<()>,
    cancellations: Mutex<HashMap<u64, TaskCancellation>>,
    next_cancellation: AtomicU64,
}

impl GuildDataContainer {
    pub fn new(
        guild_id: u64,
        resolver: Resolver,
        transport: Arc<dyn VoiceTransport>,
        streams: Arc<dyn StreamResolver>,
    ) -> Arc<Self> {
        let config = resolver.context().config.clone();
        let queue = Arc::new(QueueManager::new(resolver, config.max_queue_size));
        let effects = Arc::new(RwLock::new(EffectPrefs::default()));
        let player = PlayManager::new(
            queue.clone(),
            transport,
            streams,
            effects.clone(),
            config.default_volume,
            Duration::from_secs(config.idle_timeout_secs),
        );
        Arc::new(Self {
            guild_id,
            queue,
            player,
            effects,
            bound_channel: AtomicU64::new(0),
            join_lock: tokio::sync::Mutex::new(()),
            cancellations: Mutex::new(HashMap::new()),
            next_cancellation: AtomicU64::new(1),
        })
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn player(&self) -> &Arc<PlayManager> {
        &self.player
    }

    pub fn effects(&self) -> EffectPrefs {
        *self.effects.read()
    }

    /// Alterna un efecto; se aplica desde la próxima reproducción
    pub fn toggle_effect(&self, effect: Effect) -> bool {
        self.effects.write().toggle(effect)
    }

    /// Canal de texto donde el bot publica sus avisos
    pub fn bound_channel(&self) -> Option<u64> {
        match self.bound_channel.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_bound_channel(&self, channel_id: u64) {
        self.bound_channel.store(channel_id, Ordering::SeqCst);
    }

    pub fn add_related(&self) -> bool {
        self.queue.add_related()
    }

    pub fn set_add_related(&self, enabled: bool) {
        self.queue.set_add_related(enabled);
    }

    pub fn equally_playback(&self) -> bool {
        self.queue.equally_playback()
    }

    pub fn set_equally_playback(&self, enabled: bool) {
        self.queue.set_equally_playback(enabled);
    }

    // --- Cancelación de tareas ---

    pub fn bind_cancellation(&self) -> TaskCancellation {
        let cancellation = TaskCancellation {
            id: self.next_cancellation.fetch_add(1, Ordering::SeqCst),
            token: CancellationToken::new(),
        };
        self.cancellations
            .lock()
            .insert(cancellation.id, cancellation.clone());
        cancellation
    }

    pub fn unbind_cancellation(&self, cancellation: &TaskCancellation) -> bool {
        self.cancellations.lock().remove(&cancellation.id).is_some()
    }

    /// Cancela todas las tareas ligadas; `true` si alguna seguía activa
    pub fn cancel_all(&self) -> bool {
        let pending: Vec<TaskCancellation> = self.cancellations.lock().values().cloned().collect();
        let cancelled = pending.iter().filter(|c| c.cancel()).count();
        if cancelled > 0 {
            info!("🛑 {} tareas canceladas en guild {}", cancelled, self.guild_id);
        }
        cancelled > 0
    }

    // --- Voz ---

    /// Se une al canal de voz. `Ok(false)` si ya estaba conectado a ese canal.
    pub async fn join_voice_channel(&self, channel_id: u64) -> Result<bool, PlayError> {
        let _guard = self.join_lock.lock().await;
        let transport = self.player.transport();
        if transport.is_connected().await && transport.channel_id() == Some(channel_id) {
            debug!("ya conectado a {} en guild {}", channel_id, self.guild_id);
            return Ok(false);
        }
        transport.join(channel_id).await?;
        Ok(true)
    }

    // --- Reproducción desde URL ---

    /// Agrega lo que indique `url` (archivo, playlist o fuente individual) y
    /// arranca la reproducción si no había nada sonando.
    pub async fn play_from_url(
        &self,
        url: &str,
        added_by: AddedBy,
        first: bool,
        cancellable: bool,
        progress: &dyn PlaylistProgress,
    ) -> Result<PlayOutcome> {
        let ctx = self.queue.resolver().context().clone();
        let config = ctx.config.clone();
        let limit = config.max_queue_size;

        let outcome = if !config.is_disabled_source(custom::SERVICE)
            && custom::is_available_raw_audio_url(url)
        {
            let request = ResolveRequest {
                kind: custom::SERVICE.to_string(),
                ..ResolveRequest::unknown(url)
            };
            PlayOutcome::Single(self.queue.add_queue(request, added_by, first, cancellable).await?)
        } else if !config.is_disabled_source(youtube::SERVICE) && youtube::is_playlist_url(url) {
            let items = youtube::playlist(&ctx, url, limit).await?;
            self.ingest(items, youtube::SERVICE, added_by, first, progress).await?
        } else if !config.is_disabled_source(soundcloud::SERVICE) && soundcloud::is_playlist_url(url) {
            let items = soundcloud::playlist(&ctx, url, limit).await?;
            self.ingest(items, soundcloud::SERVICE, added_by, first, progress).await?
        } else if !config.is_disabled_source(spotify::SERVICE)
            && config.spotify_available()
            && spotify::validate_playlist_url(url)
        {
            let items = spotify::playlist(&ctx, url, limit).await?;
            self.ingest(items, spotify::SERVICE, added_by, first, progress).await?
        } else {
            let request = ResolveRequest::unknown(url);
            PlayOutcome::Single(self.queue.add_queue(request, added_by, first, cancellable).await?)
        };

        self.player.play(0, false).await;
        Ok(outcome)
    }

    async fn ingest(
        &self,
        items: Vec<ExportedSource>,
        kind: &str,
        added_by: AddedBy,
        first: bool,
        progress: &dyn PlaylistProgress,
    ) -> Result<PlayOutcome, QueueError> {
        info!("📋 Procesando playlist de {} ({} items)", kind, items.len());
        let cancellation = self.bind_cancellation();
        let result = self
            .queue
            .process_playlist(items, kind, added_by, first, cancellation.token(), progress)
            .await;
        self.unbind_cancellation(&cancellation);
        Ok(PlayOutcome::Playlist { added: result? })
    }

    // --- Persistencia ---

    pub fn export_queue(&self) -> YmxFormat {
        YmxFormat {
            version: YMX_VERSION,
            data: self
                .queue
                .entries()
                .into_iter()
                .map(|entry| YmxItem {
                    source: entry.basic_info.export_data(),
                    add_by: entry.additional_info,
                    kind: Some(entry.basic_info.service_identifier().to_string()),
                })
                .collect(),
        }
    }

    /// Restaura una cola exportada sin notificar cambios. Devuelve cuántas se agregaron.
    pub async fn import_queue(&self, ymx: &YmxFormat) -> Result<usize> {
        if ymx.version != YMX_VERSION {
            bail!("versión de YMX no soportada: {} (se esperaba {})", ymx.version, YMX_VERSION);
        }

        let mut imported = 0;
        for item in &ymx.data {
            let kind = item.kind.clone().unwrap_or_else(|| "unknown".to_string());
            let request = ResolveRequest::restore(kind, item.source.clone());
            match self.queue.resolver().resolve(request).await {
                Ok(Some(source)) => {
                    match self.queue.add_queue_only(QueueEntry::new(source, item.add_by.clone())) {
                        Ok(_) => imported += 1,
                        Err(QueueError::Full(max)) => {
                            warn!("📦 Cola llena ({}) al importar en guild {}", max, self.guild_id);
                            break;
                        }
                        Err(e) => warn!("⚠️ No se pudo importar {}: {}", item.source.url, e),
                    }
                }
                Ok(None) => warn!("⚠️ Fuente no reconocida al importar: {}", item.source.url),
                Err(e) => warn!("⚠️ No se pudo importar {}: {}", item.source.url, e),
            }
        }
        info!("📥 {} canciones importadas en guild {}", imported, self.guild_id);
        Ok(imported)
    }

    pub fn export_status(&self) -> GuildStatus {
        let voice_channel = if self.player.is_playing() && !self.player.is_paused() {
            self.player.transport().channel_id()
        } else {
            None
        };
        GuildStatus {
            voice_channel: voice_channel.map_or_else(|| "0".to_string(), |id| id.to_string()),
            bound_channel: self.bound_channel().unwrap_or(0).to_string(),
            loop_enabled: self.queue.loop_enabled(),
            queue_loop_enabled: self.queue.queue_loop_enabled(),
            add_related: self.add_related(),
            equally_playback: self.equally_playback(),
            volume: self.player.volume(),
        }
    }

    /// Aplica un estado restaurado; vuelve a la llamada de voz si estaba sonando
    pub async fn import_status(&self, status: GuildStatus) {
        self.queue.set_loop_enabled(status.loop_enabled);
        self.queue.set_queue_loop_enabled(status.queue_loop_enabled);
        self.set_add_related(status.add_related);
        self.set_equally_playback(status.equally_playback);
        self.player.set_volume(status.volume);
        if let Ok(channel) = status.bound_channel.parse::<u64>() {
            self.set_bound_channel(channel);
        }

        if status.voice_channel == "0" {
            return;
        }
        let Ok(channel_id) = status.voice_channel.parse::<u64>() else {
            warn!("⚠️ Canal de voz inválido en el estado: {}", status.voice_channel);
            return;
        };
        match self.join_voice_channel(channel_id).await {
            Ok(_) => self.player.play(0, false).await,
            Err(e) => warn!("⚠️ No se pudo volver al canal de voz {}: {}", channel_id, e),
        }
    }
}

type TransportFactory = dyn Fn(u64) -> Arc<dyn VoiceTransport> + Send + Sync;

/// Contenedores por guild, creados bajo demanda
pub struct GuildRegistry {
    resolver: Resolver,
    streams: Arc<dyn StreamResolver>,
    transports: Box<TransportFactory>,
    containers: DashMap<u64, Arc<GuildDataContainer>>,
    created: broadcast::Sender<Arc<GuildDataContainer>>,
}

impl GuildRegistry {
    pub fn new(
        resolver: Resolver,
        streams: Arc<dyn StreamResolver>,
        transports: impl Fn(u64) -> Arc<dyn VoiceTransport> + Send + Sync + 'static,
    ) -> Self {
        Self {
            resolver,
            streams,
            transports: Box::new(transports),
            containers: DashMap::new(),
            created: broadcast::channel(16).0,
        }
    }

    /// Avisos de contenedores nuevos
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GuildDataContainer>> {
        self.created.subscribe()
    }

    pub fn get(&self, guild_id: u64) -> Option<Arc<GuildDataContainer>> {
        self.containers.get(&guild_id).map(|c| c.value().clone())
    }

    pub fn get_or_create(&self, guild_id: u64) -> Arc<GuildDataContainer> {
        let mut created = false;
        let container = self
            .containers
            .entry(guild_id)
            .or_insert_with(|| {
                created = true;
                GuildDataContainer::new(
                    guild_id,
                    self.resolver.clone(),
                    (self.transports)(guild_id),
                    self.streams.clone(),
                )
            })
            .value()
            .clone();
        if created {
            debug!("📦 Contenedor creado para guild {}", guild_id);
            let _ = self.created.send(container.clone());
        }
        container
    }

    pub fn all(&self) -> Vec<Arc<GuildDataContainer>> {
        self.containers.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }
}
