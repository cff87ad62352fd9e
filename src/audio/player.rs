//! Per-guild playback state machine.
//!
//! `play` binds the queue head to the voice transport: it optionally waits
//! for a scheduled live stream, fetches and transcodes the source, hands the
//! PCM to the transport and spawns a monitor that decides what happens when
//! the track ends or fails. Every started attempt gets a generation number;
//! anything reported by an older generation is ignored.

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::effects::EffectPrefs;
use super::events::{self, PlayerEvent, QueueEvent};
use super::normalizer::StreamEnd;
use super::queue::QueueManager;
use super::stream::{StreamRequest, StreamResolver};
use super::transport::{TransportStatus, VoiceTransport};
use crate::error::{PlayError, SourceError};
use crate::sources::AudioSource;

/// Fallos seguidos de una misma URL antes de saltarla
pub const MAX_RETRIES: u32 = 3;
/// Espera máxima hasta que el transporte reporte `Playing`
pub const PLAYING_TIMEOUT: Duration = Duration::from_secs(10);
/// Espera máxima hasta `Idle` tras el fin del stream
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(20);
/// Intervalo mínimo entre consultas de un directo programado
pub const LIVE_POLL_MIN: Duration = Duration::from_secs(20);

pub const MIN_VOLUME: u16 = 1;
pub const MAX_VOLUME: u16 = 200;

#[derive(Default)]
struct PlayState {
    preparing: bool,
    playing: bool,
    paused: bool,
    current: Option<Arc<dyn AudioSource>>,
    error_count: u32,
    error_url: Option<String>,
    seek: u64,
    volume: u16,
    cost: u32,
    generation: u64,
    live_wait: Option<CancellationToken>,
    playback: Option<CancellationToken>,
    idle: Option<CancellationToken>,
}

pub struct PlayManager {
    me: Weak<PlayManager>,
    queue: Arc<QueueManager>,
    transport: Arc<dyn VoiceTransport>,
    streams: Arc<dyn StreamResolver>,
    effects: Arc<RwLock<EffectPrefs>>,
    idle_timeout: Duration,
    state: Mutex<PlayState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl PlayManager {
    pub fn new(
        queue: Arc<QueueManager>,
        transport: Arc<dyn VoiceTransport>,
        streams: Arc<dyn StreamResolver>,
        effects: Arc<RwLock<EffectPrefs>>,
        volume: u16,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            transport,
            streams,
            effects,
            idle_timeout,
            state: Mutex::new(PlayState {
                volume: volume.clamp(MIN_VOLUME, MAX_VOLUME),
                ..Default::default()
            }),
            events: events::player_channel(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    pub fn transport(&self) -> &Arc<dyn VoiceTransport> {
        &self.transport
    }

    // --- Estado ---

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_preparing(&self) -> bool {
        self.state.lock().preparing
    }

    /// Fuente enlazada al transporte (o en preparación)
    pub fn current(&self) -> Option<Arc<dyn AudioSource>> {
        self.state.lock().current.clone()
    }

    pub fn volume(&self) -> u16 {
        self.state.lock().volume
    }

    /// Costo estimado del recurso actual
    pub fn cost(&self) -> u32 {
        self.state.lock().cost
    }

    /// Posición de reproducción en milisegundos
    pub async fn current_time(&self) -> u64 {
        let (playing, seek) = {
            let state = self.state.lock();
            (state.playing, state.seek)
        };
        if !playing {
            return 0;
        }
        seek * 1000 + self.transport.position().await.as_millis() as u64
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn is_head(&self, source: &Arc<dyn AudioSource>) -> bool {
        self.queue
            .head()
            .is_some_and(|head| Arc::ptr_eq(&head.basic_info, source))
    }

    // --- Reproducción ---

    /// Reproduce la cabeza de la cola desde `seek` segundos.
    ///
    /// No hace nada sin conexión de voz, si ya suena algo, si la cola está
    /// vacía o si otra llamada está preparando.
    pub fn play(&self, seek: u64, quiet: bool) -> BoxFuture<'_, ()> {
        Box::pin(self.start(seek, quiet))
    }

    async fn start(&self, seek: u64, quiet: bool) {
        self.cancel_idle();
        if !self.transport.is_connected().await {
            debug!("play(): sin conexión de voz");
            return;
        }

        let (source, generation) = {
            let mut state = self.state.lock();
            if state.playing || state.preparing {
                debug!("play(): ya hay una reproducción en curso");
                return;
            }
            let Some(head) = self.queue.head() else {
                debug!("play(): la cola está vacía");
                return;
            };
            state.preparing = true;
            state.seek = seek;
            state.generation += 1;
            state.current = Some(head.basic_info.clone());
            (head.basic_info, state.generation)
        };
        self.queue.set_head_in_use(true);
        self.emit(PlayerEvent::PlayCalled { seek });

        match self.prepare(&source, seek, quiet, generation).await {
            Ok(true) => {}
            Ok(false) => self.abandon(generation),
            Err(e) => self.handle_error(&source, e, generation).await,
        }
    }

    /// `Ok(false)` si la preparación se abandonó sin error
    async fn prepare(
        &self,
        source: &Arc<dyn AudioSource>,
        seek: u64,
        quiet: bool,
        generation: u64,
    ) -> Result<bool, PlayError> {
        let url = source.url();
        debug!("⏳ Preparando: {}", url);
        self.emit(PlayerEvent::Preparing { url: url.clone() });

        if source.available_after().is_some_and(|at| at > Utc::now())
            && !self.wait_for_live(source, generation).await?
        {
            return Ok(false);
        }

        let stream = match source.fetch(seek > 0).await {
            // el inicio del directo solo se conoce al consultar la fuente
            Err(SourceError::NotYetLive) if source.available_after().is_some() => {
                if !self.wait_for_live(source, generation).await? {
                    return Ok(false);
                }
                source.fetch(seek > 0).await?
            }
            result => result?,
        };
        let gain = f32::from(self.volume()) / 100.0;
        let hardware_volume = self.transport.supports_volume();
        let request = StreamRequest {
            stream,
            effects: self.effects.read().ffmpeg_args(),
            seek,
            software_volume: (!hardware_volume).then_some(gain),
            bitrate: self.transport.bitrate(),
        };
        let playable = self.streams.resolve(request).await?;
        if !self.is_current(generation) {
            debug!("preparación descartada: {}", url);
            return Ok(false);
        }

        let mut status = self.transport.status();
        self.transport
            .play(playable.pcm, if hardware_volume { gain } else { 1.0 })
            .await?;

        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                // stop() llegó mientras el transporte instalaba el recurso
                let replaced = state.playing;
                drop(state);
                if !replaced {
                    self.transport.stop();
                }
                return Ok(false);
            }
            state.preparing = false;
            state.playing = true;
            state.paused = false;
            state.cost = playable.cost;
            state.playback = Some(token.clone());
        }

        let reached = tokio::time::timeout(
            PLAYING_TIMEOUT,
            status.wait_for(|s| matches!(s, TransportStatus::Playing | TransportStatus::Errored(_))),
        )
        .await
        .map(|r| r.map(|s| s.clone()));
        match reached {
            Ok(Ok(TransportStatus::Errored(message))) => return Err(PlayError::Transport(message)),
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(PlayError::Transport("canal de estado cerrado".to_string())),
            Err(_) => warn!("⚠️ El transporte no llegó a Playing en {:?}: {}", PLAYING_TIMEOUT, url),
        }

        if quiet {
            debug!("▶️ Reproduciendo: {}", url);
        } else {
            info!("▶️ Reproduciendo: {}", source.title());
        }
        self.emit(PlayerEvent::Started { url, quiet });

        if let Some(me) = self.me.upgrade() {
            tokio::spawn(me.monitor(source.clone(), generation, playable.ended, status, token));
        }
        Ok(true)
    }

    /// Espera a un directo programado. `Ok(false)` si se canceló.
    async fn wait_for_live(
        &self,
        source: &Arc<dyn AudioSource>,
        generation: u64,
    ) -> Result<bool, PlayError> {
        let url = source.url();
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return Ok(false);
            }
            state.live_wait = Some(token.clone());
        }
        let mut queue_events = self.queue.subscribe();

        loop {
            let now = Utc::now();
            let Some(start) = source.available_after().filter(|at| *at > now) else {
                break;
            };
            let wait = (start - now).to_std().unwrap_or_default().max(LIVE_POLL_MIN);
            info!("📡 Esperando el directo {} ({}s)", url, wait.as_secs());
            self.emit(PlayerEvent::WaitingForLive {
                url: url.clone(),
                wait_secs: wait.as_secs(),
            });

            let cancelled = tokio::select! {
                _ = token.cancelled() => true,
                _ = self.head_replaced(source, &mut queue_events) => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if cancelled || token.is_cancelled() || !self.is_head(source) {
                info!("🛑 Espera del directo cancelada: {}", url);
                self.emit(PlayerEvent::LiveWaitCancelled { url });
                return Ok(false);
            }

            source.disable_cache();
            source.init(&url, None).await?;
        }

        let mut state = self.state.lock();
        if state.generation == generation {
            state.live_wait = None;
        }
        Ok(true)
    }

    async fn head_replaced(
        &self,
        source: &Arc<dyn AudioSource>,
        events: &mut broadcast::Receiver<QueueEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !self.is_head(source) {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    async fn monitor(
        self: Arc<Self>,
        source: Arc<dyn AudioSource>,
        generation: u64,
        ended: oneshot::Receiver<StreamEnd>,
        mut status: watch::Receiver<TransportStatus>,
        token: CancellationToken,
    ) {
        let failure = tokio::select! {
            _ = token.cancelled() => return,
            result = ended => match result {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(PlayError::Transcode(message)),
                Err(_) => Some(PlayError::Transcode("el stream se cerró antes de terminar".to_string())),
            },
            errored = status.wait_for(|s| matches!(s, TransportStatus::Errored(_))) => match errored {
                Ok(s) => match &*s {
                    TransportStatus::Errored(message) => Some(PlayError::Transport(message.clone())),
                    _ => None,
                },
                Err(_) => Some(PlayError::Transport("canal de estado cerrado".to_string())),
            },
        };

        match failure {
            None => {
                let idle = tokio::time::timeout(
                    FINISH_TIMEOUT,
                    status.wait_for(|s| matches!(s, TransportStatus::Idle | TransportStatus::Errored(_))),
                )
                .await
                .is_ok_and(|r| r.is_ok());
                if !idle && self.is_current(generation) {
                    warn!("⚠️ El transporte no quedó inactivo tras el fin del stream, forzando stop");
                    self.transport.stop();
                }
                self.on_finished(generation).await;
            }
            Some(error) => self.handle_error(&source, error, generation).await,
        }
    }

    async fn on_finished(&self, generation: u64) {
        let url = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.playing = false;
            state.paused = false;
            state.seek = 0;
            state.error_count = 0;
            state.error_url = None;
            state.playback = None;
            state.current.take().map(|s| s.url()).unwrap_or_default()
        };
        self.queue.set_head_in_use(false);
        debug!("✅ Terminó: {}", url);
        self.emit(PlayerEvent::Completed { url });

        if self.queue.loop_enabled() {
            debug!("🔂 Repitiendo la canción actual");
        } else if self.queue.once_loop_enabled() {
            self.queue.set_once_loop_enabled(false);
        } else {
            self.queue.advance().await;
        }

        if self.queue.is_empty() {
            self.on_queue_empty();
        } else {
            self.play(0, false).await;
        }
    }

    async fn handle_error(&self, source: &Arc<dyn AudioSource>, error: PlayError, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!("error de una reproducción anterior ignorado: {}", error);
                return;
            }
            state.preparing = false;
            state.playing = false;
            state.paused = false;
            state.current = None;
            if let Some(token) = state.playback.take() {
                token.cancel();
            }
            state.live_wait = None;
        }
        self.transport.stop();
        self.queue.set_head_in_use(false);

        let url = source.url();
        error!("❌ Error reproduciendo {}: {}", url, error);

        if error.is_rate_limit() {
            warn!("🚫 Límite de peticiones alcanzado, se detiene la reproducción");
            self.emit(PlayerEvent::RateLimited { url });
            self.stop();
            return;
        }

        let count = {
            let mut state = self.state.lock();
            if state.error_url.as_deref() == Some(url.as_str()) {
                state.error_count += 1;
            } else {
                state.error_count = 1;
                state.error_url = Some(url.clone());
            }
            state.error_count
        };
        if count == 1 {
            source.disable_cache();
        }

        let will_skip = count >= MAX_RETRIES;
        self.emit(PlayerEvent::Failed {
            url,
            error: error.to_string(),
            will_skip,
        });

        if will_skip {
            warn!("⏭️ {} fallos seguidos, se salta la canción", count);
            self.queue.set_loop_enabled(false);
            self.queue.set_once_loop_enabled(false);
            if self.queue.len() == 1 && self.queue.queue_loop_enabled() {
                self.queue.set_queue_loop_enabled(false);
            }
            self.queue.next();
        }

        if self.queue.is_empty() {
            self.on_queue_empty();
        } else {
            self.play(0, false).await;
        }
    }

    /// Libera una preparación abandonada
    fn abandon(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.preparing = false;
            state.current = None;
            state.live_wait = None;
        }
        self.queue.set_head_in_use(false);
    }

    fn on_queue_empty(&self) {
        info!("📭 La cola está vacía");
        self.emit(PlayerEvent::QueueEmpty);
        self.start_idle_timer();
    }

    fn start_idle_timer(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        let previous = self.state.lock().idle.replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if me.is_playing() || me.is_preparing() {
                        return;
                    }
                    info!("💤 {} sin reproducir, desconectando", humantime::format_duration(timeout));
                    me.emit(PlayerEvent::IdleDisconnect);
                    me.disconnect().await;
                }
            }
        });
    }

    fn cancel_idle(&self) {
        let idle = self.state.lock().idle.take();
        if let Some(idle) = idle {
            idle.cancel();
        }
    }

    // --- Controles ---

    /// Detiene la reproducción sin tocar la cola
    pub fn stop(&self) -> bool {
        let was_active = {
            let mut state = self.state.lock();
            state.generation += 1;
            for token in [state.live_wait.take(), state.playback.take()].into_iter().flatten() {
                token.cancel();
            }
            let was_active = state.playing || state.preparing;
            state.playing = false;
            state.preparing = false;
            state.paused = false;
            state.current = None;
            state.seek = 0;
            was_active
        };
        self.queue.set_head_in_use(false);
        self.transport.stop();
        if was_active {
            info!("⏹️ Reproducción detenida");
        }
        self.emit(PlayerEvent::Stop);
        was_active
    }

    pub async fn disconnect(&self) {
        self.stop();
        self.cancel_idle();
        self.emit(PlayerEvent::DisconnectAttempt);
        self.transport.disconnect().await;
        self.state.lock().current = None;
        self.emit(PlayerEvent::Disconnect);
    }

    pub fn pause(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.playing || state.paused {
                return false;
            }
        }
        if !self.transport.pause() {
            return false;
        }
        self.state.lock().paused = true;
        info!("⏸️ Reproducción pausada");
        self.emit(PlayerEvent::Pause);
        true
    }

    pub fn resume(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.playing || !state.paused {
                return false;
            }
        }
        if !self.transport.resume() {
            return false;
        }
        self.state.lock().paused = false;
        info!("▶️ Reproducción reanudada");
        self.emit(PlayerEvent::Resume);
        true
    }

    /// Vuelve a empezar la canción actual
    pub async fn rewind(&self) {
        self.stop();
        self.emit(PlayerEvent::Rewind);
        self.play(0, false).await;
    }

    /// Reinicia la canción actual en `seconds`
    pub async fn seek(&self, seconds: u64) {
        self.stop();
        self.play(seconds, true).await;
    }

    /// Abandona la canción actual y reproduce la siguiente
    pub async fn skip(&self) {
        self.stop();
        self.queue.next();
        if self.queue.is_empty() {
            self.on_queue_empty();
        } else {
            self.play(0, false).await;
        }
    }

    /// Cambia el volumen (1..=200). Devuelve si se aplicó en vivo.
    pub fn set_volume(&self, volume: u16) -> bool {
        let volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
        self.state.lock().volume = volume;
        info!("🔊 Volumen: {}%", volume);
        self.transport.supports_volume() && self.transport.set_volume(f32::from(volume) / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::effects::Effect;
    use crate::audio::queue::QueueEntry;
    use crate::audio::testing::{
        count, fake_entry, fake_entry_with, test_queue, wait_for_event, FailMode, FakeSource,
        FakeStreamResolver, FakeTransport,
    };
    use pretty_assertions::assert_eq;

    struct Harness {
        player: Arc<PlayManager>,
        queue: Arc<QueueManager>,
        transport: Arc<FakeTransport>,
        streams: Arc<FakeStreamResolver>,
        effects: Arc<RwLock<EffectPrefs>>,
        events: broadcast::Receiver<PlayerEvent>,
    }

    fn harness() -> Harness {
        let queue = Arc::new(test_queue());
        let transport = Arc::new(FakeTransport::new());
        let streams = Arc::new(FakeStreamResolver::default());
        let effects = Arc::new(RwLock::new(EffectPrefs::default()));
        let player = PlayManager::new(
            queue.clone(),
            transport.clone(),
            streams.clone(),
            effects.clone(),
            100,
            Duration::from_secs(600),
        );
        let events = player.subscribe();
        Harness {
            player,
            queue,
            transport,
            streams,
            effects,
            events,
        }
    }

    fn push(queue: &QueueManager, entry: QueueEntry) {
        queue.add_queue_only(entry).unwrap();
    }

    fn urls(queue: &QueueManager) -> Vec<String> {
        queue.entries().iter().map(|e| e.basic_info.url()).collect()
    }

    fn started(url: &'static str) -> impl Fn(&PlayerEvent) -> bool {
        move |e| matches!(e, PlayerEvent::Started { url: u, .. } if u == url)
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_is_idempotent() {
        let h = harness();
        push(&h.queue, fake_entry("a", "1", 60));

        tokio::join!(h.player.play(0, false), h.player.play(0, false));
        h.player.play(0, false).await;

        assert_eq!(count(&h.transport.plays), 1);
        assert!(h.player.is_playing());
        assert_eq!(h.player.current().map(|s| s.url()), Some("a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_requires_connection_and_entries() {
        let mut h = harness();
        h.player.play(0, false).await;
        assert!(h.events.try_recv().is_err());

        push(&h.queue, fake_entry("a", "1", 60));
        h.transport.set_connected(false);
        h.player.play(0, false).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(count(&h.transport.plays), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_track_advances_to_next() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        push(&h.queue, fake_entry("b", "1", 60));
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        assert!(h.streams.finish_current());
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Completed { url } if url == "a")).await;
        wait_for_event(&mut h.events, started("b")).await;

        assert_eq!(urls(&h.queue), vec!["b"]);
        assert_eq!(count(&h.transport.plays), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_forces_stop_when_transport_stays_busy() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        push(&h.queue, fake_entry("b", "1", 60));
        h.player.play(0, false).await;

        // el transporte sigue en Playing: tras el límite se fuerza stop
        assert!(h.streams.finish_current());
        wait_for_event(&mut h.events, started("b")).await;
        assert!(count(&h.transport.stops) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_replays_and_once_loop_clears() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        push(&h.queue, fake_entry("b", "1", 60));
        h.queue.set_once_loop_enabled(true);
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        h.streams.finish_current();
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Completed { .. })).await;
        wait_for_event(&mut h.events, started("a")).await;
        assert!(!h.queue.once_loop_enabled());
        assert_eq!(urls(&h.queue), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_loop_with_single_entry_plays_again() {
        let mut h = harness();
        push(&h.queue, fake_entry("only", "1", 60));
        h.queue.set_queue_loop_enabled(true);
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        h.streams.finish_current();
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Completed { .. })).await;
        wait_for_event(&mut h.events, started("only")).await;
        assert_eq!(count(&h.transport.plays), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_timeout_is_not_fatal() {
        let mut h = harness();
        h.transport.set_auto_play(false);
        push(&h.queue, fake_entry("slow", "1", 60));

        h.player.play(0, false).await;

        assert_eq!(h.transport.current_status(), TransportStatus::Buffering);
        assert!(h.player.is_playing());
        wait_for_event(&mut h.events, started("slow")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_skip_after_three_attempts() {
        let mut h = harness();
        let broken = Arc::new(FakeSource::new("broken", 60).failing(FailMode::Always));
        push(&h.queue, fake_entry_with(broken.clone(), "1"));
        push(&h.queue, fake_entry("b", "1", 60));
        h.queue.set_loop_enabled(true);
        h.queue.set_once_loop_enabled(true);

        h.player.play(0, false).await;

        assert_eq!(count(&broken.fetches), 3);
        // la caché se invalida solo tras el primer fallo
        assert_eq!(count(&broken.disabled), 1);
        assert_eq!(count(&broken.cache_hits), 1);
        assert!(!h.queue.loop_enabled());
        assert!(!h.queue.once_loop_enabled());
        assert_eq!(urls(&h.queue), vec!["b"]);
        assert!(h.player.is_playing());

        let skip = wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Failed { will_skip: true, .. })).await;
        assert!(matches!(skip, PlayerEvent::Failed { url, .. } if url == "broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_single_entry_clears_queue_loop() {
        let mut h = harness();
        let broken = Arc::new(FakeSource::new("broken", 60).failing(FailMode::Always));
        push(&h.queue, fake_entry_with(broken.clone(), "1"));
        h.queue.set_queue_loop_enabled(true);

        h.player.play(0, false).await;

        assert_eq!(count(&broken.fetches), 3);
        assert!(!h.queue.queue_loop_enabled());
        assert!(h.queue.is_empty());
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::QueueEmpty).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_stops_without_retry() {
        let mut h = harness();
        let limited = Arc::new(FakeSource::new("limited", 60).failing(FailMode::RateLimit));
        push(&h.queue, fake_entry_with(limited.clone(), "1"));
        push(&h.queue, fake_entry("b", "1", 60));

        h.player.play(0, false).await;

        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::RateLimited { .. })).await;
        assert_eq!(count(&limited.fetches), 1);
        assert_eq!(count(&h.transport.plays), 0);
        assert!(!h.player.is_playing());
        assert_eq!(urls(&h.queue), vec!["limited", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_same_track() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Errored("boom".into()));
        let failed = wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Failed { .. })).await;
        assert!(matches!(failed, PlayerEvent::Failed { will_skip: false, .. }));
        wait_for_event(&mut h.events, started("a")).await;
        assert_eq!(count(&h.transport.plays), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcode_failure_retries_instead_of_completing() {
        let mut h = harness();
        let flaky = Arc::new(FakeSource::new("a", 60));
        push(&h.queue, fake_entry_with(flaky.clone(), "1"));
        push(&h.queue, fake_entry("b", "1", 60));
        h.player.play(0, false).await;

        assert!(h.streams.fail_current("ffmpeg terminó con exit status: 1"));
        let failed = wait_for_event(&mut h.events, |e| {
            matches!(e, PlayerEvent::Failed { .. } | PlayerEvent::Completed { .. })
        })
        .await;
        assert!(matches!(failed, PlayerEvent::Failed { will_skip: false, .. }));
        wait_for_event(&mut h.events, started("a")).await;

        assert_eq!(count(&flaky.disabled), 1);
        assert_eq!(urls(&h.queue), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_looped_track_that_keeps_failing_is_skipped() {
        let mut h = harness();
        push(&h.queue, fake_entry("dead", "1", 60));
        push(&h.queue, fake_entry("b", "1", 60));
        h.queue.set_loop_enabled(true);
        h.player.play(0, false).await;

        for attempt in 1..=MAX_RETRIES {
            assert!(h.streams.fail_current("403 Forbidden"));
            let failed = wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::Failed { .. })).await;
            let last = attempt == MAX_RETRIES;
            assert!(matches!(failed, PlayerEvent::Failed { will_skip, .. } if will_skip == last));
            wait_for_event(&mut h.events, started(if last { "b" } else { "dead" })).await;
        }

        assert!(!h.queue.loop_enabled());
        assert_eq!(urls(&h.queue), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_entry_that_turns_out_upcoming_waits_for_live() {
        let mut h = harness();
        let premiere = Arc::new(FakeSource::new("premiere", 0));
        premiere.upcoming_on_fetch(Utc::now() + chrono::Duration::seconds(5));
        push(&h.queue, fake_entry_with(premiere.clone(), "1"));

        let player = h.player.clone();
        let task = tokio::spawn(async move { player.play(0, false).await });
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::WaitingForLive { .. })).await;
        assert!(h.player.is_preparing());
        assert_eq!(count(&h.transport.plays), 0);

        premiere.set_available_after(None);
        let next = wait_for_event(&mut h.events, |e| {
            matches!(e, PlayerEvent::Started { .. } | PlayerEvent::Failed { .. })
        })
        .await;
        assert!(matches!(next, PlayerEvent::Started { url, .. } if url == "premiere"));
        task.await.unwrap();
        assert_eq!(count(&premiere.fetches), 2);
        assert_eq!(urls(&h.queue), vec!["premiere"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_transport_handoff_leaves_transport_idle() {
        let h = harness();
        h.transport.set_play_delay(Duration::from_secs(1));
        push(&h.queue, fake_entry("a", "1", 60));

        let player = h.player.clone();
        let task = tokio::spawn(async move { player.play(0, false).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count(&h.transport.plays), 1);

        h.player.stop();
        task.await.unwrap();

        assert!(!h.player.is_playing());
        assert!(!h.transport.has_resource());
        assert_eq!(h.transport.current_status(), TransportStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_wait_cancelled_when_head_replaced() {
        let mut h = harness();
        let live = Arc::new(FakeSource::new("live", 0));
        live.set_available_after(Some(Utc::now() + chrono::Duration::hours(1)));
        push(&h.queue, fake_entry_with(live.clone(), "1"));
        push(&h.queue, fake_entry("b", "1", 60));

        let player = h.player.clone();
        let task = tokio::spawn(async move { player.play(0, false).await });
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::WaitingForLive { .. })).await;
        assert!(h.player.is_preparing());

        h.queue.next();
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::LiveWaitCancelled { .. })).await;
        task.await.unwrap();

        assert_eq!(count(&live.inits), 0);
        assert_eq!(count(&live.fetches), 0);
        assert!(!h.player.is_preparing());

        h.player.play(0, false).await;
        wait_for_event(&mut h.events, started("b")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_wait_polls_until_available() {
        let mut h = harness();
        let live = Arc::new(FakeSource::new("live", 0));
        live.set_available_after(Some(Utc::now() + chrono::Duration::seconds(5)));
        push(&h.queue, fake_entry_with(live.clone(), "1"));

        let player = h.player.clone();
        let task = tokio::spawn(async move { player.play(0, false).await });
        let waiting = wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::WaitingForLive { .. })).await;
        assert!(matches!(waiting, PlayerEvent::WaitingForLive { wait_secs: 20, .. }));

        live.set_available_after(None);
        wait_for_event(&mut h.events, started("live")).await;
        task.await.unwrap();
        assert_eq!(count(&live.inits), 1);
        assert_eq!(count(&live.disabled), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_live_wait() {
        let mut h = harness();
        let live = Arc::new(FakeSource::new("live", 0));
        live.set_available_after(Some(Utc::now() + chrono::Duration::hours(1)));
        push(&h.queue, fake_entry_with(live.clone(), "1"));

        let player = h.player.clone();
        let task = tokio::spawn(async move { player.play(0, false).await });
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::WaitingForLive { .. })).await;

        assert!(h.player.stop());
        wait_for_event(&mut h.events, |e| matches!(e, PlayerEvent::LiveWaitCancelled { .. })).await;
        task.await.unwrap();
        assert!(!h.player.is_preparing());
        assert_eq!(count(&live.fetches), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_countdown_disconnects() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        h.streams.finish_current();
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::QueueEmpty).await;
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::IdleDisconnect).await;
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::Disconnect).await;
        assert_eq!(count(&h.transport.disconnects), 1);
    }

    fn saw_idle_disconnect(events: &mut broadcast::Receiver<PlayerEvent>) -> bool {
        std::iter::from_fn(|| events.try_recv().ok()).any(|e| e == PlayerEvent::IdleDisconnect)
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_before_idle_expiry_keeps_connection() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        h.streams.finish_current();
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::QueueEmpty).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        push(&h.queue, fake_entry("b", "1", 60));
        h.player.play(0, false).await;
        wait_for_event(&mut h.events, started("b")).await;

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert!(!saw_idle_disconnect(&mut h.events));
        assert_eq!(count(&h.transport.disconnects), 0);
        assert!(h.player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_idle_expiry_cancels_countdown() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        h.player.play(0, false).await;

        h.transport.set_status(TransportStatus::Idle);
        h.streams.finish_current();
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::QueueEmpty).await;

        h.player.disconnect().await;
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert!(!saw_idle_disconnect(&mut h.events));
        assert_eq!(count(&h.transport.disconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controls() {
        let h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        h.effects.write().toggle(Effect::BassBoost);

        assert!(!h.player.pause());
        h.player.play(0, false).await;
        assert!(h.player.pause());
        assert!(!h.player.pause());
        assert!(h.player.is_paused());
        assert!(h.player.resume());

        assert!(h.player.set_volume(150));
        assert_eq!(*h.transport.volume.lock(), 1.5);
        h.player.set_volume(999);
        assert_eq!(h.player.volume(), MAX_VOLUME);

        assert_eq!(h.player.current_time().await, 5_000);
        h.player.seek(30).await;
        assert_eq!(h.player.current_time().await, 35_000);

        let requests = h.streams.requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0, 30);
        assert_eq!(requests[0].1, vec!["-af".to_string(), "bass=g=10".to_string()]);
        assert_eq!(h.player.cost(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_and_disconnect() {
        let mut h = harness();
        push(&h.queue, fake_entry("a", "1", 60));
        push(&h.queue, fake_entry("b", "1", 60));
        h.player.play(0, false).await;

        h.player.skip().await;
        wait_for_event(&mut h.events, started("b")).await;
        assert_eq!(urls(&h.queue), vec!["b"]);

        h.player.disconnect().await;
        assert!(!h.player.is_playing());
        assert!(h.player.current().is_none());
        assert_eq!(count(&h.transport.disconnects), 1);
        wait_for_event(&mut h.events, |e| *e == PlayerEvent::Disconnect).await;
    }
}
