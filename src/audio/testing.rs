//! Dobles de prueba compartidos por los tests de cola, reproductor y guild.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};

use super::events::PlayerEvent;
use super::normalizer::{Normalizer, StreamEnd};
use super::queue::{AddedBy, QueueEntry, QueueManager};
use super::stream::{PlayableStream, StreamRequest, StreamResolver};
use super::transport::{TransportStatus, VoiceTransport};
use crate::config::Config;
use crate::error::{PlayError, SourceError};
use crate::sources::{AudioSource, ExportedSource, Resolver, SourceContext, StreamInfo};

pub fn test_context() -> SourceContext {
    SourceContext::new(Arc::new(Config::default()))
}

pub fn test_resolver() -> Resolver {
    Resolver::new(test_context())
}

pub fn test_queue() -> QueueManager {
    QueueManager::new(test_resolver(), 999)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    None,
    Always,
    RateLimit,
}

/// Fuente en memoria con contadores
pub struct FakeSource {
    meta: Mutex<ExportedSource>,
    fail: Mutex<FailMode>,
    release: Mutex<Option<DateTime<Utc>>>,
    /// Hora de inicio que se descubre en el próximo `fetch`
    upcoming: Mutex<Option<DateTime<Utc>>>,
    cached: AtomicBool,
    pub fetches: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub disabled: AtomicUsize,
    pub inits: AtomicUsize,
}

impl FakeSource {
    pub fn new(url: &str, length: u64) -> Self {
        Self {
            meta: Mutex::new(ExportedSource {
                url: url.to_string(),
                title: url.to_string(),
                length,
                ..Default::default()
            }),
            fail: Mutex::new(FailMode::None),
            release: Mutex::new(None),
            upcoming: Mutex::new(None),
            cached: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            disabled: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
        }
    }

    pub fn failing(self, mode: FailMode) -> Self {
        *self.fail.lock() = mode;
        self
    }

    pub fn set_available_after(&self, at: Option<DateTime<Utc>>) {
        *self.release.lock() = at;
    }

    /// El próximo `fetch` descubre que es un directo que empieza en `at`
    pub fn upcoming_on_fetch(&self, at: DateTime<Utc>) {
        *self.upcoming.lock() = Some(at);
    }
}

#[async_trait]
impl AudioSource for FakeSource {
    fn service_identifier(&self) -> &'static str {
        "fake"
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.lock().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(known) = known {
            *self.meta.lock() = known;
        } else {
            self.meta.lock().url = url.to_string();
        }
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.cached.swap(true, Ordering::SeqCst) {
            self.cache_hits.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(at) = self.upcoming.lock().take() {
            *self.release.lock() = Some(at);
            return Err(SourceError::NotYetLive);
        }
        match *self.fail.lock() {
            FailMode::None => Ok(StreamInfo::url(self.url())),
            FailMode::Always => Err(SourceError::NoFormat),
            FailMode::RateLimit => Err(SourceError::RateLimited),
        }
    }

    fn disable_cache(&self) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
        self.cached.store(false, Ordering::SeqCst);
    }

    fn available_after(&self) -> Option<DateTime<Utc>> {
        *self.release.lock()
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn fake_entry(url: &str, user_id: &str, length: u64) -> QueueEntry {
    fake_entry_with(Arc::new(FakeSource::new(url, length)), user_id)
}

pub fn fake_entry_with(source: Arc<FakeSource>, user_id: &str) -> QueueEntry {
    QueueEntry::new(source, AddedBy::new(format!("user-{}", user_id), user_id))
}

/// Transporte de voz simulado
pub struct FakeTransport {
    connected: AtomicBool,
    /// Pasa a `Playing` en cuanto recibe un recurso
    auto_play: AtomicBool,
    status: watch::Sender<TransportStatus>,
    channel: Mutex<Option<u64>>,
    pub plays: AtomicUsize,
    pub stops: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub volume: Mutex<f32>,
    /// Demora antes de instalar el recurso en `play`
    play_delay: Mutex<Option<Duration>>,
    /// El recurso actual se retiene para no cerrar su canal de fin
    current: Mutex<Option<Normalizer>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            auto_play: AtomicBool::new(true),
            status: watch::channel(TransportStatus::Idle).0,
            channel: Mutex::new(Some(1)),
            plays: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            volume: Mutex::new(1.0),
            play_delay: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_auto_play(&self, enabled: bool) {
        self.auto_play.store(enabled, Ordering::SeqCst);
    }

    pub fn set_play_delay(&self, delay: Duration) {
        *self.play_delay.lock() = Some(delay);
    }

    pub fn has_resource(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn set_status(&self, status: TransportStatus) {
        self.status.send_replace(status);
    }

    pub fn current_status(&self) -> TransportStatus {
        self.status.borrow().clone()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join(&self, channel_id: u64) -> Result<(), PlayError> {
        *self.channel.lock() = Some(channel_id);
        self.set_connected(true);
        Ok(())
    }

    fn channel_id(&self) -> Option<u64> {
        *self.channel.lock()
    }

    async fn play(&self, pcm: Normalizer, volume: f32) -> Result<(), PlayError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let delay = *self.play_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.volume.lock() = volume;
        *self.current.lock() = Some(pcm);
        self.status.send_replace(if self.auto_play.load(Ordering::SeqCst) {
            TransportStatus::Playing
        } else {
            TransportStatus::Buffering
        });
        Ok(())
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.current.lock().take();
        self.status.send_replace(TransportStatus::Idle);
    }

    fn pause(&self) -> bool {
        self.status.send_replace(TransportStatus::Paused);
        true
    }

    fn resume(&self) -> bool {
        self.status.send_replace(TransportStatus::Playing);
        true
    }

    fn set_volume(&self, volume: f32) -> bool {
        *self.volume.lock() = volume;
        true
    }

    async fn position(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
        *self.channel.lock() = None;
    }
}

/// Resolver de streams que entrega PCM vacío y deja el fin en manos del test
#[derive(Default)]
pub struct FakeStreamResolver {
    enders: Mutex<Vec<oneshot::Sender<StreamEnd>>>,
    pub requests: Mutex<Vec<(u64, Vec<String>, Option<f32>)>>,
}

impl FakeStreamResolver {
    /// Marca como terminado el último recurso entregado
    pub fn finish_current(&self) -> bool {
        self.end_current(Ok(()))
    }

    /// Termina el último recurso como si ffmpeg hubiera fallado
    pub fn fail_current(&self, message: &str) -> bool {
        self.end_current(Err(message.to_string()))
    }

    fn end_current(&self, end: StreamEnd) -> bool {
        match self.enders.lock().pop() {
            Some(ender) => ender.send(end).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl StreamResolver for FakeStreamResolver {
    async fn resolve(&self, request: StreamRequest) -> Result<PlayableStream, PlayError> {
        self.requests
            .lock()
            .push((request.seek, request.effects.clone(), request.software_volume));
        let (ended_tx, ended_rx) = oneshot::channel();
        let (unused_tx, _) = oneshot::channel();
        self.enders.lock().push(ended_tx);
        Ok(PlayableStream {
            pcm: Normalizer::new(Box::new(std::io::empty()), request.software_volume, unused_tx),
            cost: 1,
            ended: ended_rx,
        })
    }
}

/// Espera (con límite) el primer evento que cumpla `pred`
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<PlayerEvent>,
    pred: impl Fn(&PlayerEvent) -> bool,
) -> PlayerEvent {
    let result = tokio::time::timeout(Duration::from_secs(1800), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("canal de eventos cerrado"),
            }
        }
    })
    .await;
    result.expect("el evento esperado no llegó")
}
