use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{self, QueueEvent};
use crate::error::QueueError;
use crate::sources::{youtube, AudioSource, ExportedSource, ResolveRequest, Resolver};

/// Intervalo (en items) entre reportes de progreso de una playlist
pub const PROGRESS_INTERVAL: usize = 50;

/// Quién agregó la canción
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedBy {
    pub display_name: String,
    pub user_id: String,
}

impl AddedBy {
    pub fn new(display_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            user_id: user_id.into(),
        }
    }

    /// Entradas agregadas por el propio bot (relacionadas, restauración)
    pub fn system() -> Self {
        Self::new("System", "0")
    }
}

#[derive(Clone)]
pub struct QueueEntry {
    pub basic_info: Arc<dyn AudioSource>,
    pub additional_info: AddedBy,
    pub added_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(basic_info: Arc<dyn AudioSource>, additional_info: AddedBy) -> Self {
        Self {
            basic_info,
            additional_info,
            added_at: Utc::now(),
        }
    }

    /// Misma fuente (identidad, no URL)
    pub fn same_source(&self, other: &QueueEntry) -> bool {
        Arc::ptr_eq(&self.basic_info, &other.basic_info)
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("source", &self.basic_info)
            .field("added_by", &self.additional_info.display_name)
            .finish()
    }
}

/// Sumidero de progreso para la ingesta de playlists
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaylistProgress: Send + Sync {
    async fn report(&self, processed: usize, total: usize);
}

/// Resultado de `add_queue`
#[derive(Debug, Clone)]
pub struct Added {
    pub index: usize,
    pub entry: QueueEntry,
    pub cancellable: bool,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    loop_enabled: bool,
    queue_loop_enabled: bool,
    once_loop_enabled: bool,
}

/// Cola de reproducción de una guild. El índice 0 es la canción actual.
pub struct QueueManager {
    state: Mutex<QueueState>,
    resolver: Resolver,
    max_size: usize,
    /// El índice 0 está enlazado al transporte de voz
    head_in_use: AtomicBool,
    add_related: AtomicBool,
    equally_playback: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    pub fn new(resolver: Resolver, max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            resolver,
            max_size,
            head_in_use: AtomicBool::new(false),
            add_related: AtomicBool::new(false),
            equally_playback: AtomicBool::new(false),
            events: events::queue_channel(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // sin suscriptores no es un error
        let _ = self.events.send(event);
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    // --- Estado ---

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<QueueEntry> {
        self.state.lock().entries.get(index).cloned()
    }

    pub fn head(&self) -> Option<QueueEntry> {
        self.get(0)
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    /// Duración total en segundos
    pub fn length_seconds(&self) -> u64 {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.basic_info.length_seconds())
            .sum()
    }

    pub(crate) fn set_head_in_use(&self, in_use: bool) {
        self.head_in_use.store(in_use, Ordering::SeqCst);
    }

    fn protected_prefix(&self) -> usize {
        usize::from(self.head_in_use.load(Ordering::SeqCst))
    }

    // --- Modos ---

    pub fn loop_enabled(&self) -> bool {
        self.state.lock().loop_enabled
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.state.lock().loop_enabled = enabled;
        info!("🔂 Repetir canción: {}", enabled);
    }

    pub fn queue_loop_enabled(&self) -> bool {
        self.state.lock().queue_loop_enabled
    }

    pub fn set_queue_loop_enabled(&self, enabled: bool) {
        self.state.lock().queue_loop_enabled = enabled;
        info!("🔁 Repetir cola: {}", enabled);
    }

    pub fn once_loop_enabled(&self) -> bool {
        self.state.lock().once_loop_enabled
    }

    pub fn set_once_loop_enabled(&self, enabled: bool) {
        self.state.lock().once_loop_enabled = enabled;
        info!("🔂 Repetir una vez: {}", enabled);
    }

    pub fn add_related(&self) -> bool {
        self.add_related.load(Ordering::SeqCst)
    }

    pub fn set_add_related(&self, enabled: bool) {
        self.add_related.store(enabled, Ordering::SeqCst);
    }

    pub fn equally_playback(&self) -> bool {
        self.equally_playback.load(Ordering::SeqCst)
    }

    pub fn set_equally_playback(&self, enabled: bool) {
        self.equally_playback.store(enabled, Ordering::SeqCst);
        if enabled {
            self.sort_with_added_by();
        }
    }

    // --- Agregar ---

    fn insert(&self, entry: QueueEntry, first: bool) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        if state.entries.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }
        let index = if first {
            self.protected_prefix().min(state.entries.len())
        } else {
            state.entries.len()
        };
        state.entries.insert(index, entry);
        Ok(index)
    }

    /// Resuelve y agrega una canción (al final, o la siguiente si `first`).
    pub async fn add_queue(
        &self,
        request: ResolveRequest,
        added_by: AddedBy,
        first: bool,
        cancellable: bool,
    ) -> Result<Added, QueueError> {
        if self.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }

        let url = request.url.clone();
        let source = self
            .resolver
            .resolve(request)
            .await?
            .ok_or(QueueError::Unrecognized(url))?;
        let entry = QueueEntry::new(source, added_by);
        let index = self.insert(entry.clone(), first)?;

        info!("➕ Agregado a la cola [{}]: {}", index, entry.basic_info.title());
        self.emit(if index == 0 {
            QueueEvent::Change
        } else {
            QueueEvent::ChangeWithoutCurrent
        });
        if self.equally_playback() {
            self.sort_with_added_by();
        }

        Ok(Added {
            index,
            entry,
            cancellable,
        })
    }

    /// Agrega sin notificar (restauración de cola)
    pub fn add_queue_only(&self, entry: QueueEntry) -> Result<usize, QueueError> {
        self.insert(entry, false)
    }

    /// Ingesta de playlist: respeta la cancelación y el tope de tamaño, y reporta
    /// el progreso cada [`PROGRESS_INTERVAL`] items.
    pub async fn process_playlist(
        &self,
        items: Vec<ExportedSource>,
        kind: &str,
        added_by: AddedBy,
        first: bool,
        cancellation: &CancellationToken,
        progress: &dyn PlaylistProgress,
    ) -> Result<usize, QueueError> {
        let total = items.len();
        let mut added = 0;
        let mut insert_at = first.then(|| self.protected_prefix().min(self.len()));

        for (processed, item) in items.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                info!("🛑 Ingesta de playlist cancelada tras {} items", processed);
                break;
            }
            if self.len() >= self.max_size {
                warn!("📦 Cola llena ({}), playlist truncada", self.max_size);
                break;
            }

            match self.resolver.resolve(ResolveRequest::restore(kind, item)).await {
                Ok(Some(source)) => {
                    let entry = QueueEntry::new(source, added_by.clone());
                    let mut state = self.state.lock();
                    match insert_at.as_mut() {
                        Some(index) => {
                            state.entries.insert(*index, entry);
                            *index += 1;
                        }
                        None => state.entries.push_back(entry),
                    }
                    added += 1;
                }
                Ok(None) => debug!("playlist: item no reconocido"),
                Err(e) => warn!("⚠️ playlist: item omitido: {}", e),
            }

            if (processed + 1) % PROGRESS_INTERVAL == 0 {
                progress.report(processed + 1, total).await;
            }
        }

        if added > 0 {
            self.emit(QueueEvent::Change);
            if self.equally_playback() {
                self.sort_with_added_by();
            }
        }
        info!("📋 Playlist: {} de {} agregadas", added, total);
        Ok(added)
    }

    // --- Avance ---

    /// Avanza la cola tras terminar (o abandonar) la canción actual.
    ///
    /// - `loop_enabled`: sin cambios
    /// - `queue_loop_enabled`: la actual pasa al final
    /// - en otro caso se elimina la actual
    pub fn next(&self) {
        {
            let mut state = self.state.lock();
            if state.loop_enabled {
                debug!("🔂 next(): repetición activa, sin cambios");
                return;
            }
            if let Some(head) = state.entries.pop_front() {
                if state.queue_loop_enabled {
                    state.entries.push_back(head);
                }
            }
        }
        self.emit(QueueEvent::Change);
    }

    /// `next()` + reordenado equitativo + canción relacionada si la cola quedó vacía.
    pub async fn advance(&self) {
        let finished = self.head();
        self.next();

        if self.equally_playback() {
            self.sort_with_added_by();
        }

        if self.is_empty() && self.add_related() {
            if let Some(finished) = finished.filter(|f| f.basic_info.service_identifier() == youtube::SERVICE) {
                self.enqueue_related(&finished).await;
            }
        }
    }

    async fn enqueue_related(&self, finished: &QueueEntry) {
        let ctx = self.resolver.context();
        let related = match youtube::related(ctx, &finished.basic_info.export_data()).await {
            Ok(Some(related)) => related,
            Ok(None) => return,
            Err(e) => {
                warn!("⚠️ No se pudo buscar una canción relacionada: {}", e);
                return;
            }
        };
        let request = ResolveRequest::restore(youtube::SERVICE, related);
        if let Err(e) = self.add_queue(request, AddedBy::system(), false, false).await {
            warn!("⚠️ No se pudo agregar la canción relacionada: {}", e);
        }
    }

    // --- Edición ---

    pub fn move_entry(&self, from: usize, to: usize) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let len = state.entries.len();
            if from >= len || to >= len {
                return Err(QueueError::OutOfRange {
                    index: from.max(to),
                    len,
                });
            }
            if from == to {
                return Ok(());
            }
            let protected = self.protected_prefix();
            if from < protected || to < protected {
                return Err(QueueError::CurrentlyPlaying);
            }
            if let Some(entry) = state.entries.remove(from) {
                state.entries.insert(to, entry);
            }
        }
        debug!("📍 Canción movida de {} a {}", from, to);
        self.emit(if from == 0 || to == 0 {
            QueueEvent::Change
        } else {
            QueueEvent::ChangeWithoutCurrent
        });
        Ok(())
    }

    pub fn remove_at(&self, index: usize) -> Result<QueueEntry, QueueError> {
        let removed = {
            let mut state = self.state.lock();
            let len = state.entries.len();
            if index < self.protected_prefix() && index < len {
                return Err(QueueError::CurrentlyPlaying);
            }
            state
                .entries
                .remove(index)
                .ok_or(QueueError::OutOfRange { index, len })?
        };
        debug!("❌ Canción eliminada en posición {}", index);
        self.emit(if index == 0 {
            QueueEvent::Change
        } else {
            QueueEvent::ChangeWithoutCurrent
        });
        Ok(removed)
    }

    /// Elimina todo (menos la actual si está sonando)
    pub fn remove_all(&self) {
        let keep = self.protected_prefix();
        self.state.lock().entries.truncate(keep);
        info!("🗑️ Cola limpiada");
        self.emit(if keep == 0 {
            QueueEvent::Change
        } else {
            QueueEvent::ChangeWithoutCurrent
        });
    }

    /// Elimina las canciones de un usuario; devuelve cuántas
    pub fn remove_by_user(&self, user_id: &str) -> usize {
        let keep = self.protected_prefix();
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            let mut index = 0;
            state.entries.retain(|entry| {
                let retain = index < keep || entry.additional_info.user_id != user_id;
                index += 1;
                retain
            });
            before - state.entries.len()
        };
        if removed > 0 {
            info!("🗑️ Eliminadas {} canciones del usuario {}", removed, user_id);
            self.emit(QueueEvent::ChangeWithoutCurrent);
        }
        removed
    }

    /// Mezcla la cola (la actual se queda en su sitio si está sonando)
    pub fn shuffle(&self) {
        let keep = self.protected_prefix();
        {
            let mut state = self.state.lock();
            if state.entries.len() <= keep + 1 {
                return;
            }
            let entries = state.entries.make_contiguous();
            entries[keep..].shuffle(&mut rand::thread_rng());
        }
        info!("🔀 Cola mezclada");
        self.emit(if keep == 0 {
            QueueEvent::Change
        } else {
            QueueEvent::ChangeWithoutCurrent
        });
    }

    /// Reordena las canciones en espera alternando entre quienes las agregaron.
    pub fn sort_with_added_by(&self) {
        let keep = self.protected_prefix();
        let changed = {
            let mut state = self.state.lock();
            if state.entries.len() <= keep + 1 {
                return;
            }
            let waiting: Vec<QueueEntry> = state.entries.drain(keep..).collect();

            let mut order: Vec<String> = Vec::new();
            let mut by_user: HashMap<String, VecDeque<QueueEntry>> = HashMap::new();
            for entry in waiting.iter().cloned() {
                let user = entry.additional_info.user_id.clone();
                if !by_user.contains_key(&user) {
                    order.push(user.clone());
                }
                by_user.entry(user).or_default().push_back(entry);
            }

            let mut sorted = Vec::with_capacity(waiting.len());
            while sorted.len() < waiting.len() {
                for user in &order {
                    if let Some(entry) = by_user.get_mut(user).and_then(VecDeque::pop_front) {
                        sorted.push(entry);
                    }
                }
            }

            let changed = sorted.iter().zip(&waiting).any(|(a, b)| !a.same_source(b));
            state.entries.extend(sorted);
            changed
        };
        if changed {
            debug!("⚖️ Cola reordenada por usuario");
            self.emit(QueueEvent::ChangeWithoutCurrent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{fake_entry, test_queue};
    use pretty_assertions::assert_eq;

    fn urls(queue: &QueueManager) -> Vec<String> {
        queue.entries().iter().map(|e| e.basic_info.url()).collect()
    }

    fn fill(queue: &QueueManager, users: &[(&str, &str)]) {
        for (url, user) in users {
            queue.add_queue_only(fake_entry(url, user, 10)).unwrap();
        }
    }

    #[test]
    fn test_next_moves_second_entry_to_head() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u"), ("c", "u")]);
        queue.move_entry(2, 1).unwrap();
        queue.remove_at(2).unwrap();
        let second = queue.get(1).unwrap();
        queue.next();
        assert!(queue.head().unwrap().same_source(&second));
        assert_eq!(urls(&queue), vec!["c"]);
    }

    #[test]
    fn test_next_with_loop_keeps_head() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u")]);
        queue.set_loop_enabled(true);
        queue.next();
        assert_eq!(urls(&queue), vec!["a", "b"]);
    }

    #[test]
    fn test_queue_loop_rotates() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u"), ("c", "u")]);
        queue.set_queue_loop_enabled(true);
        queue.next();
        assert_eq!(urls(&queue), vec!["b", "c", "a"]);

        let single = test_queue();
        fill(&single, &[("only", "u")]);
        single.set_queue_loop_enabled(true);
        single.next();
        assert_eq!(urls(&single), vec!["only"]);
    }

    #[test]
    fn test_next_emits_change() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u")]);
        let mut rx = queue.subscribe();
        queue.next();
        assert_eq!(rx.try_recv().unwrap(), QueueEvent::Change);
        queue.move_entry(0, 0).unwrap();
        queue.remove_at(0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), QueueEvent::Change);
    }

    #[test]
    fn test_head_is_protected_while_playing() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u"), ("c", "u")]);
        queue.set_head_in_use(true);

        assert!(matches!(queue.remove_at(0), Err(QueueError::CurrentlyPlaying)));
        assert!(matches!(queue.move_entry(2, 0), Err(QueueError::CurrentlyPlaying)));
        assert!(matches!(queue.remove_at(9), Err(QueueError::OutOfRange { index: 9, len: 3 })));

        queue.remove_all();
        assert_eq!(urls(&queue), vec!["a"]);
    }

    #[test]
    fn test_remove_by_user_and_length() {
        let queue = test_queue();
        fill(&queue, &[("a", "1"), ("b", "2"), ("c", "1"), ("d", "2")]);
        assert_eq!(queue.length_seconds(), 40);
        assert_eq!(queue.remove_by_user("1"), 2);
        assert_eq!(urls(&queue), vec!["b", "d"]);
    }

    #[test]
    fn test_sort_with_added_by_round_robin() {
        let queue = test_queue();
        fill(
            &queue,
            &[("now", "1"), ("a1", "1"), ("a2", "1"), ("a3", "1"), ("b1", "2"), ("c1", "3"), ("b2", "2")],
        );
        queue.set_head_in_use(true);
        queue.set_equally_playback(true);
        assert_eq!(urls(&queue), vec!["now", "a1", "b1", "c1", "a2", "b2", "a3"]);
    }

    #[test]
    fn test_shuffle_keeps_current() {
        let queue = test_queue();
        let names: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        for name in &names {
            queue.add_queue_only(fake_entry(name, "u", 1)).unwrap();
        }
        queue.set_head_in_use(true);
        queue.shuffle();
        let after = urls(&queue);
        assert_eq!(after[0], "t0");
        let mut sorted = after.clone();
        sorted.sort();
        let mut expected = names.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[tokio::test]
    async fn test_add_queue_rejects_unrecognized() {
        let queue = test_queue();
        let result = queue
            .add_queue(ResolveRequest::unknown("just some words"), AddedBy::system(), false, false)
            .await;
        assert!(matches!(result, Err(QueueError::Unrecognized(_))));
    }

    #[tokio::test]
    async fn test_add_queue_first_goes_after_current() {
        let queue = test_queue();
        fill(&queue, &[("a", "u"), ("b", "u")]);
        queue.set_head_in_use(true);
        let known = ExportedSource {
            url: "https://example.com/next.mp3".into(),
            title: "next".into(),
            ..Default::default()
        };
        let added = queue
            .add_queue(ResolveRequest::restore("custom", known), AddedBy::new("n", "9"), true, true)
            .await
            .unwrap();
        assert_eq!(added.index, 1);
        assert!(added.cancellable);
        assert_eq!(urls(&queue), vec!["a", "https://example.com/next.mp3", "b"]);
    }

    fn playlist_items(count: usize) -> Vec<ExportedSource> {
        (0..count)
            .map(|i| ExportedSource {
                url: format!("https://example.com/{}.mp3", i),
                title: format!("{}", i),
                length: 60,
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_process_playlist_reports_coarse_progress() {
        let queue = test_queue();
        let mut progress = MockPlaylistProgress::new();
        progress.expect_report().withf(|p, t| *p == 50 && *t == 120).times(1).return_const(());
        progress.expect_report().withf(|p, t| *p == 100 && *t == 120).times(1).return_const(());

        let token = CancellationToken::new();
        let added = queue
            .process_playlist(playlist_items(120), "custom", AddedBy::system(), false, &token, &progress)
            .await
            .unwrap();
        assert_eq!(added, 120);
        assert_eq!(queue.len(), 120);
    }

    #[tokio::test]
    async fn test_process_playlist_respects_cancellation_and_cap() {
        let queue = QueueManager::new(crate::audio::testing::test_resolver(), 10);
        let mut progress = MockPlaylistProgress::new();
        progress.expect_report().never();

        let token = CancellationToken::new();
        let added = queue
            .process_playlist(playlist_items(30), "custom", AddedBy::system(), false, &token, &progress)
            .await
            .unwrap();
        assert_eq!(added, 10);

        let other = test_queue();
        token.cancel();
        let added = other
            .process_playlist(playlist_items(30), "custom", AddedBy::system(), false, &token, &progress)
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert!(other.is_empty());
    }
}
