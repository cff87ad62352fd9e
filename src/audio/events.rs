//! Notificaciones del ciclo de vida de la cola y del reproductor.
//!
//! Cada contenedor de guild publica en canales `broadcast`; la UI y el
//! backup se suscriben de forma independiente.

use tokio::sync::broadcast;

/// Cambios de contenido de la cola
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Cambió el contenido, incluida la canción actual
    Change,
    /// Cambió el contenido sin afectar a la canción actual
    ChangeWithoutCurrent,
}

/// Transiciones del reproductor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    PlayCalled { seek: u64 },
    Preparing { url: String },
    WaitingForLive { url: String, wait_secs: u64 },
    LiveWaitCancelled { url: String },
    Started { url: String, quiet: bool },
    Completed { url: String },
    Failed { url: String, error: String, will_skip: bool },
    RateLimited { url: String },
    Stop,
    Pause,
    Resume,
    Rewind,
    QueueEmpty,
    IdleDisconnect,
    DisconnectAttempt,
    Disconnect,
}

pub const EVENT_CAPACITY: usize = 64;

pub fn queue_channel() -> broadcast::Sender<QueueEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

pub fn player_channel() -> broadcast::Sender<PlayerEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
