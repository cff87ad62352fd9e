//! Errores tipados de las costuras principales (fuentes, cola, reproducción).
//!
//! El código "pegamento" (comandos, main, restauración) sigue usando
//! `anyhow::Result`; aquí solo viven los errores que el núcleo necesita
//! clasificar para decidir entre reintentar, saltar o detener.

use thiserror::Error;

/// Errores producidos por un [`AudioSource`](crate::sources::AudioSource) o el resolver.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("URL inválida para {service}: {url}")]
    InvalidUrl { service: &'static str, url: String },

    #[error("fuente no soportada o deshabilitada: {0}")]
    Unsupported(String),

    #[error("la fuente no fue inicializada")]
    NotInitialized,

    #[error("error de la API de {service}: {message}")]
    Api { service: &'static str, message: String },

    #[error("límite de peticiones alcanzado (HTTP 429)")]
    RateLimited,

    #[error("no se encontró un formato reproducible")]
    NoFormat,

    #[error("el directo todavía no empezó")]
    NotYetLive,

    #[error("{program} terminó con error: {stderr}")]
    Process { program: String, stderr: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SourceError {
    /// Construye el error de un proceso externo, detectando el 429 de yt-dlp.
    pub fn from_process(program: &str, stderr: &str) -> Self {
        if stderr.contains("HTTP Error 429") || stderr.contains("Too Many Requests") {
            return SourceError::RateLimited;
        }
        SourceError::Process {
            program: program.to_string(),
            stderr: stderr.trim().to_string(),
        }
    }

    /// Convierte una respuesta HTTP no exitosa en error, clasificando el 429.
    pub fn from_status(service: &'static str, status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SourceError::RateLimited
        } else {
            SourceError::Api {
                service,
                message: format!("estado HTTP {}", status),
            }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        match self {
            SourceError::RateLimited => true,
            SourceError::Http(e) => e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS),
            _ => false,
        }
    }
}

/// Errores del ciclo de reproducción.
#[derive(Debug, Error)]
pub enum PlayError {
    #[error("no hay conexión de voz")]
    NotConnected,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("error de transcodificación: {0}")]
    Transcode(String),

    #[error("error del transporte de voz: {0}")]
    Transport(String),
}

impl PlayError {
    /// Clasificación estructurada del límite de peticiones (no se reintenta).
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PlayError::Source(e) if e.is_rate_limit())
    }
}

/// Errores de operaciones sobre la cola.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("índice fuera de rango: {index} (longitud {len})")]
    OutOfRange { index: usize, len: usize },

    #[error("la cola está llena (máximo {0} canciones)")]
    Full(usize),

    #[error("la canción actual no se puede modificar mientras se reproduce")]
    CurrentlyPlaying,

    #[error("no es una fuente reconocida: {0}")]
    Unrecognized(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}
