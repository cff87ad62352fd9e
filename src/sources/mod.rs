//! Audio sources.
//!
//! Every backend implements [`AudioSource`]: a fixed capability set
//! (`init`, `fetch`, `export_data`, `disable_cache`) plus presentation
//! metadata. The [`resolver`] maps a URL or type hint onto the right backend.
//!
//! `fetch` is only valid after a successful `init`.

pub mod bestdori;
pub mod custom;
pub mod fs;
pub mod googledrive;
pub mod hibiki;
pub mod niconico;
pub mod resolver;
pub mod soundcloud;
pub mod spotify;
pub mod streamable;
pub mod twitter;
pub mod youtube;
pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

use crate::config::Config;
use crate::error::SourceError;

pub use resolver::{ResolveRequest, Resolver};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Snapshot serializable de una fuente (persistencia, backup y `known_data`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSource {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
}

/// Pista de contenedor para el transcodificador.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Unknown,
    WebmOpus,
    Ogg,
    Mp3,
    Mp4,
    Hls,
}

impl StreamType {
    pub fn from_format(ext: Option<&str>, acodec: Option<&str>) -> Self {
        match (ext, acodec) {
            (Some("webm"), Some("opus")) => StreamType::WebmOpus,
            (Some("ogg"), _) | (Some("opus"), _) => StreamType::Ogg,
            (Some("mp3"), _) => StreamType::Mp3,
            (Some("m4a"), _) | (Some("mp4"), _) => StreamType::Mp4,
            _ => StreamType::Unknown,
        }
    }

    /// Demuxer explícito para ffmpeg cuando la entrada llega por pipe.
    pub fn ffmpeg_demuxer(&self) -> Option<&'static str> {
        match self {
            StreamType::WebmOpus => Some("webm"),
            StreamType::Ogg => Some("ogg"),
            StreamType::Mp3 => Some("mp3"),
            _ => None,
        }
    }
}

/// Descriptor de stream devuelto por [`AudioSource::fetch`].
pub enum StreamInfo {
    Url {
        url: String,
        user_agent: Option<String>,
        stream_type: StreamType,
    },
    Readable {
        reader: Box<dyn Read + Send>,
        stream_type: StreamType,
    },
}

impl StreamInfo {
    pub fn url(url: impl Into<String>) -> Self {
        StreamInfo::Url {
            url: url.into(),
            user_agent: None,
            stream_type: StreamType::Unknown,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, StreamInfo::Readable { .. })
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            StreamInfo::Url { stream_type, .. } | StreamInfo::Readable { stream_type, .. } => {
                *stream_type
            }
        }
    }
}

impl fmt::Debug for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamInfo::Url { url, user_agent, stream_type } => f
                .debug_struct("Url")
                .field("url", url)
                .field("user_agent", user_agent)
                .field("stream_type", stream_type)
                .finish(),
            StreamInfo::Readable { stream_type, .. } => f
                .debug_struct("Readable")
                .field("stream_type", stream_type)
                .finish_non_exhaustive(),
        }
    }
}

/// Contrato común de todos los backends de audio.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Identificador del servicio (`youtube`, `soundcloud`, ...)
    fn service_identifier(&self) -> &'static str;

    /// Metadatos actuales de la fuente
    fn snapshot(&self) -> ExportedSource;

    /// Inicializa la fuente; `known` evita la consulta de metadatos a la red.
    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError>;

    /// Obtiene el stream. `force_url` pide una entrega por URL con soporte de rangos.
    async fn fetch(&self, force_url: bool) -> Result<StreamInfo, SourceError>;

    /// Descarta respuestas de la API cacheadas
    fn disable_cache(&self) {}

    /// Momento a partir del cual una emisión en vivo programada estará disponible
    fn available_after(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn export_data(&self) -> ExportedSource {
        self.snapshot()
    }

    fn url(&self) -> String {
        self.snapshot().url
    }

    fn title(&self) -> String {
        self.snapshot().title
    }

    fn description(&self) -> String {
        self.snapshot().description.unwrap_or_default()
    }

    fn length_seconds(&self) -> u64 {
        self.snapshot().length
    }

    fn thumbnail(&self) -> Option<String> {
        self.snapshot().thumbnail
    }

    fn is_live(&self) -> bool {
        self.snapshot().is_live.unwrap_or(false)
    }
}

impl fmt::Debug for dyn AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("service", &self.service_identifier())
            .field("url", &self.url())
            .finish()
    }
}

/// Dependencias compartidas por los backends.
#[derive(Clone)]
pub struct SourceContext {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    /// Cliente de Spotify, autenticado en el primer uso
    pub(crate) spotify: Arc<tokio::sync::OnceCell<rspotify::ClientCredsSpotify>>,
}

impl SourceContext {
    pub fn new(config: Arc<Config>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            spotify: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// GET + comprobación de estado + JSON.
    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        service: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, SourceError> {
        let response = request.timeout(Duration::from_secs(30)).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::from_status(service, response.status()));
        }
        Ok(response.json().await?)
    }

    /// Abre un GET como lector síncrono para el transcodificador.
    pub(crate) async fn http_reader(
        &self,
        service: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Box<dyn Read + Send>, SourceError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SourceError::from_status(service, response.status()));
        }
        let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(SyncIoBridge::new(StreamReader::new(body))))
    }
}

/// stdout de un proceso hijo; el proceso se mata al soltar el lector.
pub struct ChildReader {
    program: String,
    child: Child,
    stdout: ChildStdout,
}

impl ChildReader {
    pub fn spawn(mut command: Command) -> Result<Self, SourceError> {
        let program = command.get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| SourceError::Process {
            program: program.clone(),
            stderr: "stdout no disponible".to_string(),
        })?;
        debug!("🔧 Proceso {} iniciado (pid {})", program, child.id());
        Ok(Self { program, child, stdout })
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        debug!("🧹 Proceso {} liberado", self.program);
    }
}

/// Último segmento del path de una URL, decodificado.
pub(crate) fn file_name_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    urlencoding::decode(segment).ok().map(|s| s.into_owned())
}
