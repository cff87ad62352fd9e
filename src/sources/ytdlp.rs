use async_process::Command;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{AudioSource, ChildReader, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

/// Información extraída de yt-dlp (`--dump-single-json`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YtDlpInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub uploader_url: Option<String>,
    pub channel: Option<String>,
    pub channel_url: Option<String>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub format_id: Option<String>,
    pub is_live: Option<bool>,
    pub live_status: Option<String>,
    pub release_timestamp: Option<i64>,
    pub formats: Option<Vec<YtDlpFormat>>,
    pub http_headers: Option<HashMap<String, String>>,
    pub entries: Option<Vec<YtDlpInfo>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct YtDlpFormat {
    #[serde(default)]
    pub format_id: String,
    pub format_note: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub abr: Option<f64>,
    pub protocol: Option<String>,
    pub http_headers: Option<HashMap<String, String>>,
}

impl YtDlpFormat {
    pub fn user_agent(&self) -> Option<String> {
        self.http_headers.as_ref()?.get("User-Agent").cloned()
    }

    fn is_audio_only(&self) -> bool {
        self.format_note.as_deref() == Some("tiny")
            || (self.vcodec.as_deref() == Some("none") && self.abr.is_some())
    }

    fn is_direct(&self) -> bool {
        matches!(self.protocol.as_deref(), None | Some("https") | Some("http"))
    }
}

impl YtDlpInfo {
    pub fn is_live_now(&self) -> bool {
        self.is_live == Some(true) || self.live_status.as_deref() == Some("is_live")
    }

    pub fn is_upcoming(&self) -> bool {
        self.live_status.as_deref() == Some("is_upcoming")
    }

    pub fn release_time(&self) -> Option<DateTime<Utc>> {
        if !self.is_upcoming() {
            return None;
        }
        DateTime::from_timestamp(self.release_timestamp?, 0)
    }

    /// Formato de solo audio con mayor bitrate, descargable por HTTP.
    pub fn best_audio(&self) -> Option<&YtDlpFormat> {
        self.formats
            .as_deref()?
            .iter()
            .filter(|f| f.url.is_some() && f.is_direct() && f.is_audio_only())
            .max_by(|a, b| {
                a.abr
                    .unwrap_or(0.0)
                    .partial_cmp(&b.abr.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Formato elegido por yt-dlp para una emisión en vivo.
    pub fn live_format(&self) -> Option<(String, Option<String>)> {
        let chosen = self.format_id.as_deref();
        self.formats
            .as_deref()
            .and_then(|formats| formats.iter().find(|f| Some(f.format_id.as_str()) == chosen))
            .and_then(|f| Some((f.url.clone()?, f.user_agent())))
            .or_else(|| {
                let ua = self.http_headers.as_ref().and_then(|h| h.get("User-Agent").cloned());
                Some((self.url.clone()?, ua))
            })
    }

    /// URL de una entrada de playlist plana.
    pub fn entry_url(&self) -> Option<String> {
        self.webpage_url.clone().or_else(|| self.url.clone())
    }

    pub fn to_exported(&self, url: &str) -> ExportedSource {
        ExportedSource {
            url: url.to_string(),
            title: self.title.clone(),
            length: self.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
            description: self.description.clone(),
            thumbnail: self.thumbnail.clone(),
            channel: self.channel.clone().or_else(|| self.uploader.clone()),
            channel_url: self.channel_url.clone().or_else(|| self.uploader_url.clone()),
            artist: None,
            is_live: Some(self.is_live_now() || self.is_upcoming()),
        }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>, SourceError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::from_process(program, &stderr));
    }
    Ok(output.stdout)
}

/// Metadatos completos (incluye formatos) de una URL
pub async fn dump_json(program: &str, url: &str) -> Result<YtDlpInfo, SourceError> {
    debug!("📊 Obteniendo info de: {}", url);
    let stdout = run(
        program,
        &["--skip-download", "--dump-single-json", "--no-playlist", "--no-warnings", url],
    )
    .await?;
    Ok(serde_json::from_slice(&stdout)?)
}

/// Entradas de una playlist sin resolver cada video
pub async fn flat_playlist(
    program: &str,
    url: &str,
    limit: usize,
) -> Result<Vec<YtDlpInfo>, SourceError> {
    info!("📋 Obteniendo playlist: {}", url);
    let end = limit.to_string();
    let stdout = run(
        program,
        &[
            "--flat-playlist",
            "--dump-single-json",
            "--playlist-end",
            &end,
            "--no-warnings",
            url,
        ],
    )
    .await?;
    let info: YtDlpInfo = serde_json::from_slice(&stdout)?;
    Ok(info.entries.unwrap_or_default())
}

/// Busca en YouTube
pub async fn search(program: &str, query: &str, limit: usize) -> Result<Vec<YtDlpInfo>, SourceError> {
    info!("🔍 Buscando en YouTube: {}", query);
    let search_query = format!("ytsearch{}:{}", limit, query);
    let stdout = run(
        program,
        &["--flat-playlist", "--dump-single-json", "--no-warnings", &search_query],
    )
    .await?;
    let info: YtDlpInfo = serde_json::from_slice(&stdout)?;
    Ok(info.entries.unwrap_or_default())
}

/// yt-dlp escribiendo el audio a stdout.
pub fn pipe(program: &str, url: &str) -> Result<ChildReader, SourceError> {
    let mut command = std::process::Command::new(program);
    command.args(["-f", "bestaudio/best", "-o", "-", "--quiet", "--no-warnings", "--no-playlist", url]);
    ChildReader::spawn(command)
}

/// Fuente genérica respaldada por yt-dlp, con caché del JSON de metadatos.
pub struct YtDlpSource {
    service: &'static str,
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
    cache: Mutex<Option<Arc<YtDlpInfo>>>,
    release: RwLock<Option<DateTime<Utc>>>,
}

impl YtDlpSource {
    pub fn new(service: &'static str, ctx: SourceContext) -> Self {
        Self {
            service,
            ctx,
            meta: RwLock::new(ExportedSource::default()),
            cache: Mutex::new(None),
            release: RwLock::new(None),
        }
    }

    fn program(&self) -> &str {
        &self.ctx.config.ytdlp_path
    }

    /// JSON cacheado, o uno nuevo si la caché está vacía
    pub async fn info(&self) -> Result<Arc<YtDlpInfo>, SourceError> {
        if let Some(cached) = self.cache.lock().clone() {
            debug!("[{}] usando caché sin consultar", self.service);
            return Ok(cached);
        }

        let url = self.meta.read().url.clone();
        if url.is_empty() {
            return Err(SourceError::NotInitialized);
        }

        let info = Arc::new(dump_json(self.program(), &url).await?);
        *self.meta.write() = info.to_exported(&url);
        *self.release.write() = info.release_time();
        *self.cache.lock() = Some(info.clone());
        Ok(info)
    }

    pub fn has_cache(&self) -> bool {
        self.cache.lock().is_some()
    }
}

#[async_trait]
impl AudioSource for YtDlpSource {
    fn service_identifier(&self) -> &'static str {
        self.service
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        match known {
            Some(known) => {
                *self.meta.write() = ExportedSource {
                    url: url.to_string(),
                    ..known
                };
                Ok(())
            }
            None => {
                self.meta.write().url = url.to_string();
                self.info().await.map(|_| ())
            }
        }
    }

    async fn fetch(&self, force_url: bool) -> Result<StreamInfo, SourceError> {
        let info = self.info().await?;

        // entradas creadas con datos conocidos no traen la hora de inicio
        if info.is_upcoming() {
            *self.release.write() = info.release_time();
            return Err(SourceError::NotYetLive);
        }

        if info.is_live_now() {
            let (url, user_agent) = info.live_format().ok_or(SourceError::NoFormat)?;
            return Ok(StreamInfo::Url {
                url,
                user_agent,
                stream_type: StreamType::Hls,
            });
        }

        if let Some(format) = info.best_audio() {
            let url = format.url.clone().ok_or(SourceError::NoFormat)?;
            let stream_type = StreamType::from_format(format.ext.as_deref(), format.acodec.as_deref());
            if force_url {
                return Ok(StreamInfo::Url {
                    url,
                    user_agent: format.user_agent(),
                    stream_type,
                });
            }
            let headers = format
                .http_headers
                .as_ref()
                .map(|h| reqwest::header::HeaderMap::try_from(h).unwrap_or_default())
                .unwrap_or_default();
            let reader = self
                .ctx
                .http_reader(self.service, self.ctx.http.get(&url).headers(headers))
                .await?;
            return Ok(StreamInfo::Readable { reader, stream_type });
        }

        // Sin formato de audio directo (HLS, DASH...): se delega en yt-dlp
        if let Some(url) = info.url.clone() {
            let user_agent = info.http_headers.as_ref().and_then(|h| h.get("User-Agent").cloned());
            return Ok(StreamInfo::Url {
                url,
                user_agent,
                stream_type: StreamType::from_format(info.ext.as_deref(), None),
            });
        }
        if force_url {
            return Err(SourceError::NoFormat);
        }
        let reader = pipe(self.program(), &self.url())?;
        Ok(StreamInfo::Readable {
            reader: Box::new(reader),
            stream_type: StreamType::Unknown,
        })
    }

    fn disable_cache(&self) {
        if self.cache.lock().take().is_some() {
            debug!("[{}] caché descartada", self.service);
        }
    }

    fn available_after(&self) -> Option<DateTime<Utc>> {
        *self.release.read()
    }
}
