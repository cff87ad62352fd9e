use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use super::{AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "streamable";

#[derive(Debug, Clone, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    thumbnail_url: Option<String>,
    #[serde(default)]
    files: HashMap<String, VideoFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct VideoFile {
    url: Option<String>,
    duration: Option<f64>,
}

impl VideoInfo {
    fn best_file(&self) -> Option<&VideoFile> {
        self.files
            .get("mp4")
            .or_else(|| self.files.get("mp4-mobile"))
            .or_else(|| self.files.values().next())
            .filter(|f| f.url.is_some())
    }
}

/// `streamable.com/<id>`
pub fn video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.host_str()?, "streamable.com" | "www.streamable.com") {
        return None;
    }
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let id = segments.next()?;
    (segments.next().is_none() && id.chars().all(|c| c.is_ascii_alphanumeric())).then(|| id.to_string())
}

fn absolute(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{}", url)
    } else {
        url.to_string()
    }
}

pub struct Streamable {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
    cache: Mutex<Option<VideoInfo>>,
}

impl Streamable {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
            cache: Mutex::new(None),
        }
    }

    async fn video_info(&self) -> Result<VideoInfo, SourceError> {
        if let Some(cached) = self.cache.lock().clone() {
            return Ok(cached);
        }
        let url = self.url();
        let id = video_id(&url).ok_or(SourceError::InvalidUrl { service: SERVICE, url })?;
        let request = self
            .ctx
            .http
            .get(format!("https://api.streamable.com/videos/{}", id));
        let info: VideoInfo = self.ctx.get_json(SERVICE, request).await?;
        *self.cache.lock() = Some(info.clone());
        Ok(info)
    }
}

#[async_trait]
impl AudioSource for Streamable {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        if let Some(known) = known {
            *self.meta.write() = ExportedSource {
                url: url.to_string(),
                ..known
            };
            return Ok(());
        }

        self.meta.write().url = url.to_string();
        let info = self.video_info().await?;
        let length = info.best_file().and_then(|f| f.duration).unwrap_or(0.0);
        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title: info.title.clone().filter(|t| !t.is_empty()).unwrap_or_else(|| "Streamable".to_string()),
            length: length.max(0.0) as u64,
            thumbnail: info.thumbnail_url.as_deref().map(absolute),
            ..Default::default()
        };
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        let info = self.video_info().await?;
        let url = info.best_file().and_then(|f| f.url.as_deref()).ok_or(SourceError::NoFormat)?;
        Ok(StreamInfo::Url {
            url: absolute(url),
            user_agent: None,
            stream_type: StreamType::Mp4,
        })
    }

    fn disable_cache(&self) {
        *self.cache.lock() = None;
    }
}
