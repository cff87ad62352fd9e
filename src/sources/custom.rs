//! Direct raw-audio URLs (plain HTTP files and Discord attachments).

use async_process::Command;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use super::{file_name_of, AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "custom";

const AUDIO_EXTENSIONS: [&str; 12] = [
    "mp3", "wav", "wma", "mov", "mp4", "ogg", "oga", "flac", "m4a", "webm", "aac", "opus",
];

/// URL http(s) que apunta directamente a un archivo de audio
pub fn is_available_raw_audio_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    if matches!(parsed.host_str(), Some("cdn.discordapp.com" | "media.discordapp.net"))
        && parsed.path().starts_with("/attachments/")
    {
        return true;
    }
    parsed
        .path()
        .rsplit_once('.')
        .is_some_and(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Duración de un recurso vía ffprobe; `None` si no se puede determinar.
pub(crate) async fn probe_length(ctx: &SourceContext, target: &str) -> Option<u64> {
    let ffprobe = match ctx.config.ffmpeg_path.strip_suffix("ffmpeg") {
        Some(prefix) => format!("{}ffprobe", prefix),
        None => "ffprobe".to_string(),
    };
    let output = Command::new(&ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0", target])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("ffprobe no pudo medir {}", target);
        return None;
    }
    let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(seconds.max(0.0).round() as u64)
}

pub struct CustomStream {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
}

impl CustomStream {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
        }
    }
}

#[async_trait]
impl AudioSource for CustomStream {
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

        if !is_available_raw_audio_url(url) {
            return Err(SourceError::InvalidUrl {
                service: SERVICE,
                url: url.to_string(),
            });
        }

        let length = probe_length(&self.ctx, url).await.unwrap_or(0);
        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title: file_name_of(url).unwrap_or_else(|| "Stream personalizado".to_string()),
            length,
            ..Default::default()
        };
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        let url = self.url();
        if url.is_empty() {
            return Err(SourceError::NotInitialized);
        }
        Ok(StreamInfo::Url {
            url,
            user_agent: None,
            stream_type: StreamType::Unknown,
        })
    }
}
