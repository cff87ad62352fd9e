//! HiBiKi Radio Station (flag-gated by `enable_hibiki`).
//!
//! `init` reads the program API; `fetch` asks `play_check` for a fresh HLS
//! playlist URL every time, so nothing signed is ever cached.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use super::{AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "hibiki";

const API_BASE: &str = "https://vcms-api.hibiki-radio.jp/api/v1";

static URL_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^https?://hibiki-radio\.jp/description/(?P<id>[^/#]+)/detail([/#].*)?$").ok()
});

#[derive(Debug, Deserialize)]
struct ProgramInfo {
    #[serde(default)]
    description: String,
    sp_image_url: Option<String>,
    #[serde(default)]
    cast: String,
    episode: Episode,
}

#[derive(Debug, Deserialize)]
struct Episode {
    program_name: String,
    name: String,
    video: Video,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: u64,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct PlayCheck {
    playlist_url: String,
}

/// ID del programa en la URL de descripción
pub fn program_id(url: &str) -> Option<String> {
    let captures = URL_PATTERN.as_ref()?.captures(url)?;
    Some(captures.name("id")?.as_str().to_string())
}

pub fn validate_url(url: &str) -> bool {
    program_id(url).is_some()
}

pub struct Hibiki {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
    video_id: Mutex<Option<u64>>,
}

impl Hibiki {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
            video_id: Mutex::new(None),
        }
    }

    fn api_request(&self, url: String) -> reqwest::RequestBuilder {
        self.ctx
            .http
            .get(url)
            .header("Referer", "https://hibiki-radio.jp/")
            .header("X-Requested-With", "XMLHttpRequest")
    }

    async fn program(&self, id: &str) -> Result<ProgramInfo, SourceError> {
        let request = self.api_request(format!("{}/programs/{}", API_BASE, id));
        let program: ProgramInfo = self.ctx.get_json(SERVICE, request).await?;
        *self.video_id.lock() = Some(program.episode.video.id);
        Ok(program)
    }
}

#[async_trait]
impl AudioSource for Hibiki {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        let id = program_id(url).ok_or_else(|| SourceError::InvalidUrl {
            service: SERVICE,
            url: url.to_string(),
        })?;

        if let Some(known) = known {
            *self.meta.write() = ExportedSource {
                url: url.to_string(),
                ..known
            };
            return Ok(());
        }

        let program = self.program(&id).await?;
        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title: format!("{}({})", program.episode.program_name, program.episode.name),
            length: program.episode.video.duration.max(0.0) as u64,
            description: Some(program.description),
            thumbnail: program.sp_image_url,
            artist: (!program.cast.is_empty()).then_some(program.cast),
            ..Default::default()
        };
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        let known_video = *self.video_id.lock();
        let video_id = match known_video {
            Some(id) => id,
            None => {
                let id = program_id(&self.url()).ok_or(SourceError::NotInitialized)?;
                self.program(&id).await?.episode.video.id
            }
        };

        let request = self.api_request(format!("{}/videos/play_check?video_id={}", API_BASE, video_id));
        let check: PlayCheck = self.ctx.get_json(SERVICE, request).await?;
        Ok(StreamInfo::Url {
            url: check.playlist_url,
            user_agent: None,
            stream_type: StreamType::Hls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hibiki_urls() {
        assert_eq!(
            program_id("https://hibiki-radio.jp/description/llss/detail").as_deref(),
            Some("llss")
        );
        assert!(validate_url("https://hibiki-radio.jp/description/llss/detail#anchor"));
        assert!(!validate_url("https://hibiki-radio.jp/description/llss"));
        assert!(!validate_url("https://example.com/description/llss/detail"));
    }

    #[test]
    fn test_program_json() {
        let program: ProgramInfo = serde_json::from_str(
            r##"{"description": "d", "cast": "A, B", "sp_image_url": "https://img/x.jpg",
                "episode": {"program_name": "Radio", "name": "#1", "video": {"id": 77, "duration": 1800.7}}}"##,
        )
        .unwrap();
        assert_eq!(program.episode.video.id, 77);
        assert_eq!(program.episode.video.duration as u64, 1800);
    }
}
