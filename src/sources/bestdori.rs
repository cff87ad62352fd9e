// Bestdori (BanG Dream!) - habilitado solo con `enable_bestdori`

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use url::Url;

use super::{AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "bestdori";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongInfo {
    #[serde(default)]
    music_title: Vec<Option<String>>,
    length: Option<f64>,
    #[serde(default)]
    jacket_image: Vec<String>,
}

impl SongInfo {
    fn title(&self) -> Option<String> {
        self.music_title.iter().flatten().next().cloned()
    }
}

/// ID de canción de `bestdori.com/info/songs/<id>`
pub fn audio_id(url: &str) -> Option<u32> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.host_str()?, "bestdori.com" | "www.bestdori.com") {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        ["info", "songs", id, ..] => id.parse().ok(),
        _ => None,
    }
}

fn bgm_url(id: u32) -> String {
    format!("https://bestdori.com/assets/jp/sound/bgm{:03}_rip/bgm{:03}.mp3", id, id)
}

fn jacket_url(id: u32, jacket: &str) -> String {
    let bundle = id.div_ceil(10) * 10;
    format!(
        "https://bestdori.com/assets/jp/musicjacket/musicjacket{}_rip/assets-star-forassetbundle-startapp-musicjacket-musicjacket{}-{}-jacket.png",
        bundle, bundle, jacket
    )
}

pub struct Bestdori {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
}

impl Bestdori {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
        }
    }
}

#[async_trait]
impl AudioSource for Bestdori {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        let id = audio_id(url).ok_or_else(|| SourceError::InvalidUrl {
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

        let request = self
            .ctx
            .http
            .get(format!("https://bestdori.com/api/songs/{}.json", id));
        let song: SongInfo = self.ctx.get_json(SERVICE, request).await?;

        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title: song.title().unwrap_or_else(|| format!("Bestdori #{}", id)),
            length: song.length.unwrap_or(0.0).max(0.0) as u64,
            thumbnail: song.jacket_image.first().map(|j| jacket_url(id, j)),
            ..Default::default()
        };
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        let id = audio_id(&self.url()).ok_or(SourceError::NotInitialized)?;
        Ok(StreamInfo::Url {
            url: bgm_url(id),
            user_agent: None,
            stream_type: StreamType::Mp3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_id_and_urls() {
        assert_eq!(audio_id("https://bestdori.com/info/songs/1/yes-bang-dream"), Some(1));
        assert_eq!(audio_id("https://bestdori.com/info/cards/1"), None);
        assert_eq!(bgm_url(1), "https://bestdori.com/assets/jp/sound/bgm001_rip/bgm001.mp3");
        assert!(jacket_url(12, "jacket12").contains("musicjacket20_rip"));
    }

    #[test]
    fn test_title_skips_missing_locales() {
        let song: SongInfo =
            serde_json::from_str(r#"{"musicTitle": [null, "Yes! BanG_Dream!"], "length": 120.5}"#).unwrap();
        assert_eq!(song.title().as_deref(), Some("Yes! BanG_Dream!"));
    }
}
