use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rspotify::{
    clients::BaseClient,
    model::{FullTrack, PlayableItem, PlaylistId, TrackId},
    ClientCredsSpotify, Credentials,
};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::ytdlp::{self, YtDlpSource};
use super::{youtube, AudioSource, ExportedSource, SourceContext, StreamInfo};
use crate::error::SourceError;

pub const SERVICE: &str = "spotify";

fn api_error(e: impl std::fmt::Display) -> SourceError {
    SourceError::Api {
        service: SERVICE,
        message: e.to_string(),
    }
}

/// `(tipo, id)` de `open.spotify.com/[intl-xx/]<tipo>/<id>`
fn parse(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != "open.spotify.com" {
        return None;
    }
    let segments: Vec<&str> = parsed
        .path_segments()?
        .filter(|s| !s.is_empty() && !s.starts_with("intl-"))
        .collect();
    match segments.as_slice() {
        [kind, id] if id.chars().all(|c| c.is_ascii_alphanumeric()) => {
            Some((kind.to_string(), id.to_string()))
        }
        _ => None,
    }
}

pub fn validate_track_url(url: &str) -> bool {
    matches!(parse(url), Some((kind, _)) if kind == "track")
}

pub fn validate_playlist_url(url: &str) -> bool {
    matches!(parse(url), Some((kind, _)) if kind == "playlist")
}

/// Cliente autenticado (client credentials), creado una sola vez por contexto
async fn client(ctx: &SourceContext) -> Result<&ClientCredsSpotify, SourceError> {
    ctx.spotify
        .get_or_try_init(|| async {
            let (Some(id), Some(secret)) = (
                ctx.config.spotify_client_id.as_deref(),
                ctx.config.spotify_client_secret.as_deref(),
            ) else {
                return Err(SourceError::Unsupported(SERVICE.to_string()));
            };
            let spotify = ClientCredsSpotify::new(Credentials::new(id, secret));
            spotify.request_token().await.map_err(api_error)?;
            info!("🎧 Cliente de Spotify autenticado");
            Ok(spotify)
        })
        .await
}

fn track_to_exported(url: &str, track: &FullTrack) -> ExportedSource {
    let artist = track
        .artists
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    ExportedSource {
        url: url.to_string(),
        title: track.name.clone(),
        length: track.duration.num_seconds().max(0) as u64,
        thumbnail: track.album.images.first().map(|i| i.url.clone()),
        artist: (!artist.is_empty()).then_some(artist),
        ..Default::default()
    }
}

/// Tracks de una playlist pública (primera página de la API)
pub async fn playlist(
    ctx: &SourceContext,
    url: &str,
    limit: usize,
) -> Result<Vec<ExportedSource>, SourceError> {
    let id = parse(url)
        .filter(|(kind, _)| kind == "playlist")
        .map(|(_, id)| id)
        .ok_or_else(|| SourceError::InvalidUrl {
            service: SERVICE,
            url: url.to_string(),
        })?;
    let playlist_id = PlaylistId::from_id(id.as_str()).map_err(api_error)?;
    let playlist = client(ctx).await?.playlist(playlist_id, None, None).await.map_err(api_error)?;

    Ok(playlist
        .tracks
        .items
        .into_iter()
        .filter_map(|item| match item.track {
            Some(PlayableItem::Track(track)) => {
                let url = track.external_urls.get("spotify").cloned()?;
                Some(track_to_exported(&url, &track))
            }
            _ => None,
        })
        .take(limit)
        .collect())
}

/// Track de Spotify; el audio se obtiene buscando el equivalente en YouTube.
pub struct Spotify {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
    resolved: Mutex<Option<Arc<YtDlpSource>>>,
}

impl Spotify {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
            resolved: Mutex::new(None),
        }
    }

    fn search_query(&self) -> String {
        let meta = self.meta.read();
        match &meta.artist {
            Some(artist) => format!("{} {}", artist, meta.title),
            None => meta.title.clone(),
        }
    }

    /// Video de YouTube equivalente (cacheado hasta `disable_cache`)
    async fn youtube_equivalent(&self) -> Result<Arc<YtDlpSource>, SourceError> {
        if let Some(resolved) = self.resolved.lock().clone() {
            return Ok(resolved);
        }

        let query = self.search_query();
        let found = ytdlp::search(&self.ctx.config.ytdlp_path, &query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(SourceError::NoFormat)?;
        let url = if found.id.is_empty() {
            found.entry_url().ok_or(SourceError::NoFormat)?
        } else {
            youtube::watch_url(&found.id)
        };
        debug!("🎧 Spotify \"{}\" → {}", query, url);

        let source = Arc::new(youtube::new(self.ctx.clone()));
        source.init(&url, None).await?;
        *self.resolved.lock() = Some(source.clone());
        Ok(source)
    }
}

#[async_trait]
impl AudioSource for Spotify {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        let id = parse(url)
            .filter(|(kind, _)| kind == "track")
            .map(|(_, id)| id)
            .ok_or_else(|| SourceError::InvalidUrl {
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

        let track_id = TrackId::from_id(id.as_str()).map_err(api_error)?;
        let track = client(&self.ctx).await?.track(track_id, None).await.map_err(api_error)?;
        *self.meta.write() = track_to_exported(url, &track);
        Ok(())
    }

    async fn fetch(&self, force_url: bool) -> Result<StreamInfo, SourceError> {
        self.youtube_equivalent().await?.fetch(force_url).await
    }

    fn disable_cache(&self) {
        self.resolved.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spotify_urls() {
        assert!(validate_track_url("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"));
        assert!(validate_track_url(
            "https://open.spotify.com/intl-ja/track/4uLU6hMCjMI75M1A2tKUQC?si=abc"
        ));
        assert!(!validate_track_url("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M"));
        assert!(validate_playlist_url("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M"));
        assert!(!validate_track_url("https://spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_unsupported() {
        let ctx = SourceContext::new(Arc::new(crate::config::Config::default()));
        let source = Spotify::new(ctx);
        let result = source
            .init("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC", None)
            .await;
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }
}
