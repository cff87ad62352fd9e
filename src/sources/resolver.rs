use std::sync::Arc;
use tracing::debug;

use super::{
    bestdori, custom, fs, googledrive, hibiki, niconico, soundcloud, spotify, streamable, twitter,
    youtube, AudioSource, ExportedSource, SourceContext,
};
use crate::error::SourceError;

/// Backends conocidos, en el orden de detección para el tipo `unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    YouTube,
    Custom,
    SoundCloud,
    Spotify,
    GoogleDrive,
    Streamable,
    Bestdori,
    Hibiki,
    NicoNico,
    Twitter,
    Fs,
}

impl Backend {
    const SNIFF_ORDER: [Backend; 10] = [
        Backend::YouTube,
        Backend::Custom,
        Backend::SoundCloud,
        Backend::Spotify,
        Backend::GoogleDrive,
        Backend::Streamable,
        Backend::Bestdori,
        Backend::Hibiki,
        Backend::NicoNico,
        Backend::Twitter,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Backend::YouTube => youtube::SERVICE,
            Backend::Custom => custom::SERVICE,
            Backend::SoundCloud => soundcloud::SERVICE,
            Backend::Spotify => spotify::SERVICE,
            Backend::GoogleDrive => googledrive::SERVICE,
            Backend::Streamable => streamable::SERVICE,
            Backend::Bestdori => bestdori::SERVICE,
            Backend::Hibiki => hibiki::SERVICE,
            Backend::NicoNico => niconico::SERVICE,
            Backend::Twitter => twitter::SERVICE,
            Backend::Fs => fs::SERVICE,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::SNIFF_ORDER
            .into_iter()
            .chain([Backend::Fs])
            .find(|b| b.id() == id)
    }

    fn matches(&self, url: &str) -> bool {
        match self {
            Backend::YouTube => youtube::is_youtube_url(url),
            Backend::Custom => custom::is_available_raw_audio_url(url),
            Backend::SoundCloud => soundcloud::validate_url(url),
            Backend::Spotify => spotify::validate_track_url(url),
            Backend::GoogleDrive => googledrive::validate_url(url),
            Backend::Streamable => streamable::video_id(url).is_some(),
            Backend::Bestdori => bestdori::audio_id(url).is_some(),
            Backend::Hibiki => hibiki::validate_url(url),
            Backend::NicoNico => niconico::validate_url(url),
            Backend::Twitter => twitter::validate_url(url),
            // los archivos locales solo se eligen por tipo explícito
            Backend::Fs => false,
        }
    }
}

/// Petición de resolución.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Identificador de servicio, o `"unknown"` para detectar por URL
    pub kind: String,
    pub url: String,
    pub known: Option<ExportedSource>,
    /// Precarga la caché de metadatos aunque haya `known`
    pub force_cache: bool,
}

impl ResolveRequest {
    pub fn unknown(url: impl Into<String>) -> Self {
        Self {
            kind: "unknown".to_string(),
            url: url.into(),
            known: None,
            force_cache: false,
        }
    }

    pub fn restore(kind: impl Into<String>, known: ExportedSource) -> Self {
        Self {
            kind: kind.into(),
            url: known.url.clone(),
            known: Some(known),
            force_cache: false,
        }
    }
}

/// Mapea URL/tipo a la fuente correspondiente.
#[derive(Clone)]
pub struct Resolver {
    ctx: SourceContext,
}

impl Resolver {
    pub fn new(ctx: SourceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SourceContext {
        &self.ctx
    }

    /// Deshabilitado por configuración o por falta de flag/credenciales
    fn available(&self, backend: Backend) -> bool {
        let config = &self.ctx.config;
        if config.is_disabled_source(backend.id()) {
            return false;
        }
        match backend {
            Backend::Spotify => config.spotify_available(),
            Backend::Bestdori => config.enable_bestdori,
            Backend::Hibiki => config.enable_hibiki,
            _ => true,
        }
    }

    /// Elige el backend sin tocar la red.
    pub fn select(&self, kind: &str, url: &str) -> Option<Backend> {
        if kind != "unknown" {
            return Backend::from_id(kind).filter(|b| self.available(*b));
        }
        Backend::SNIFF_ORDER
            .into_iter()
            .find(|b| self.available(*b) && b.matches(url))
    }

    /// Resuelve e inicializa la fuente. `Ok(None)` si ningún backend la reconoce;
    /// los errores de `init` se propagan sin reintento.
    pub async fn resolve(
        &self,
        request: ResolveRequest,
    ) -> Result<Option<Arc<dyn AudioSource>>, SourceError> {
        let Some(backend) = self.select(&request.kind, &request.url) else {
            debug!("❔ Sin backend para {} ({})", request.url, request.kind);
            return Ok(None);
        };
        debug!("🔎 {} → {}", request.url, backend.id());

        let ctx = self.ctx.clone();
        let source: Arc<dyn AudioSource> = match backend {
            Backend::YouTube => {
                let source = youtube::new(ctx);
                source.init(&request.url, request.known).await?;
                if request.force_cache && !source.has_cache() {
                    source.info().await?;
                }
                return Ok(Some(Arc::new(source)));
            }
            Backend::Custom => Arc::new(custom::CustomStream::new(ctx)),
            Backend::SoundCloud => Arc::new(soundcloud::new(ctx)),
            Backend::Spotify => Arc::new(spotify::Spotify::new(ctx)),
            Backend::GoogleDrive => Arc::new(googledrive::GoogleDrive::new(ctx)),
            Backend::Streamable => Arc::new(streamable::Streamable::new(ctx)),
            Backend::Bestdori => Arc::new(bestdori::Bestdori::new(ctx)),
            Backend::Hibiki => Arc::new(hibiki::Hibiki::new(ctx)),
            Backend::NicoNico => Arc::new(niconico::new(ctx)),
            Backend::Twitter => Arc::new(twitter::new(ctx)),
            Backend::Fs => Arc::new(fs::FsStream::new(ctx)),
        };

        source.init(&request.url, request.known).await?;
        Ok(Some(source))
    }
}
