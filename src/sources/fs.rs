use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Component, Path, PathBuf};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use super::{AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "fs";

/// Archivo local bajo `data_dir`.
pub struct FsStream {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
}

impl FsStream {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
        }
    }

    /// Ruta absoluta dentro de `data_dir`; rechaza rutas absolutas y `..`
    fn resolve_path(&self, relative: &str) -> Result<PathBuf, SourceError> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(SourceError::InvalidUrl {
                service: SERVICE,
                url: relative.to_string(),
            });
        }
        Ok(self.ctx.config.data_dir.join(path))
    }
}

/// Duración del archivo leyendo la cabecera del contenedor.
pub fn probe_seconds(path: &Path) -> Option<u64> {
    let file = std::fs::File::open(path).ok()?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .ok()?;
    let track = probed.format.default_track()?;
    let frames = track.codec_params.n_frames?;
    let time = track.codec_params.time_base?.calc_time(frames);
    Some(time.seconds + u64::from(time.frac >= 0.5))
}

#[async_trait]
impl AudioSource for FsStream {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        let path = self.resolve_path(url)?;

        if let Some(known) = known {
            *self.meta.write() = ExportedSource {
                url: url.to_string(),
                ..known
            };
            return Ok(());
        }

        if !tokio::fs::try_exists(&path).await? {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archivo no encontrado: {}", path.display()),
            )));
        }

        let probe_path = path.clone();
        let length = tokio::task::spawn_blocking(move || probe_seconds(&probe_path))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);
        debug!("📁 {} → {}s", path.display(), length);

        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Stream personalizado".to_string());

        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title,
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
        let file = std::fs::File::open(self.resolve_path(&url)?)?;
        Ok(StreamInfo::Readable {
            reader: Box::new(file),
            stream_type: StreamType::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;
    use std::sync::Arc;

    /// WAV PCM 16-bit mono de `seconds` segundos a 8 kHz
    fn write_wav(path: &Path, seconds: u32) {
        let rate: u32 = 8000;
        let data_len = rate * seconds * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(bytes.len() + data_len as usize, 0);
        std::fs::File::create(path).unwrap().write_all(&bytes).unwrap();
    }

    fn source_in(dir: &Path) -> FsStream {
        let config = Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        };
        FsStream::new(SourceContext::new(Arc::new(config)))
    }

    #[tokio::test]
    async fn test_init_probes_length() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("tone.wav"), 3);

        let source = source_in(dir.path());
        source.init("tone.wav", None).await.unwrap();
        assert_eq!(source.title(), "tone.wav");
        assert_eq!(source.length_seconds(), 3);

        let stream = source.fetch(false).await.unwrap();
        assert!(stream.is_readable());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path());
        assert!(matches!(
            source.init("../etc/passwd", None).await,
            Err(SourceError::InvalidUrl { .. })
        ));
        assert!(matches!(
            source.init("/etc/passwd", None).await,
            Err(SourceError::InvalidUrl { .. })
        ));
        assert!(source.init("missing.mp3", None).await.is_err());
    }
}
