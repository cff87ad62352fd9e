use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::normalizer::{Normalizer, StreamEnd};
use crate::error::PlayError;
use crate::sources::{StreamInfo, StreamType};

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;

/// Entrada del transcodificador
#[derive(Debug)]
pub struct StreamRequest {
    pub stream: StreamInfo,
    /// Argumentos de efectos para ffmpeg (`-af …`)
    pub effects: Vec<String>,
    pub seek: u64,
    /// Ganancia por software cuando el transporte no controla el volumen
    pub software_volume: Option<f32>,
    pub bitrate: u32,
}

/// Recurso listo para el transporte de voz (PCM f32le 48 kHz estéreo)
pub struct PlayableStream {
    pub pcm: Normalizer,
    /// Costo estimado del recurso
    pub cost: u32,
    /// Se resuelve cuando el stream decodificado termina, con el error si lo hubo
    pub ended: oneshot::Receiver<StreamEnd>,
}

/// Convierte un stream crudo en un recurso reproducible
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, request: StreamRequest) -> Result<PlayableStream, PlayError>;
}

/// Costo: 1 por transcodificar, +1 si la entrada va por pipe, +1 con efectos
pub fn estimate_cost(readable: bool, effects_active: bool) -> u32 {
    1 + u32::from(readable) + u32::from(effects_active)
}

/// stdout de ffmpeg; el proceso se mata al soltarlo.
///
/// Al llegar al EOF espera al proceso: una salida no exitosa, o un fallo al
/// alimentar su stdin, se reporta como error de lectura.
struct FfmpegOutput {
    child: Child,
    stdout: ChildStdout,
    feed_error: Arc<Mutex<Option<String>>>,
}

impl FfmpegOutput {
    fn finish(&mut self) -> io::Result<()> {
        if let Some(error) = self.feed_error.lock().take() {
            return Err(io::Error::other(format!("error alimentando ffmpeg: {}", error)));
        }
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("ffmpeg terminó con {}", status)))
        }
    }
}

impl Read for FfmpegOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.stdout.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(read)
    }
}

impl Drop for FfmpegOutput {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Transcodificación con ffmpeg
pub struct FfmpegStreamResolver {
    ffmpeg: String,
}

impl FfmpegStreamResolver {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn args(request: &StreamRequest) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        match &request.stream {
            StreamInfo::Url {
                url,
                user_agent,
                stream_type,
            } => {
                if let Some(ua) = user_agent {
                    args.extend(["-user_agent".to_string(), ua.clone()]);
                }
                if *stream_type != StreamType::Hls {
                    args.extend(
                        ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                }
                if request.seek > 0 {
                    args.extend(["-ss".to_string(), request.seek.to_string()]);
                }
                args.extend(["-i".to_string(), url.clone()]);
            }
            StreamInfo::Readable { stream_type, .. } => {
                if request.seek > 0 {
                    args.extend(["-ss".to_string(), request.seek.to_string()]);
                }
                if let Some(demuxer) = stream_type.ffmpeg_demuxer() {
                    args.extend(["-f".to_string(), demuxer.to_string()]);
                }
                args.extend(["-i".to_string(), "pipe:0".to_string()]);
            }
        }

        args.extend(request.effects.iter().cloned());
        args.extend(
            ["-vn", "-f", "f32le", "-ar", "48000", "-ac", "2", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl StreamResolver for FfmpegStreamResolver {
    async fn resolve(&self, request: StreamRequest) -> Result<PlayableStream, PlayError> {
        let readable = request.stream.is_readable();
        let cost = estimate_cost(readable, !request.effects.is_empty());
        let args = Self::args(&request);
        debug!(
            "🔧 ffmpeg (costo {}, bitrate {}): {}",
            cost,
            request.bitrate,
            args.join(" ")
        );

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(if readable { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| PlayError::Transcode(format!("no se pudo iniciar ffmpeg: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlayError::Transcode("stdout de ffmpeg no disponible".to_string()))?;

        let feed_error = Arc::new(Mutex::new(None));
        if let StreamInfo::Readable { mut reader, .. } = request.stream {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| PlayError::Transcode("stdin de ffmpeg no disponible".to_string()))?;
            let feed_error = feed_error.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = io::copy(&mut reader, &mut stdin) {
                    // ffmpeg cierra el pipe al detenerse
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        warn!("⚠️ Error alimentando ffmpeg: {}", e);
                        *feed_error.lock() = Some(e.to_string());
                    }
                }
                // el error queda registrado antes de que ffmpeg vea el EOF
                drop(stdin);
            });
        }

        let (tx, rx) = oneshot::channel();
        let output = FfmpegOutput {
            child,
            stdout,
            feed_error,
        };
        Ok(PlayableStream {
            pcm: Normalizer::new(Box::new(output), request.software_volume, tx),
            cost,
            ended: rx,
        })
    }
}
