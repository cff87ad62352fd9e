//! PCM f32le guard between ffmpeg and the voice transport.
//!
//! Applies optional software gain, soft-clips peaks instead of letting them
//! wrap, and fires a one-shot signal when the decoded stream ends: `Ok(())`
//! at a clean EOF, `Err(message)` when the inner reader fails.

use std::io::{self, Read, Seek, SeekFrom};
use symphonia::core::io::MediaSource;
use tokio::sync::oneshot;

const SAMPLE_BYTES: usize = 4;
/// Por encima de este umbral la señal se comprime suavemente hacia 1.0
const KNEE: f32 = 0.9;

/// Cómo terminó el stream decodificado
pub type StreamEnd = Result<(), String>;

pub struct Normalizer {
    inner: Box<dyn Read + Send + Sync>,
    gain: Option<f32>,
    carry: Vec<u8>,
    ended: Option<oneshot::Sender<StreamEnd>>,
}

impl Normalizer {
    pub fn new(
        inner: Box<dyn Read + Send + Sync>,
        gain: Option<f32>,
        ended: oneshot::Sender<StreamEnd>,
    ) -> Self {
        Self {
            inner,
            gain,
            carry: Vec::with_capacity(SAMPLE_BYTES),
            ended: Some(ended),
        }
    }

    fn signal_end(&mut self, end: StreamEnd) {
        if let Some(ended) = self.ended.take() {
            let _ = ended.send(end);
        }
    }

    /// Lee del origen avisando del fin o del error
    fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                self.signal_end(Ok(()));
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.signal_end(Err(e.to_string()));
                Err(e)
            }
        }
    }
}

pub fn soft_clip(sample: f32) -> f32 {
    if !sample.is_finite() {
        return 0.0;
    }
    let magnitude = sample.abs();
    if magnitude <= KNEE {
        return sample;
    }
    let headroom = 1.0 - KNEE;
    let compressed = KNEE + headroom * ((magnitude - KNEE) / headroom).tanh();
    compressed.copysign(sample)
}

impl Read for Normalizer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() < SAMPLE_BYTES {
            return self.read_inner(buf);
        }

        loop {
            let filled = self.carry.len();
            buf[..filled].copy_from_slice(&self.carry);
            self.carry.clear();

            let read = self.read_inner(&mut buf[filled..])?;
            if read == 0 {
                // una muestra incompleta al final se descarta
                return Ok(0);
            }

            let total = filled + read;
            let aligned = total - total % SAMPLE_BYTES;
            self.carry.extend_from_slice(&buf[aligned..total]);
            if aligned == 0 {
                continue;
            }

            for chunk in buf[..aligned].chunks_exact_mut(SAMPLE_BYTES) {
                let mut sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if let Some(gain) = self.gain {
                    sample *= gain;
                }
                chunk.copy_from_slice(&soft_clip(sample).to_le_bytes());
            }
            return Ok(aligned);
        }
    }
}

impl Seek for Normalizer {
    fn seek(&mut self, _: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "seek not supported"))
    }
}

impl MediaSource for Normalizer {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pcm(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn decode(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Lector que entrega de a pocos bytes para forzar muestras partidas
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let limit = buf.len().min(3);
            self.0.read(&mut buf[..limit])
        }
    }

    #[test]
    fn test_soft_clip_bounds() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert!(soft_clip(1.2) < 1.0);
        assert!(soft_clip(1.2) > KNEE);
        assert!(soft_clip(4.0) <= 1.0);
        assert!(soft_clip(-1.2) > -1.0);
        assert_eq!(soft_clip(f32::NAN), 0.0);
    }

    #[test]
    fn test_gain_and_end_signal() {
        let (tx, mut rx) = oneshot::channel();
        let input = pcm(&[0.1, -0.2, 0.3]);
        let mut normalizer = Normalizer::new(Box::new(Cursor::new(input)), Some(2.0), tx);

        let mut out = Vec::new();
        normalizer.read_to_end(&mut out).unwrap();
        let samples = decode(&out);
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.2).abs() < 1e-6);
        assert!((samples[1] + 0.4).abs() < 1e-6);
        assert_eq!(rx.try_recv(), Ok(Ok(())));
    }

    /// Entrega una muestra y luego falla
    struct Broken(Option<Vec<u8>>);

    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.take() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                None => Err(io::Error::other("ffmpeg terminó con código 1")),
            }
        }
    }

    #[test]
    fn test_reader_error_is_signalled() {
        let (tx, mut rx) = oneshot::channel();
        let mut normalizer = Normalizer::new(Box::new(Broken(Some(pcm(&[0.5])))), None, tx);

        let mut out = Vec::new();
        assert!(normalizer.read_to_end(&mut out).is_err());
        assert_eq!(decode(&out), vec![0.5]);
        assert_eq!(rx.try_recv(), Ok(Err("ffmpeg terminó con código 1".to_string())));
    }

    #[test]
    fn test_split_samples_are_realigned() {
        let (tx, _rx) = oneshot::channel();
        let input = pcm(&[0.25, 0.5, -0.75, 0.125]);
        let mut normalizer = Normalizer::new(Box::new(Trickle(Cursor::new(input))), None, tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = normalizer.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n % 4, 0);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(decode(&out), vec![0.25, 0.5, -0.75, 0.125]);
    }
}
