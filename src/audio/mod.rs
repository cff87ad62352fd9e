//! # Audio Module
//!
//! Playback core shared by every guild.
//!
//! ### [`queue`] - Queue Management
//! - Ordered entries; index 0 is the current song
//! - Single-song loop, whole-queue loop and one-shot loop
//! - Playlist ingestion with cancellation and coarse progress
//!
//! ### [`player`] - Play Manager
//! - Binds the queue head to the voice transport
//! - Waits for scheduled live streams
//! - Bounded retries, rate-limit stop and the idle countdown
//!
//! ### [`stream`] / [`normalizer`] - Transcoding
//! - ffmpeg turns any source into 48kHz stereo f32 PCM
//! - Optional effect filters and software volume
//!
//! ### [`transport`] - Voice
//! - songbird behind the [`transport::VoiceTransport`] seam

pub mod effects;
pub mod events;
pub mod normalizer;
pub mod player;
pub mod queue;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub mod testing;
