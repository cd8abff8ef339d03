//! Plaything
//!
//! Streams incremental PCM audio through a small pool of native playback buffers.

pub mod audio;
pub mod decode;
pub mod engine;

pub use audio::{AudioFormat, Position, SampleType};
pub use engine::{PlaybackState, Stream, StreamConfig, StreamError, UnderrunPolicy};
