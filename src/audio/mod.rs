//! Audio processing between the speech engine and the transcoder.
//!
//! Resamples engine output with rubato and renders it into the fixed
//! s16le / 48 kHz / stereo format the transcoder reads.

pub mod pcm;
mod resampler;

pub use pcm::{FRAME_BYTES, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
