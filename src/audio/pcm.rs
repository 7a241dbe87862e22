//! Rendering of engine output into the transcoder's fixed PCM input format.
//!
//! The transcoder always reads signed 16-bit little-endian samples, 48 kHz, 2 channels.
//! Pitch is applied by reinterpreting the engine audio at a scaled rate before resampling
//! to 48 kHz; the caller compensates the duration change through the engine speed.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use super::resampler::resample;

/// Sample rate of every PCM chunk handed to the transcoder.
pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// Interleaved channel count of every PCM chunk.
pub const OUTPUT_CHANNELS: usize = 2;

/// Bytes per interleaved stereo frame.
pub const FRAME_BYTES: usize = OUTPUT_CHANNELS * std::mem::size_of::<i16>();

/// Resampling rates are snapped to this granularity to keep FFT sizes small.
const RATE_STEP: f32 = 100.0;

/// Frequency factor for a pitch shift in half-tones.
pub fn pitch_factor(half_tones: f32) -> f32 {
    2f32.powf(half_tones / 12.0)
}

/// Linear amplitude gain for a volume adjustment in decibels.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Rate the engine audio is reinterpreted at so that resampling to 48 kHz shifts its pitch.
pub fn pitched_source_rate(engine_rate: u32, half_tones: f32) -> u32 {
    let rate = engine_rate as f32 * pitch_factor(half_tones);
    ((rate / RATE_STEP).round() * RATE_STEP).max(RATE_STEP) as u32
}

/// Convert engine samples into interleaved s16le stereo bytes at 48 kHz.
///
/// # Arguments
/// * `samples` - Mono f32 samples produced by the engine
/// * `engine_rate` - Sample rate reported by the engine
/// * `pitch` - Pitch shift in half-tones
/// * `volume` - Volume adjustment in dB
///
/// # Errors
/// Returns an error if resampling fails.
pub fn render(samples: &[f32], engine_rate: u32, pitch: f32, volume: f32) -> Result<Bytes> {
    let source_rate = if pitch == 0.0 { engine_rate } else { pitched_source_rate(engine_rate, pitch) };
    let resampled = resample(samples, source_rate, OUTPUT_SAMPLE_RATE)?;
    Ok(encode_s16le_stereo(&resampled, db_to_gain(volume)))
}

/// Apply gain, clip to [-1, 1], quantize to i16 and duplicate into both channels.
pub fn encode_s16le_stereo(samples: &[f32], gain: f32) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * FRAME_BYTES);
    for &sample in samples {
        let value = (sample * gain).clamp(-1.0, 1.0);
        let quantized = (value * i16::MAX as f32).round() as i16;
        for _ in 0..OUTPUT_CHANNELS {
            out.put_i16_le(quantized);
        }
    }
    out.freeze()
}
