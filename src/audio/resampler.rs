//! Batch resampling using rubato's FFT-based resampler.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

/// Requested chunk size for FFT-based resampling (rubato may adjust it to fit the ratio).
const CHUNK_SIZE: usize = 1024;

/// Number of sub-chunks for FFT processing (higher = better quality but more CPU).
const SUB_CHUNKS: usize = 2;

/// Resample a mono buffer from one sample rate to another.
///
/// The input is processed in the resampler's fixed chunk size; the last chunk is
/// zero-padded and the result holds exactly `len * to_rate / from_rate` samples.
///
/// # Arguments
/// * `samples` - Mono input samples
/// * `from_rate` - Rate the input is interpreted at
/// * `to_rate` - Rate of the returned samples
///
/// # Errors
/// Returns an error if the resampler rejects the rate pair or a chunk.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = Fft::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1, FixedSync::Input)
        .with_context(|| format!("Failed to create resampler for {} Hz -> {} Hz", from_rate, to_rate))?;

    let chunk_size = resampler.input_frames_next();
    let output_frames_max = resampler.output_frames_max();
    let mut output_buffer = vec![0.0f32; output_frames_max];

    // The FFT resampler lags its input; drop the lead-in and flush with silence so the
    // tail of the utterance is not cut off.
    let delay = resampler.output_delay();
    let expected_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut output = Vec::with_capacity(expected_len + delay + output_frames_max);
    let mut padded = vec![0.0f32; chunk_size];
    let mut pos = 0;

    while output.len() < expected_len + delay {
        let end = (pos + chunk_size).min(samples.len());
        let available = end.saturating_sub(pos);
        let input: &[f32] = if available == chunk_size {
            &samples[pos..end]
        } else {
            padded[..available].copy_from_slice(&samples[pos.min(end)..end]);
            padded[available..].fill(0.0);
            &padded
        };

        let input_adapter = InterleavedSlice::new(input, 1, chunk_size).context("Failed to create input adapter")?;
        let mut output_adapter = InterleavedSlice::new_mut(&mut output_buffer, 1, output_frames_max).context("Failed to create output adapter")?;

        let (_, frames_written) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, None)
            .map_err(|e| anyhow::anyhow!("Resampling error: {}", e))?;
        output.extend_from_slice(&output_buffer[..frames_written]);
        if frames_written == 0 && end == samples.len() {
            break;
        }
        pos = end;
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected_len, 0.0);
    Ok(output)
}
