//! Synthesis invoker: validates a request and turns a voice into a lazy PCM chunk stream.
//!
//! The engine runs on a blocking worker and hands chunks off through a bounded channel.
//! A full channel parks the worker inside `blocking_send`, so synthesis only runs as fast
//! as the transcoder drains its input.

use std::ops::RangeInclusive;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::registry::VoiceModel;
use super::synthesizer::split_sentences;
use crate::audio::{FRAME_BYTES, pcm};
use crate::error::PipelineError;

/// Maximum text length in characters.
pub const MAX_TEXT_CHARS: usize = 1000;

pub const SPEED_RANGE: RangeInclusive<f32> = 0.1..=4.0;
pub const PITCH_RANGE: RangeInclusive<f32> = -48.0..=48.0;
pub const VOLUME_RANGE: RangeInclusive<f32> = -120.0..=150.0;

/// Limits for the speed argument actually handed to the engine after pitch compensation.
const ENGINE_SPEED_RANGE: RangeInclusive<f32> = 0.05..=20.0;

/// Raw s16le / 48 kHz / stereo audio, consumed exactly once by the transcoder.
pub type PcmChunk = Bytes;

/// Prosody parameters as they arrive in a request; absent fields take defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ProsodyRequest {
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
}

/// Validated prosody parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    pub speed: f32,  // Speed multiplier
    pub pitch: f32,  // Pitch shift in half-tones
    pub volume: f32, // Volume adjustment in dB
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self { speed: 1.0, pitch: 0.0, volume: 0.0 }
    }
}

impl SynthesisParams {
    /// Apply defaults and check every bound.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] naming the first out-of-range field.
    pub fn from_request(request: ProsodyRequest) -> Result<Self, PipelineError> {
        let defaults = Self::default();
        Ok(Self {
            speed: check_range("speed", request.speed.unwrap_or(defaults.speed), &SPEED_RANGE)?,
            pitch: check_range("pitch", request.pitch.unwrap_or(defaults.pitch), &PITCH_RANGE)?,
            volume: check_range("volume", request.volume.unwrap_or(defaults.volume), &VOLUME_RANGE)?,
        })
    }

    /// Speed argument for the engine, compensating the duration change of the pitch shift.
    pub fn engine_speed(&self) -> f32 {
        let speed = self.speed / pcm::pitch_factor(self.pitch);
        speed.clamp(*ENGINE_SPEED_RANGE.start(), *ENGINE_SPEED_RANGE.end())
    }
}

fn check_range(field: &str, value: f32, range: &RangeInclusive<f32>) -> Result<f32, PipelineError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(PipelineError::Validation(format!("{} must be between {} and {}, got {}", field, range.start(), range.end(), value)))
    }
}

/// Check the text is non-blank and within [`MAX_TEXT_CHARS`].
///
/// # Errors
/// Returns [`PipelineError::Validation`] describing the violation.
pub fn validate_text(text: &str) -> Result<(), PipelineError> {
    if text.trim().is_empty() {
        return Err(PipelineError::Validation("text must not be empty".to_string()));
    }

    let chars = text.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(PipelineError::Validation(format!("text must be at most {} characters, got {}", MAX_TEXT_CHARS, chars)));
    }

    Ok(())
}

/// Chunking and hand-off settings for one synthesis stream.
#[derive(Debug, Clone, Copy)]
pub struct InvokerOptions {
    pub chunk_frames: usize,     // Stereo frames per PCM chunk
    pub channel_capacity: usize, // Chunks buffered ahead of the transcoder
}

impl Default for InvokerOptions {
    fn default() -> Self {
        Self { chunk_frames: 4096, channel_capacity: 4 }
    }
}

/// Lazy sequence of PCM chunks filled by the engine.
///
/// End of stream means synthesis completed; an `Err` item terminates the stream.
/// Dropping it stops the engine worker before its next sentence or chunk.
#[derive(Debug)]
pub struct PcmStream {
    rx: mpsc::Receiver<Result<PcmChunk, PipelineError>>,
}

impl PcmStream {
    /// Receive the next chunk, or `None` once synthesis is complete.
    pub async fn next_chunk(&mut self) -> Option<Result<PcmChunk, PipelineError>> {
        self.rx.recv().await
    }

    /// Wrap an existing receiver, feeding a transcoder without an engine.
    #[cfg(test)]
    pub fn from_receiver(rx: mpsc::Receiver<Result<PcmChunk, PipelineError>>) -> Self {
        Self { rx }
    }
}

/// Start synthesizing `text` with `voice`.
///
/// Validation happens before anything is scheduled: on failure no chunk is produced
/// and no worker is started.
///
/// # Errors
/// Returns [`PipelineError::Validation`] if the text is empty or too long.
pub fn synthesize(voice: Arc<VoiceModel>, text: &str, params: SynthesisParams, options: InvokerOptions) -> Result<PcmStream, PipelineError> {
    validate_text(text)?;

    let sentences = split_sentences(text);
    let chunk_bytes = options.chunk_frames.max(1) * FRAME_BYTES;
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

    debug!("Synthesizing {} sentence(s) with voice '{}' from {} ({:?})", sentences.len(), voice.name(), voice.path().display(), params);

    tokio::task::spawn_blocking(move || produce(&voice, &sentences, params, chunk_bytes, &tx));

    Ok(PcmStream { rx })
}

/// Engine worker: synthesize each sentence, render it, and push it downstream in order.
fn produce(voice: &VoiceModel, sentences: &[String], params: SynthesisParams, chunk_bytes: usize, tx: &mpsc::Sender<Result<PcmChunk, PipelineError>>) {
    let engine_speed = params.engine_speed();

    for (i, sentence) in sentences.iter().enumerate() {
        if tx.is_closed() {
            debug!("PCM consumer gone, stopping synthesis at sentence {}/{}", i + 1, sentences.len());
            return;
        }

        let audio = voice.engine().synthesize(sentence, engine_speed);
        let rendered = audio.and_then(|audio| pcm::render(&audio.samples, audio.sample_rate, params.pitch, params.volume));

        let mut pcm = match rendered {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("❌ Synthesis failed for voice '{}' at sentence {}/{}: {:#}", voice.name(), i + 1, sentences.len(), e);
                let _ = tx.blocking_send(Err(PipelineError::Synthesis(format!("{:#}", e))));
                return;
            }
        };

        while !pcm.is_empty() {
            let chunk = pcm.split_to(chunk_bytes.min(pcm.len()));
            if tx.blocking_send(Ok(chunk)).is_err() {
                debug!("PCM consumer gone, stopping synthesis");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::synthesizer::testing::ToneEngine;

    fn tone_voice(engine: ToneEngine) -> Arc<VoiceModel> {
        Arc::new(VoiceModel::new("tone", "tone.onnx", Box::new(engine)))
    }

    #[test]
    fn test_params_defaults() {
        let params = SynthesisParams::from_request(ProsodyRequest::default()).unwrap();
        assert_eq!(params, SynthesisParams { speed: 1.0, pitch: 0.0, volume: 0.0 });
    }

    #[test]
    fn test_params_bounds() {
        let too_fast = ProsodyRequest { speed: Some(5.0), ..Default::default() };
        let err = SynthesisParams::from_request(too_fast).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref msg) if msg.contains("speed")));

        let low_pitch = ProsodyRequest { pitch: Some(-48.5), ..Default::default() };
        assert!(SynthesisParams::from_request(low_pitch).is_err());

        let loud = ProsodyRequest { volume: Some(150.0), ..Default::default() };
        assert!(SynthesisParams::from_request(loud).is_ok());
    }

    #[test]
    fn test_engine_speed_compensates_pitch() {
        let params = SynthesisParams { speed: 1.0, pitch: 12.0, volume: 0.0 };
        assert!((params.engine_speed() - 0.5).abs() < 1e-5);

        let extreme = SynthesisParams { speed: 0.1, pitch: 48.0, volume: 0.0 };
        assert_eq!(extreme.engine_speed(), 0.05);
    }

    #[test]
    fn test_validate_text() {
        assert!(validate_text("こんにちは").is_ok());
        assert!(validate_text("   ").is_err());
        assert!(validate_text(&"あ".repeat(MAX_TEXT_CHARS)).is_ok());
        assert!(validate_text(&"あ".repeat(MAX_TEXT_CHARS + 1)).is_err());
    }

    #[tokio::test]
    async fn test_too_long_text_never_reaches_engine() {
        let engine = ToneEngine::new(48000, 480);
        let calls = engine.calls.clone();
        let result = synthesize(tone_voice(engine), &"a".repeat(MAX_TEXT_CHARS + 1), SynthesisParams::default(), InvokerOptions::default());

        assert!(matches!(result, Err(PipelineError::Validation(_))));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_yields_ordered_chunks() {
        let engine = ToneEngine::new(48000, 1000);
        let options = InvokerOptions { chunk_frames: 300, channel_capacity: 2 };
        let mut stream = synthesize(tone_voice(engine), "One. Two.", SynthesisParams::default(), options).unwrap();

        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            sizes.push(chunk.unwrap().len());
        }

        // 1000 frames per sentence split into 300/300/300/100
        let per_sentence = [1200, 1200, 1200, 400];
        let expected: Vec<usize> = per_sentence.iter().chain(per_sentence.iter()).copied().collect();
        assert_eq!(sizes, expected);
    }

    #[tokio::test]
    async fn test_engine_failure_terminates_stream() {
        let engine = ToneEngine::new(48000, 100).failing_on(2);
        let mut stream = synthesize(tone_voice(engine), "First. Second. Third.", SynthesisParams::default(), InvokerOptions::default()).unwrap();

        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert!(matches!(stream.next_chunk().await, Some(Err(PipelineError::Synthesis(_)))));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_engine() {
        let engine = ToneEngine::new(48000, 4800);
        let calls = engine.calls.clone();
        let text = "Go. ".repeat(100);
        let options = InvokerOptions { chunk_frames: 4800, channel_capacity: 1 };
        let mut stream = synthesize(tone_voice(engine), &text, SynthesisParams::default(), options).unwrap();

        assert!(stream.next_chunk().await.is_some());
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) < 10);
    }
}
