//! Speech engines: the trait the pipeline drives and its sherpa-onnx VITS implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sherpa_rs::OnnxConfig;
use sherpa_rs::tts::{VitsTts, VitsTtsConfig};
use tracing::{debug, info};

use crate::config::{Provider, ServerConfig};

/// Mono audio produced by one engine invocation.
#[derive(Debug, Clone, Default)]
pub struct EngineAudio {
    pub samples: Vec<f32>, // Mono samples in [-1, 1]
    pub sample_rate: u32,  // Native rate of the model
}

/// A loaded, ready-to-run speech synthesis engine.
///
/// Engines are not reentrant; callers serialize access (see [`super::VoiceModel`]).
pub trait SpeechEngine: Send {
    /// Synthesize one sentence.
    ///
    /// # Arguments
    /// * `text` - The text to speak
    /// * `speed` - Speed multiplier (1.0 = natural)
    ///
    /// # Errors
    /// Returns an error if the engine fails to generate audio.
    fn synthesize(&mut self, text: &str, speed: f32) -> Result<EngineAudio>;
}

/// Engine resources shared by every voice: dictionary, tokens and execution mode.
#[derive(Debug, Clone)]
pub struct EngineResources {
    pub tokens: PathBuf,          // Token table shared by all voices
    pub lexicon: Option<PathBuf>, // Optional pronunciation lexicon
    pub dict_dir: PathBuf,        // Segmentation / OpenJTalk dictionary
    pub data_dir: PathBuf,        // espeak-ng data directory
    pub provider: Provider,       // Execution provider
    pub num_threads: usize,       // Threads per engine
    pub debug: bool,              // sherpa-onnx debug output
}

impl EngineResources {
    /// Collect the fixed engine resources from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            tokens: config.tokens_path(),
            lexicon: config.lexicon_path(),
            dict_dir: config.dict_dir(),
            data_dir: config.espeak_data_dir(),
            provider: config.effective_provider(),
            num_threads: config.tts_threads,
            debug: config.verbose,
        }
    }
}

impl EngineResources {
    /// Verify everything sherpa-onnx will open for `model`.
    ///
    /// `VitsTts::new` cannot report a failed load, so sherpa-onnx must never see a bad path.
    pub fn check(&self, model: &Path) -> Result<()> {
        let metadata = std::fs::metadata(model).with_context(|| format!("Cannot read model file {}", model.display()))?;
        if metadata.len() == 0 {
            anyhow::bail!("Model file {} is empty", model.display());
        }

        if !self.tokens.is_file() {
            anyhow::bail!("Tokens file {} not found", self.tokens.display());
        }
        if let Some(lexicon) = self.lexicon.as_ref().filter(|p| !p.is_file()) {
            anyhow::bail!("Lexicon {} not found", lexicon.display());
        }
        // espeak-ng needs its phoneme table when a data directory is in use
        if self.data_dir.is_dir() && !self.data_dir.join("phontab").is_file() {
            anyhow::bail!("espeak-ng data directory {} has no phontab", self.data_dir.display());
        }
        Ok(())
    }
}

/// sherpa-onnx VITS engine bound to a single model file.
pub struct SherpaEngine {
    tts: VitsTts,
}

impl SherpaEngine {
    /// Load a VITS model with the shared resources.
    ///
    /// # Arguments
    /// * `model` - Path to the `.onnx` model file
    /// * `resources` - Fixed dictionary/token resources and execution mode
    ///
    /// # Errors
    /// Returns an error if the model file or a required resource is missing.
    pub fn load(model: &Path, resources: &EngineResources) -> Result<Self> {
        resources.check(model)?;

        debug!("Loading VITS model {} with {} provider", model.display(), resources.provider);

        let config = VitsTtsConfig {
            model: model.to_string_lossy().to_string(),
            tokens: resources.tokens.to_string_lossy().to_string(),
            lexicon: resources.lexicon.as_ref().map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
            dict_dir: path_if_exists(&resources.dict_dir),
            data_dir: path_if_exists(&resources.data_dir),
            length_scale: 1.0, // Speed is applied per request
            noise_scale: 0.667,
            noise_scale_w: 0.8,
            onnx_config: OnnxConfig {
                provider: resources.provider.as_sherpa_provider().to_string(),
                num_threads: resources.num_threads.try_into().unwrap_or(1),
                debug: resources.debug,
            },
            ..Default::default()
        };

        let tts = VitsTts::new(config);
        info!("🎙️  Loaded voice model {}", model.display());

        Ok(Self { tts })
    }
}

impl SpeechEngine for SherpaEngine {
    fn synthesize(&mut self, text: &str, speed: f32) -> Result<EngineAudio> {
        let audio = self.tts.create(text, 0, speed).map_err(|e| anyhow::anyhow!("TTS generation failed: {}", e))?;
        Ok(EngineAudio { samples: audio.samples, sample_rate: audio.sample_rate })
    }
}

/// Optional resource directories are passed as empty strings when absent.
fn path_if_exists(path: &Path) -> String {
    if path.exists() { path.to_string_lossy().to_string() } else { String::new() }
}

/// Split text into sentences for incremental synthesis.
///
/// Breaks after Latin and CJK sentence terminators and on newlines.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);

        if matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    sentences
}
