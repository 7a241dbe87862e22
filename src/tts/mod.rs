//! Text-to-speech module using sherpa-rs.
//!
//! Holds the voice model registry and the invoker that turns a voice, text and
//! prosody parameters into a stream of PCM chunks.

pub mod invoker;
mod registry;
mod synthesizer;

pub use invoker::{InvokerOptions, PcmStream, ProsodyRequest, SynthesisParams, synthesize};
pub use registry::{ModelRegistry, VoiceModel};
pub use synthesizer::{EngineResources, SherpaEngine, SpeechEngine};

#[cfg(test)]
pub use synthesizer::testing;
