//! External transcoder management.
//!
//! Spawns one ffmpeg process per request that turns raw PCM into ADTS AAC,
//! and guarantees the process never outlives its request.

mod command;
mod session;

pub use command::{TranscoderCommand, resolve_executable};
pub use session::{EncodedChunk, SessionOptions, Transcoder, TranscoderSession};
