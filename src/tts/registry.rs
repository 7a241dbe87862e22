//! Voice model registry, built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

use super::synthesizer::SpeechEngine;
use crate::error::PipelineError;

/// Fatal failure while scanning the model directory.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read model directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A named speech engine bound to one model file.
pub struct VoiceModel {
    name: String,                        // Voice name (model file stem)
    path: PathBuf,                       // Model file the engine was built from
    engine: Mutex<Box<dyn SpeechEngine>>, // Engines are not reentrant
}

impl VoiceModel {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, engine: Box<dyn SpeechEngine>) -> Self {
        Self { name: name.into(), path: path.into(), engine: Mutex::new(engine) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive access to the engine for one synthesis call.
    pub fn engine(&self) -> MutexGuard<'_, Box<dyn SpeechEngine>> {
        self.engine.lock()
    }
}

impl std::fmt::Debug for VoiceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceModel").field("name", &self.name).field("path", &self.path).finish_non_exhaustive()
    }
}

/// Immutable mapping from voice name to loaded model.
///
/// There is no mutation API: handlers share it behind an `Arc` without locking.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    voices: HashMap<String, Arc<VoiceModel>>,
    names: Vec<String>, // Directory enumeration order
}

impl ModelRegistry {
    /// Scan `dir` once and load one engine per regular file.
    ///
    /// The voice name is the file name without its extension. Files the loader rejects
    /// are logged and left out; a duplicate base name keeps the first file seen.
    ///
    /// # Arguments
    /// * `dir` - Flat model directory
    /// * `load` - Builds the engine for one model file
    ///
    /// # Errors
    /// Returns an error if the directory itself cannot be read.
    pub fn initialize<F>(dir: &Path, mut load: F) -> Result<Self, RegistryError>
    where
        F: FnMut(&Path) -> anyhow::Result<Box<dyn SpeechEngine>>,
    {
        let unreadable = |source| RegistryError::Unreadable { path: dir.to_path_buf(), source };
        let mut registry = Self::default();

        for entry in std::fs::read_dir(dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            if !path.is_file() {
                continue;
            }

            let Some(name) = voice_name(&path) else {
                warn!("Skipping model file with unusable name: {}", path.display());
                continue;
            };

            if registry.voices.contains_key(&name) {
                warn!("Skipping {}: voice '{}' is already registered", path.display(), name);
                continue;
            }

            match load(&path) {
                Ok(engine) => {
                    registry.names.push(name.clone());
                    registry.voices.insert(name.clone(), Arc::new(VoiceModel::new(name, path, engine)));
                }
                Err(e) => warn!("⚠️  Failed to load voice model {}: {:#}", path.display(), e),
            }
        }

        info!("📚 Registered {} voice(s) from {}", registry.names.len(), dir.display());
        Ok(registry)
    }

    /// Build a registry from already constructed models, preserving their order.
    pub fn from_models(models: impl IntoIterator<Item = VoiceModel>) -> Self {
        let mut registry = Self::default();
        for model in models {
            if registry.voices.contains_key(model.name()) {
                continue;
            }
            registry.names.push(model.name().to_string());
            registry.voices.insert(model.name().to_string(), Arc::new(model));
        }
        registry
    }

    /// Look up a voice by name.
    ///
    /// # Errors
    /// Returns [`PipelineError::VoiceNotFound`] naming the requested voice.
    pub fn lookup(&self, name: &str) -> Result<Arc<VoiceModel>, PipelineError> {
        self.voices.get(name).cloned().ok_or_else(|| PipelineError::VoiceNotFound(name.to_string()))
    }

    /// Voice names in a stable order (directory enumeration order).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Voice name for a model file: its base name with the extension stripped.
fn voice_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_string())
}
