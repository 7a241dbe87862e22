//! Server configuration and CLI argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Hardware acceleration provider for ONNX models.
/// Auto-detected based on platform if not specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// CPU inference (default fallback, always available)
    #[default]
    Cpu,
    /// NVIDIA CUDA acceleration (Linux only, requires CUDA toolkit)
    Cuda,
    /// Apple CoreML acceleration (macOS only, uses Neural Engine)
    #[value(name = "coreml")]
    CoreMl,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sherpa_provider())
    }
}

impl Provider {
    /// Convert to sherpa-rs provider string.
    pub fn as_sherpa_provider(&self) -> &'static str {
        match self {
            Provider::Cpu => "cpu",
            Provider::Cuda => "cuda",
            Provider::CoreMl => "coreml",
        }
    }
}

/// Streaming TTS server configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "voice-stream")]
#[command(author, version, about = "Streaming text-to-speech server (ADTS AAC over HTTP)", long_about = None)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, short = 'p', env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Flat directory of voice models; each file's base name becomes a voice name
    #[arg(long, short = 'd', env = "MODEL_DIR", default_value_os_t = default_base_dir().join("models"))]
    pub model_dir: PathBuf,

    /// Directory with the shared engine resources (tokens.txt, lexicon.txt, dict/, espeak-ng-data/)
    #[arg(long, short = 'r', env = "TTS_RESOURCE_DIR", default_value_os_t = default_base_dir().join("resources"))]
    pub resource_dir: PathBuf,

    /// Hardware acceleration provider (auto-detected if not specified)
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Threads per voice engine (0 = auto-detect based on CPU cores)
    #[arg(long, default_value = "0")]
    pub tts_threads: usize,

    /// Transcoder executable; bare names are looked up on PATH
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// AAC bitrate handed to the transcoder
    #[arg(long, default_value = "128k")]
    pub aac_bitrate: String,

    /// Stereo frames carried by each PCM chunk
    #[arg(long, default_value = "4096")]
    pub chunk_frames: usize,

    /// Capacity of each bounded hand-off channel between pipeline stages
    #[arg(long, default_value = "4")]
    pub channel_capacity: usize,

    /// Per-request deadline in seconds (0 = no deadline)
    #[arg(long, default_value = "300")]
    pub request_timeout_secs: u64,

    /// Rate limit window length in seconds
    #[arg(long, default_value = "60")]
    pub rate_limit_window_secs: u64,

    /// Synthesis requests allowed per client within one window (0 = unlimited)
    #[arg(long, default_value = "20")]
    pub rate_limit_max_requests: usize,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl ServerConfig {
    /// Parse configuration from command line arguments and environment.
    pub fn from_args() -> Self {
        let mut config = Self::parse();
        config.normalize_thread_counts();
        config
    }

    /// Resolve the engine thread count when left on auto.
    ///
    /// With CUDA the GPU handles parallelism, so one CPU thread per engine avoids
    /// contention. On CPU, cores/3 leaves headroom for concurrent requests and ffmpeg.
    fn normalize_thread_counts(&mut self) {
        if self.tts_threads == 0 {
            self.tts_threads = if self.effective_provider() == Provider::Cuda { 1 } else { (num_cpus::get() / 3).max(1) };
        }
    }

    /// Get the effective execution provider.
    pub fn effective_provider(&self) -> Provider {
        self.provider.unwrap_or_else(detect_provider)
    }

    /// Socket address the server binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", addr, e))
    }

    /// Get the path to the engine tokens file.
    pub fn tokens_path(&self) -> PathBuf {
        self.resource_dir.join("tokens.txt")
    }

    /// Get the lexicon path, or `None` when the voices rely on the dictionary/espeak data instead.
    pub fn lexicon_path(&self) -> Option<PathBuf> {
        let path = self.resource_dir.join("lexicon.txt");
        path.exists().then_some(path)
    }

    /// Get the path to the dictionary directory (jieba / OpenJTalk).
    pub fn dict_dir(&self) -> PathBuf {
        self.resource_dir.join("dict")
    }

    /// Get the path to the espeak-ng data directory.
    pub fn espeak_data_dir(&self) -> PathBuf {
        self.resource_dir.join("espeak-ng-data")
    }

    /// Per-request deadline, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.model_dir.is_dir() {
            anyhow::bail!("Model directory does not exist: {}", self.model_dir.display());
        }

        if !self.resource_dir.is_dir() {
            anyhow::bail!("Resource directory does not exist: {}", self.resource_dir.display());
        }

        if !self.tokens_path().exists() {
            anyhow::bail!("Required resource file not found: {}", self.tokens_path().display());
        }

        if self.chunk_frames == 0 {
            anyhow::bail!("Chunk frames must be positive");
        }

        if self.channel_capacity == 0 {
            anyhow::bail!("Channel capacity must be positive");
        }

        if self.rate_limit_max_requests > 0 && self.rate_limit_window_secs == 0 {
            anyhow::bail!("Rate limit window must be positive when rate limiting is enabled");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Listen: {}:{}", self.host, self.port);
        info!("  Model directory: {}", self.model_dir.display());
        info!("  Resource directory: {}", self.resource_dir.display());
        info!("  TTS provider: {} ({} threads)", self.effective_provider(), self.tts_threads);
        info!("  Transcoder: {} (AAC {})", self.ffmpeg.display(), self.aac_bitrate);
        info!("  Chunk frames: {}, channel capacity: {}", self.chunk_frames, self.channel_capacity);
        match self.request_timeout() {
            Some(timeout) => info!("  Request timeout: {}s", timeout.as_secs()),
            None => info!("  Request timeout: disabled"),
        }
        if self.rate_limit_max_requests > 0 {
            info!("  Rate limit: {} requests / {}s", self.rate_limit_max_requests, self.rate_limit_window_secs);
        } else {
            info!("  Rate limit: disabled");
        }
    }
}

/// Get the default base directory (~/.voice-stream).
fn default_base_dir() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() { home_dir.join(".voice-stream") } else { PathBuf::from(".") }
}

/// Auto-detect the best hardware acceleration provider.
fn detect_provider() -> Provider {
    #[cfg(target_os = "macos")]
    {
        Provider::CoreMl
    }

    #[cfg(target_os = "linux")]
    {
        if has_nvidia_gpu() { Provider::Cuda } else { Provider::Cpu }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Provider::Cpu
    }
}

/// Check if an NVIDIA GPU is available (Linux only).
#[cfg(target_os = "linux")]
fn has_nvidia_gpu() -> bool {
    use std::path::Path;

    ["/dev/nvidia0", "/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvhost-ctrl", "/etc/nv_tegra_release"]
        .iter()
        .any(|path| Path::new(path).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["voice-stream"];
        argv.extend_from_slice(args);
        ServerConfig::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--model-dir", "/tmp/models", "--provider", "cpu"]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.chunk_frames, 4096);
        assert_eq!(config.rate_limit_window_secs, 60);
        assert_eq!(config.rate_limit_max_requests, 20);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.effective_provider(), Provider::Cpu);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = parse(&["--request-timeout-secs", "0"]);
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_missing_model_dir() {
        let config = parse(&["--model-dir", "/definitely/not/here"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Model directory"));
    }

    #[test]
    fn test_validate_accepts_complete_layout() {
        let models = tempfile::tempdir().unwrap();
        let resources = tempfile::tempdir().unwrap();
        std::fs::write(resources.path().join("tokens.txt"), "a 0\n").unwrap();

        let config = parse(&["--model-dir", models.path().to_str().unwrap(), "--resource-dir", resources.path().to_str().unwrap()]);
        assert!(config.validate().is_ok());
        assert!(config.lexicon_path().is_none());
    }

    #[test]
    fn test_bind_addr() {
        let config = parse(&["--host", "127.0.0.1", "--port", "8080"]);
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:8080");
    }
}
