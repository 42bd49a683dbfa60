//! Configuration
//!
//! Defaults, overridden by the process environment (a `.env` file is loaded
//! into the environment by the binary before this runs), overridden by CLI flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RagError, Result};

// ============================================================================
// Data Directory
// ============================================================================

/// Base directory for local state (~/.instant-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".instant-rag")
}

// ============================================================================
// RagConfig
// ============================================================================

/// Default Ollama endpoint
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RagConfig {
    /// Maximum chunk length (characters)
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks
    pub chunk_overlap: usize,
    /// Embedding model name (`hash` = offline hashing embedder)
    pub embedding_model: String,
    /// Chat model name
    pub llm_model: String,
    /// Ollama base URL
    pub ollama_url: String,
    /// Directory scanned by `ingest` when no inputs are given
    pub data_path: PathBuf,
    /// Directory holding the persisted index and manifest
    pub db_path: PathBuf,
    pub max_upload_size_mb: u64,
    pub upload_timeout_s: u64,
    /// Timeout for each embedding / generation call
    pub request_timeout_s: u64,
    /// Chunks retrieved per question
    pub top_k: usize,
    pub temperature: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        let base = get_data_dir();
        Self {
            chunk_size: 2000,
            chunk_overlap: 200,
            embedding_model: "nomic-embed-text".to_string(),
            llm_model: "llama3.1".to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            data_path: base.join("data"),
            db_path: base.join("db"),
            max_upload_size_mb: 20,
            upload_timeout_s: 180,
            request_timeout_s: 120,
            top_k: 4,
            temperature: 0.3,
        }
    }
}

impl RagConfig {
    /// Build from process environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup on top of the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CHUNK_SIZE") {
            config.chunk_size = parse_var("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("CHUNK_OVERLAP") {
            config.chunk_overlap = parse_var("CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            config.embedding_model = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            config.llm_model = v;
        }
        if let Some(v) = get("OLLAMA_URL") {
            config.ollama_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("DATA_PATH") {
            config.data_path = PathBuf::from(v);
        }
        if let Some(v) = get("DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_UPLOAD_SIZE_MB") {
            config.max_upload_size_mb = parse_var("MAX_UPLOAD_SIZE_MB", &v)?;
        }
        if let Some(v) = get("UPLOAD_TIMEOUT_S") {
            config.upload_timeout_s = parse_var("UPLOAD_TIMEOUT_S", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_S") {
            config.request_timeout_s = parse_var("REQUEST_TIMEOUT_S", &v)?;
        }
        if let Some(v) = get("TOP_K") {
            config.top_k = parse_var("TOP_K", &v)?;
        }
        if let Some(v) = get("LLM_TEMPERATURE") {
            config.temperature = parse_var("LLM_TEMPERATURE", &v)?;
        }

        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfig("chunk_size must be > 0".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::InvalidConfig("top_k must be > 0".to_string()));
        }
        if self.max_upload_size_mb == 0 {
            return Err(RagError::InvalidConfig(
                "max_upload_size_mb must be > 0".to_string(),
            ));
        }
        if self.upload_timeout_s == 0 || self.request_timeout_s == 0 {
            return Err(RagError::InvalidConfig("timeouts must be > 0".to_string()));
        }
        if self.embedding_model.trim().is_empty() || self.llm_model.trim().is_empty() {
            return Err(RagError::InvalidConfig(
                "model names must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::InvalidConfig(format!(
                "temperature {} out of range 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_s)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RagError::InvalidConfig(format!("{} has invalid value '{}'", key, value)))
}

// ============================================================================
// Tests
// ============================================================================
