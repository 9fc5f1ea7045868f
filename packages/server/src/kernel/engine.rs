//! Speech engine contract: model tiers, the transcription result shape,
//! and the error taxonomy the worker's retry policy is keyed on.
//!
//! The engine itself is an external collaborator. The production adapter
//! shells out to a configured command that prints the result as JSON; tests
//! use the scripted stub from [`crate::kernel::testing`].

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::kernel::model_pool::ModelLease;

// ============================================================================
// Model tiers
// ============================================================================

/// Named model size, totally ordered smallest to largest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "model_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub const ALL: [ModelTier; 5] = [
        ModelTier::Tiny,
        ModelTier::Base,
        ModelTier::Small,
        ModelTier::Medium,
        ModelTier::Large,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Base => "base",
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }

    /// The next tier down, used for OOM fallback. `None` at `tiny`.
    pub fn next_smaller(self) -> Option<ModelTier> {
        match self {
            ModelTier::Tiny => None,
            ModelTier::Base => Some(ModelTier::Tiny),
            ModelTier::Small => Some(ModelTier::Base),
            ModelTier::Medium => Some(ModelTier::Small),
            ModelTier::Large => Some(ModelTier::Medium),
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tiny" => Ok(ModelTier::Tiny),
            "base" => Ok(ModelTier::Base),
            "small" => Ok(ModelTier::Small),
            "medium" => Ok(ModelTier::Medium),
            "large" => Ok(ModelTier::Large),
            other => Err(anyhow::anyhow!("unknown model tier '{}'", other)),
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    OutOfMemory,
    CorruptAudioFile,
    TransientNetworkError,
    FileNotFound,
    PermissionError,
    EngineError,
    UnknownError,
}

impl ErrorKind {
    /// Whether the worker may re-publish the task after this failure.
    /// OutOfMemory and CorruptAudioFile have dedicated recovery paths on
    /// top of this (tier fallback, audio repair).
    pub fn retryable(&self) -> bool {
        match self {
            ErrorKind::OutOfMemory
            | ErrorKind::CorruptAudioFile
            | ErrorKind::TransientNetworkError
            | ErrorKind::EngineError
            | ErrorKind::UnknownError => true,
            ErrorKind::FileNotFound | ErrorKind::PermissionError => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::CorruptAudioFile => "CorruptAudioFile",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionError => "PermissionError",
            ErrorKind::EngineError => "EngineError",
            ErrorKind::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an engine-raised message to a taxonomy kind by case-insensitive
/// substring match against a fixed pattern set.
pub fn classify(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();

    if lower.contains("out of memory") || lower.contains("oom") {
        ErrorKind::OutOfMemory
    } else if lower.contains("cannot reshape tensor") || lower.contains("0 elements") {
        ErrorKind::CorruptAudioFile
    } else if lower.contains("timeout") || lower.contains("connection") {
        ErrorKind::TransientNetworkError
    } else if lower.contains("file not found") || lower.contains("no such file") {
        ErrorKind::FileNotFound
    } else if lower.contains("permission denied") {
        ErrorKind::PermissionError
    } else {
        ErrorKind::UnknownError
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build from a raw message, classifying the kind from its content.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(&message),
            message,
        }
    }
}

// ============================================================================
// Transcription output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub language: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub file_path: PathBuf,
    /// ISO language code; `None` means auto-detect.
    pub language: Option<String>,
}

/// Capability contract for the external speech-to-text engine.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn transcribe(
        &self,
        model: &ModelLease,
        request: &TranscribeRequest,
        cancel: &CancellationToken,
    ) -> Result<Transcription, EngineError>;
}

// ============================================================================
// Subprocess adapter
// ============================================================================

/// Engine adapter that invokes a configured command and parses its JSON
/// stdout as a [`Transcription`]. The model tier, language, and audio path
/// are appended as trailing arguments.
pub struct CommandEngine {
    command: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SpeechEngine for CommandEngine {
    async fn transcribe(
        &self,
        model: &ModelLease,
        request: &TranscribeRequest,
        cancel: &CancellationToken,
    ) -> Result<Transcription, EngineError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::new(ErrorKind::EngineError, "empty engine command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--model")
            .arg(model.tier.as_str())
            .arg("--language")
            .arg(request.language.as_deref().unwrap_or("auto"))
            .arg(&request.file_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::classified(format!("engine spawn failed: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::new(ErrorKind::EngineError, "engine stdout unavailable"))?;
        let mut output = Vec::new();

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(EngineError::new(ErrorKind::EngineError, "engine run cancelled"));
            }
            read = stdout.read_to_end(&mut output) => {
                read.map_err(|e| {
                    EngineError::classified(format!("engine output read failed: {}", e))
                })?;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::classified(format!("engine wait failed: {}", e)))?;

        if !status.success() {
            let mut stderr_out = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_out).await;
            }
            return Err(EngineError::classified(format!(
                "engine exited with {}: {}",
                status,
                stderr_out.trim()
            )));
        }

        serde_json::from_slice(&output)
            .map_err(|e| EngineError::classified(format!("engine produced invalid output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_totally_ordered() {
        assert!(ModelTier::Tiny < ModelTier::Base);
        assert!(ModelTier::Base < ModelTier::Small);
        assert!(ModelTier::Small < ModelTier::Medium);
        assert!(ModelTier::Medium < ModelTier::Large);
    }

    #[test]
    fn fallback_walks_down_to_tiny() {
        assert_eq!(ModelTier::Large.next_smaller(), Some(ModelTier::Medium));
        assert_eq!(ModelTier::Base.next_smaller(), Some(ModelTier::Tiny));
        assert_eq!(ModelTier::Tiny.next_smaller(), None);
    }

    #[test]
    fn tier_round_trips_through_str() {
        for tier in ModelTier::ALL {
            assert_eq!(tier.as_str().parse::<ModelTier>().unwrap(), tier);
        }
        assert!("huge".parse::<ModelTier>().is_err());
    }

    #[test]
    fn classifier_maps_known_patterns() {
        assert_eq!(classify("CUDA out of memory"), ErrorKind::OutOfMemory);
        assert_eq!(
            classify("cannot reshape tensor of 0 elements"),
            ErrorKind::CorruptAudioFile
        );
        assert_eq!(
            classify("Connection reset by peer"),
            ErrorKind::TransientNetworkError
        );
        assert_eq!(classify("read timeout"), ErrorKind::TransientNetworkError);
        assert_eq!(
            classify("No such file or directory"),
            ErrorKind::FileNotFound
        );
        assert_eq!(classify("Permission denied"), ErrorKind::PermissionError);
        assert_eq!(classify("something novel"), ErrorKind::UnknownError);
    }

    #[test]
    fn classifier_is_case_insensitive() {
        assert_eq!(classify("OUT OF MEMORY"), ErrorKind::OutOfMemory);
        assert_eq!(classify("PERMISSION DENIED"), ErrorKind::PermissionError);
    }

    #[test]
    fn retry_policy_table() {
        assert!(ErrorKind::OutOfMemory.retryable());
        assert!(ErrorKind::CorruptAudioFile.retryable());
        assert!(ErrorKind::TransientNetworkError.retryable());
        assert!(ErrorKind::EngineError.retryable());
        assert!(ErrorKind::UnknownError.retryable());
        assert!(!ErrorKind::FileNotFound.retryable());
        assert!(!ErrorKind::PermissionError.retryable());
    }

    #[test]
    fn error_kind_serializes_as_taxonomy_value() {
        let json = serde_json::to_string(&ErrorKind::OutOfMemory).unwrap();
        assert_eq!(json, "\"OutOfMemory\"");
    }
}
