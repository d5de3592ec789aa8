//! The crate-wide error taxonomy, one variant per category. Typed and
//! structural via `thiserror`; CLI and control-plane boundaries format
//! this directly rather than widening it into an opaque error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeechFlowError {
    /// A pipeline expression or TOML/YAML document could not be parsed or
    /// bound against a stage's parameter schema (spec §4.5 pass 1-2).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A stage failed during its `open()` hook (spec §4.5 pass 3).
    #[error("stage '{stage}' failed to open: {message}")]
    Open { stage: String, message: String },

    /// A stream fault surfaced during the graph's active phase (spec §4.1
    /// contract 4, §4.5 pass 4).
    #[error("stream error on stage '{stage}': {message}")]
    Stream { stage: String, message: String },

    /// An external collaborator (ASR/TTS backend, control-plane peer,
    /// OSC mirror target) failed.
    #[error("external error: {0}")]
    External(String),

    /// Teardown was triggered by an OS signal rather than natural
    /// completion (spec §4.5, §6).
    #[error("terminated by signal: {0}")]
    Signal(String),
}

impl SpeechFlowError {
    pub fn open(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Open {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn stream(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpeechFlowError>;
