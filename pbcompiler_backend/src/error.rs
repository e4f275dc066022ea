//! Error types for the sequencer backend

use std::path::PathBuf;

use thiserror::Error;

/// Backend error type
#[derive(Debug, Error)]
pub enum SequencerError {
    /// A field holds a value that cannot be used as the required numeric type
    #[error("{scope}: field `{field}` {reason}")]
    Format {
        scope: String,
        field: &'static str,
        reason: String,
    },

    /// A scan slot (or plan parameter) falls outside the instruction table
    #[error("scan plan rejected: {reason}")]
    InstructionRange { reason: String },

    /// Save target already exists and the caller has not confirmed overwrite
    #[error("refusing to overwrite existing file `{}`", .path.display())]
    FileExists { path: PathBuf },

    /// Load target does not exist
    #[error("sequence file not found: `{}`", .path.display())]
    MissingFile { path: PathBuf },

    /// Board selection or initialization failed; fatal at startup
    #[error("board initialization failed: {0}")]
    HardwareInit(String),

    /// Edge-source subscription trouble; logged and tolerated at runtime
    #[error("edge source error: {0}")]
    EdgeSource(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SequencerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Format {
            scope: "document".into(),
            field: "syntax",
            reason: format!("is not valid JSON ({err})"),
        }
    }
}

impl SequencerError {
    /// Format error for a table instruction, named by its index.
    pub fn instr_format(index: usize, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Format {
            scope: format!("instruction {index}"),
            field,
            reason: reason.into(),
        }
    }

    /// Format error for a scan slot, named by its position in the plan.
    pub fn slot_format(slot: usize, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Format {
            scope: format!("slot {slot}"),
            field,
            reason: reason.into(),
        }
    }

    /// Format error for a named document section.
    pub fn section_format(section: &str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Format {
            scope: format!("section [{section}]"),
            field,
            reason: reason.into(),
        }
    }

    pub fn range(reason: impl Into<String>) -> Self {
        Self::InstructionRange {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SequencerError>;
