use crate::dtype::DType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AqlmError {
    #[error("configuration error: {requirement}")]
    Config { requirement: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tensor '{tensor}' has shape {got:?}, expected {expected}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: String,
        got: Vec<usize>,
    },

    #[error("tensor '{tensor}' has dtype {got}, expected {expected}")]
    DTypeMismatch {
        tensor: &'static str,
        expected: String,
        got: DType,
    },

    #[error("code {code} at flat position {position} is outside codebook of size {codebook_size}")]
    CodeOutOfRange {
        code: i64,
        position: usize,
        codebook_size: usize,
    },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by callers to tell configuration mistakes
/// apart from bad tensors and from backend exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    InvalidInput,
    Resource,
    Io,
}

impl AqlmError {
    pub fn config(requirement: impl Into<String>) -> Self {
        AqlmError::Config {
            requirement: requirement.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AqlmError::Config { .. } => ErrorKind::Config,
            AqlmError::InvalidInput(_)
            | AqlmError::ShapeMismatch { .. }
            | AqlmError::DTypeMismatch { .. }
            | AqlmError::CodeOutOfRange { .. } => ErrorKind::InvalidInput,
            AqlmError::Resource(_) => ErrorKind::Resource,
            AqlmError::Io(_) | AqlmError::Json(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, AqlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(AqlmError::config("f16").kind(), ErrorKind::Config);
        assert_eq!(
            AqlmError::InvalidInput("x".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            AqlmError::CodeOutOfRange {
                code: 300,
                position: 0,
                codebook_size: 256
            }
            .kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(AqlmError::Resource("oom".into()).kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_config_message_names_requirement() {
        let e = AqlmError::config("codebooks must be stored as f16");
        assert!(e.to_string().contains("must be stored as f16"));
    }
}
