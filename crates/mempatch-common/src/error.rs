use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Memory operation failed at {address:#x}: {message}")]
    Memory { address: usize, message: String },

    #[error("Address range {start:#x}..{end:#x} is not fully mapped")]
    UnmappedRange { start: usize, end: usize },

    #[error("Module error: {0}")]
    Module(String),

    #[error("Symbol `{symbol}` not found: {message}")]
    SymbolNotFound { symbol: String, message: String },

    #[error("No patch group with id {0} exists")]
    UnknownPatchGroup(u32),

    #[error("Patch group ids exhausted")]
    PatchGroupIdsExhausted,

    #[error("Core ids exhausted")]
    CoreIdsExhausted,

    #[error("No core with id {0} is connected")]
    UnknownCore(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Truncated data: needed {needed} more byte(s), {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Codegen failed: {0}")]
    Codegen(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn memory(address: usize, message: impl Into<String>) -> Self {
        Self::Memory {
            address,
            message: message.into(),
        }
    }

    pub fn module(message: impl Into<String>) -> Self {
        Self::Module(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Check if this error came from the validation layer (rejected input,
    /// as opposed to a runtime failure).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_helper() {
        let err = Error::validation("empty name");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Validation failed: empty name");
    }

    #[test]
    fn test_io_error_is_not_validation() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::Io(io_err);
        assert!(!err.is_validation());
    }
}
