use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    Io(#[from] std::io::Error),
    Command(String),
    Timeout(String),
    Filesystem(String),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "I/O error: {}", e),
            CoreError::Command(s) => write!(f, "Command failed: {}", s),
            CoreError::Timeout(s) => write!(f, "Timed out: {}", s),
            CoreError::Filesystem(s) => write!(f, "Filesystem error: {}", s),
        }
    }
}

impl CoreError {
    /// True when the failure was a deadline rather than a non-zero exit.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
