//! Runtime error reporting.

use std::fmt;

/// A runtime fault: the message `raise`d or produced by a failed
/// operation, plus a rendered call-stack trace captured at the point of
/// failure (innermost frame first, matching the reference interpreter's
/// `runtimeError`).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<String>) -> Self {
        RuntimeError {
            message: message.into(),
            trace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
