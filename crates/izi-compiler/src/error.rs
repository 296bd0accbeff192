//! Compile-time diagnostics.

use std::fmt;

/// One reported compile error: `[line N] Error at '<lexeme>': <message>`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub lexeme: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] Error at '{}': {}",
            self.line, self.lexeme, self.message
        )
    }
}

/// Collects every diagnostic the compiler reported while it kept consuming
/// input to completion. Returned when `had_error` was sticky at the end of
/// compilation.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}
