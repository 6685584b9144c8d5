//! Interpreter error types.
//!
//! Three kinds of failure, each with its own path: scan errors surface as
//! error tokens and become compile diagnostics, compile diagnostics
//! accumulate into [`CompileErrors`], and runtime failures become a
//! [`RuntimeError`] carrying a stack trace. There is no unwinding; every
//! path is a `Result`.

use std::error::Error;
use std::fmt;

/// The outcome of interpreting a piece of source text.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileErrors),
    Runtime(RuntimeError),
}

/// One or more compile-time diagnostics, already formatted as
/// `[line N] Error at '<lexeme>': <message>`.
#[derive(Debug)]
pub struct CompileErrors {
    pub diagnostics: Vec<String>,
}

/// A runtime failure: the message plus one `[line N] in <name>` entry per
/// active call frame, innermost first.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(e) => e.fmt(f),
            InterpretError::Runtime(e) => e.fmt(f),
        }
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.diagnostics.join("\n"))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl Error for InterpretError {}
impl Error for CompileErrors {}
impl Error for RuntimeError {}

impl From<CompileErrors> for InterpretError {
    fn from(e: CompileErrors) -> Self {
        InterpretError::Compile(e)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> Self {
        InterpretError::Runtime(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_join_lines() {
        let errors = CompileErrors {
            diagnostics: vec![
                "[line 1] Error at ';': Expected expression".to_string(),
                "[line 2] Error at end: Expected ';' after value".to_string(),
            ],
        };
        let text = errors.to_string();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("[line 1]"));
    }

    #[test]
    fn test_runtime_error_includes_trace() {
        let error = RuntimeError {
            message: "Operands must be numbers".to_string(),
            trace: vec![
                "[line 3] in inner()".to_string(),
                "[line 8] in script".to_string(),
            ],
        };
        let text = error.to_string();
        assert!(text.contains("Operands must be numbers"));
        assert!(text.ends_with("[line 8] in script"));
    }
}
