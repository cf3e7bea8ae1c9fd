use thiserror::Error;

use crate::token::Token;

/// A structurally invalid program: bad token, unresolved or duplicate name,
/// bad indentation, misplaced construct, invalid assignment target.
///
/// Compilation is all-or-nothing; no partial program is ever loaded.
#[derive(Debug, Clone, Error)]
#[error("compile error at line {line}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: usize,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        CompileError {
            message: message.into(),
            line,
        }
    }

    pub(crate) fn at(token: &Token, message: impl Into<String>) -> Self {
        CompileError::new(message, token.line)
    }
}
