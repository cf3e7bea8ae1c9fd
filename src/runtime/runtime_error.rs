use thiserror::Error;

use crate::runtime::value::Value;

/// An invalid operation encountered during execution: type mismatch, bad
/// index, call of a non-callable, return outside a function, a reserved
/// opcode, or the stack-overflow range being exceeded. Aborts the running
/// program, never the host.
#[derive(Debug, Clone, Error)]
#[error("runtime error: {message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }

    pub(crate) fn bad_operation(symbol: &str, a: Value, b: Value) -> Self {
        RuntimeError::new(format!(
            "bad operation '{}' on types: {} and {}",
            symbol,
            a.type_name(),
            b.type_name()
        ))
    }
}
