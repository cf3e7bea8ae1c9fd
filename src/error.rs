use thiserror::Error;

use crate::bytecode::CompileError;
use crate::lexer::LexerError;
use crate::runtime::{MemoryError, RuntimeError};

/// Any failure the engine can report back to the host. Lexer and compile
/// failures abort before execution starts; runtime and memory failures abort
/// the running program only. None of them crash the host process.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}
