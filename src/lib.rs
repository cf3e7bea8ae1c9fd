//! Cinder: a small embeddable scripting language.
//!
//! Source text is tokenized, compiled in a single pass to bytecode, and run
//! by a stack-based virtual machine over a garbage-collected byte arena. The
//! host drives everything through [`Engine`]: register native functions,
//! then hand it source text.

pub mod bytecode;
pub mod error;
pub mod lexer;
pub mod runtime;
pub mod token;

pub use bytecode::{CompileError, Compiler, Op, Program, disassemble};
pub use error::ScriptError;
pub use lexer::{Lexer, LexerError};
pub use runtime::{Engine, EngineConfig, MemoryError, NativeCall, RuntimeError};
pub use token::{Token, TokenKind};
