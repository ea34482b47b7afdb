//! error.rs — compile-time diagnostics.
//!
//! Grounded on `compiler.c`'s `errorAt` (line + offending lexeme + message,
//! `panicMode` suppressing cascades until `synchronize` resets it) and
//! `spec.md` §7's "the compiler runs to completion collecting every error"
//! — so `CompileError` is a single diagnostic and `olive_compiler::compile`
//! returns a `Vec<CompileError>` on failure, not the first one.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[line {line}] Error{where_}: {message}")]
pub struct CompileError {
    pub line: u32,
    /// `" at end"`, `" at 'lexeme'"`, or empty (error tokens carry their own
    /// message and no location phrase, matching `errorAt`'s `TOKEN_ERROR`
    /// branch).
    where_: String,
    pub message: String,
}

impl CompileError {
    pub fn at_token(line: u32, lexeme: Option<&str>, message: impl Into<String>) -> Self {
        let where_ = match lexeme {
            None => String::new(),
            Some(text) => format!(" at '{text}'"),
        };
        CompileError { line, where_, message: message.into() }
    }

    pub fn at_end(line: u32, message: impl Into<String>) -> Self {
        CompileError { line, where_: " at end".to_string(), message: message.into() }
    }

    pub fn bare(line: u32, message: impl Into<String>) -> Self {
        CompileError { line, where_: String::new(), message: message.into() }
    }
}
