//! olive-compiler — scanner + single-pass Pratt compiler, source text to
//! `ObjFunction` bytecode.
//!
//! `compile` is the one-shot entry point (a file or `-e` script: fresh
//! constants pool, fresh `global_constant_index`). `compile_repl` is the
//! REPL entry point: it takes and returns the constants pool and
//! `global_constant_index` so a session can compile line after line against
//! one accumulating compilation unit, exactly as `spec.md` §7 describes a
//! REPL session (not a sequence of independent one-shot compiles).

#![forbid(unsafe_code)]

mod compiler;
mod error;
mod scanner;

pub use compiler::{compile, compile_repl};
pub use error::CompileError;
pub use scanner::{Scanner, Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;
    use olive_core::Heap;

    #[test]
    fn compiles_a_trivial_program() {
        let mut heap = Heap::new();
        let result = compile("print 1 + 2;", &mut heap);
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn reports_multiple_errors_without_stopping_at_the_first() {
        let mut heap = Heap::new();
        let result = compile("var x = ;\nvar = 1;\n", &mut heap);
        let errors = result.expect_err("malformed program should fail to compile");
        assert!(errors.len() >= 2, "expected multiple diagnostics, got {errors:?}");
    }

    #[test]
    fn rejects_break_outside_loop_or_switch() {
        let mut heap = Heap::new();
        let result = compile("break;\n", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_reassigning_a_const_binding() {
        let mut heap = Heap::new();
        let result = compile("const x = 1;\nx = 2;\n", &mut heap);
        assert!(result.is_err());
    }
}
