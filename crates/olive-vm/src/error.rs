//! error.rs — runtime diagnostics.
//!
//! Grounded on `vm.c`'s `runtimeError`: one line for the message, then one
//! line per active call frame (innermost first) giving the source line and
//! either `<function>()` or `script`. The original builds this by walking
//! `vm.frames` directly inside `runtimeError` and printing as it goes; here
//! the walk happens once, at the point of failure (see `Vm::runtime_error`),
//! and is captured as data so the caller decides how and where to print it.
//!
//! Unlike [`olive_compiler::CompileError`], this isn't a single-line
//! `thiserror` string template — the frame list needs an iterated `Display`,
//! which `#[error(...)]` can't express directly, so `Display` is hand-written
//! below.

use std::fmt;

/// One entry of a runtime stack trace, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTrace {
    pub line: u32,
    /// `None` for the top-level script frame (printed as `script`, matching
    /// `object.c`'s `printFunction` treatment of a nameless `ObjFunction`).
    pub function_name: Option<String>,
}

impl fmt::Display for FrameTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error, carrying the full call-stack snapshot taken at the
/// moment it was raised. `frames` is ordered innermost-first, same as
/// `runtimeError`'s `for (int i = vm.frameCount - 1; i >= 0; i--)` loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub frames: Vec<FrameTrace>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_one_line_per_frame_innermost_first() {
        let err = RuntimeError {
            message: "Undefined variable 'x'.".to_string(),
            frames: vec![
                FrameTrace { line: 4, function_name: Some("inner".to_string()) },
                FrameTrace { line: 1, function_name: None },
            ],
        };
        let rendered = err.to_string();
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("Undefined variable 'x'."));
        assert_eq!(lines.next(), Some("[line 4] in inner()"));
        assert_eq!(lines.next(), Some("[line 1] in script"));
    }
}
