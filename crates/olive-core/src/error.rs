//! error.rs — errors shared across the data-model layer.
//!
//! Grounded on `crates/olive-core/src/lib.rs`'s `Error` enum style (one
//! `thiserror` enum per crate, `#[from]` for wrapped causes).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("constant pool index {0} out of range")]
    ConstantOutOfRange(u32),

    #[error("jump offset {0} exceeds the 16-bit range")]
    JumpOverflow(i64),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
