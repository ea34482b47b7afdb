//! Bytecode container and opcode set shared by the compiler and the VM.

pub mod chunk;
pub mod ops;

pub use chunk::{Chunk, ConstantsPool, LineTable};
pub use ops::{Op, UpvalueCapture};
