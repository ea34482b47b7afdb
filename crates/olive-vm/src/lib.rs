//! olive-vm — the stack-based bytecode interpreter: fetch-decode-dispatch
//! loop, call frames, and the `clock` native.
//!
//! Grounded on `vm.c`/`vm.h`'s `VM` struct and `run()` loop, generalized
//! past what that file implements (it predates closures and classes) to
//! cover the full object model in `olive_core::Obj`. See [`Vm`] for the
//! entry points a host embeds against: [`Vm::interpret`] for one-shot
//! scripts, [`Vm::interpret_repl`] for a persistent REPL session, and
//! [`Vm::register_native`] to extend the global natives beyond `clock`.
//!
//! This crate does not depend on `olive-compiler` — it consumes an
//! already-compiled `ObjHandle` (the script's top-level `ObjFunction`,
//! allocated into the same [`olive_core::Heap`] the `Vm` owns). Wiring a
//! source string through `olive_compiler::compile`/`compile_repl` and into
//! a `Vm` is `olive-cli`'s job.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod error;
mod natives;
mod vm;

pub use error::{FrameTrace, RuntimeError};
pub use natives::clock;
pub use vm::{Host, StdoutHost, Vm};
