//! natives.rs — built-in native functions registered into every fresh `Vm`.
//!
//! Grounded on `vm.c`'s `defineNative("clock", clockNative)`: a zero-arg
//! native returning elapsed time in seconds. The original measures CPU time
//! via `clock() / CLOCKS_PER_SEC` since process start; here `Instant` gives
//! the same observable shape (a monotonically increasing `f64` of seconds)
//! without pulling in a libc clock() binding.
//!
//! `olive_core::object::NativeFn` is `fn(&[Value]) -> Result<Value, String>`,
//! which sidesteps `clockNative`'s own defect: returning `NULL_VAL` as an
//! error sentinel indistinguishable from a legitimate null return. Arity
//! mismatches here are a plain `Err`, not a value a caller could mistake for
//! output.

use std::sync::OnceLock;
use std::time::Instant;

use olive_core::Value;

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// `clock()` — seconds elapsed since the process started.
pub fn clock(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!(
            "'clock' function call expected 0 argument(s). Initialized with {} argument(s) instead.",
            args.len()
        ));
    }
    Ok(Value::number(process_start().elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_arguments() {
        assert!(clock(&[Value::number(1.0)]).is_err());
    }

    #[test]
    fn clock_returns_a_nonnegative_number() {
        let v = clock(&[]).expect("clock() should succeed with no arguments");
        assert!(v.as_number().unwrap() >= 0.0);
    }
}
