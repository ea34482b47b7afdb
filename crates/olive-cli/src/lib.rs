//! olive-cli — file runner and REPL for the Olive language.
//!
//! Mirrors `vitte-cli`'s split: `main.rs` stays a thin shim over [`run`], so
//! the actual argument handling and the two execution modes (one-shot file,
//! persistent REPL) are unit-testable from this crate directly. Neither mode
//! is part of the core language (`spec.md` §1 explicitly places "the CLI
//! entry point and argument parsing... the REPL line editor" out of scope
//! for `olive-core`/`olive-compiler`/`olive-vm`) — this crate is where that
//! externally-owned behavior lives.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use olive_core::ConstantsPool;
use olive_vm::{RuntimeError, Vm};

/// `olive [path] [--trace] [--stress-gc] [--heap-growth <factor>]`
#[derive(Parser, Debug)]
#[command(name = "olive", version, about = "Olive language runner and REPL")]
pub struct Args {
    /// Script to run. Omit to start an interactive REPL.
    pub path: Option<PathBuf>,

    /// Emit `tracing` spans/events (GC cycles, call frames, compiler scopes)
    /// to stderr. Equivalent to setting `RUST_LOG=olive=trace`.
    #[arg(long)]
    pub trace: bool,

    /// Run a full GC cycle before every heap allocation, per §4.4's stress
    /// mode. Exercises the collector far more often than its normal
    /// allocation-threshold trigger; useful for shaking out rooting bugs.
    #[arg(long)]
    pub stress_gc: bool,

    /// Overrides the GC's heap-growth multiplier (default 2.0).
    #[arg(long, value_name = "factor")]
    pub heap_growth: Option<f64>,
}

/// One exit-code-bearing failure path out of `main`, per `spec.md` §6's
/// `olive <path.olv>` usage table. Usage errors (exit 64) are handled
/// earlier, directly off `clap`'s own parse failure in `main.rs` — by the
/// time a [`CliError`] exists, argument parsing has already succeeded.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("couldn't read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Compile(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl CliError {
    /// `spec.md` §6: unsupported usage 64, file I/O failure 74, compile
    /// error 65, runtime error 70 — the sysexits.h convention the original
    /// CLI already follows.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Compile(_) => 65,
            CliError::Runtime(_) => 70,
            CliError::Io { .. } => 74,
        }
    }
}

/// Installs a `tracing-subscriber` `fmt` layer with an env-filter, matching
/// the teacher's `vitte-cli` logging setup. `--trace` forces `olive=trace`;
/// otherwise `RUST_LOG` (default `olive=warn`) governs verbosity.
pub fn init_tracing(force_trace: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if force_trace {
        EnvFilter::new("olive=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("olive=warn"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

/// Entry point called from `main.rs`. A single `anyhow` error path out of
/// `main`, matching `vitte-cli`'s own `run()`/`main()` split — the concrete
/// [`CliError`] underneath is recovered in [`exit_code`] to pick the process
/// exit status.
pub fn run(args: Args) -> anyhow::Result<()> {
    match &args.path {
        Some(path) => run_file(path, args.stress_gc, args.heap_growth)?,
        None => run_repl(args.stress_gc, args.heap_growth)?,
    }
    Ok(())
}

/// Recovers the `sysexits.h`-style exit code `main` should use for a failure
/// returned from [`run`]. Anything that isn't a recognized [`CliError`]
/// (there shouldn't be any such case, but `anyhow::Error` can't prove it)
/// falls back to 70, `EX_SOFTWARE`.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>().map_or(70, CliError::exit_code)
}

fn new_vm(stress_gc: bool, heap_growth: Option<f64>) -> Vm {
    let mut vm = Vm::with_options(stress_gc);
    if let Some(factor) = heap_growth {
        vm.heap_mut().set_growth_factor(factor);
    }
    vm
}

fn format_compile_errors(errors: &[olive_compiler::CompileError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

/// Compiles and runs a single file, per `spec.md` §6's `olive <path.olv>`.
fn run_file(path: &Path, stress_gc: bool, heap_growth: Option<f64>) -> Result<(), CliError> {
    tracing::debug!(path = %path.display(), stress_gc, "running file");
    let source = std::fs::read_to_string(path).map_err(|source| CliError::Io { path: path.to_path_buf(), source })?;

    let mut vm = new_vm(stress_gc, heap_growth);
    let function = olive_compiler::compile(&source, vm.heap_mut())
        .map_err(|errors| CliError::Compile(format_compile_errors(&errors)))?;

    vm.interpret(function)?;
    Ok(())
}

/// Interactive REPL, per `spec.md` §6 ("`olive` with no args enters REPL").
/// Persists the `Vm`'s heap/globals and the compiler's `ConstantsPool`/
/// `global_constant_index` across turns (§3's "entries persist across REPL
/// turns"), so a name bound to constant index 3 in one turn is still index 3
/// in the next. A compile or runtime error ends that turn, not the session —
/// `spec.md` §7's "REPL clears `had_error` between turns".
fn run_repl(stress_gc: bool, heap_growth: Option<f64>) -> Result<(), CliError> {
    tracing::debug!(stress_gc, "starting repl");
    println!("Olive REPL — Ctrl+D to exit");

    let mut vm = new_vm(stress_gc, heap_growth);
    let constants: ConstantsPool = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut global_constant_index = olive_core::Table::new();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush().map_err(|source| CliError::Io { path: PathBuf::from("<stdout>"), source })?;

        line.clear();
        let bytes_read =
            io::stdin().read_line(&mut line).map_err(|source| CliError::Io { path: PathBuf::from("<stdin>"), source })?;
        if bytes_read == 0 {
            println!();
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let (result, persisted) =
            olive_compiler::compile_repl(&line, vm.heap_mut(), constants.clone(), global_constant_index.clone());
        global_constant_index = persisted;

        let function = match result {
            Ok(function) => function,
            Err(errors) => {
                eprintln!("{}", format_compile_errors(&errors));
                continue;
            }
        };

        if let Err(err) = vm.interpret_repl(function) {
            eprintln!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_sysexits_convention() {
        assert_eq!(CliError::Compile("x".into()).exit_code(), 65);
        assert_eq!(
            CliError::Io { path: PathBuf::from("x"), source: io::Error::other("x") }.exit_code(),
            74
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = run_file(Path::new("/nonexistent/olive/script.olv"), false, None).unwrap_err();
        assert_eq!(err.exit_code(), 74);
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let dir = std::env::temp_dir().join("olive_cli_test_syntax_error.olv");
        std::fs::write(&dir, "def (").unwrap();
        let err = run_file(&dir, false, None).unwrap_err();
        let _ = std::fs::remove_file(&dir);
        assert_eq!(err.exit_code(), 65);
    }

    #[test]
    fn runtime_error_propagates_with_exit_70() {
        let dir = std::env::temp_dir().join("olive_cli_test_runtime_error.olv");
        std::fs::write(&dir, "print undefined_name;").unwrap();
        let err = run_file(&dir, false, None).unwrap_err();
        let _ = std::fs::remove_file(&dir);
        assert_eq!(err.exit_code(), 70);
    }
}
