//! olive-cli/src/main.rs — entry point for the `olive` binary.
//!
//! Kept minimal on purpose: parse nothing here, install the logger, and
//! delegate to `olive_cli::run()` so the actual behavior stays unit-testable
//! from `lib.rs` (`cargo test -p olive-cli`).

use clap::Parser;
use olive_cli::Args;

fn main() {
    // `clap`'s own usage-error exit code (2) doesn't match `spec.md` §6's
    // "unsupported usage -> exit 64", so parse failures exit 64 directly
    // instead of letting `Args::parse()` call `process::exit` on our behalf.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => err.exit(),
            _ => {
                eprint!("{err}");
                std::process::exit(64);
            }
        },
    };

    olive_cli::init_tracing(args.trace);

    if let Err(err) = olive_cli::run(args) {
        eprintln!("olive: {err:#}");
        std::process::exit(olive_cli::exit_code(&err));
    }
}
