//! The thin binary: tracing init, dispatch, and mapping the error
//! taxonomy to process exit codes.

use std::error::Error as _;

fn main() {
    liveforge_utils::initialize_tracing();
    tracing::trace!("starting liveforge");
    if let Err(e) = liveforge_lib::cli::run() {
        eprintln!("error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(e.exit_code());
    }
}
