//! Logging setup for the command-line entry point

use tracing::{debug, trace};

/// Filter directive for a `-v` count.
pub fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` is ignored; the level comes from the verbosity count alone.
pub fn init_logging(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level(verbose))
        .with_target(verbose >= 2) // Show target module for -vv and above
        .with_line_number(verbose >= 3)
        .with_writer(std::io::stderr)
        .init();

    debug!("directory-helpers started with verbosity level: {}", verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
}
