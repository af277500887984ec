//! flightcli.
//!
//! Drives the cached clients from the command line: looks up users against a users service, or
//! reads records from a simulated database, and reports how many requests or connects the
//! shared caches needed for it.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod config;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
