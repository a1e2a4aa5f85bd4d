//! vxcache.
//!
//! vxcache is the disk-backed resource cache of the VoiceXML execution
//! platform. It stores fetched documents, compiled grammars and prompt
//! audio under opaque keys, hands them back to the interpreter on demand,
//! and keeps the on-disk footprint inside a configured budget by evicting
//! unpinned entries. This binary wraps the service library with process
//! bootstrap and maintenance commands.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
