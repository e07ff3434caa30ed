//! Storefront admin CLI.
//!
//! Talks to the admin API of the storefront on behalf of a logged in administrator. The session
//! is kept in a file between invocations, so `storefront login` only needs to run once.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
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
