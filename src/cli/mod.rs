//! Command-line interface for phpcs-server.
//!
//! Parses flags, loads configuration from the environment, wires the
//! concrete queue, storage, auth, and payloaders together, and maps
//! termination signals onto the service's shutdown token.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, version_text, Cli, Invocation, BUILD, LOCAL_TARGET, TIDE_TARGET,
    VERSION,
};
