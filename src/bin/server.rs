//! Tangent tree HTTP server binary.
//! Run with: cargo run --bin tangent-server

use std::process::ExitCode;

use tangent_tree::start_tangent_tree;

fn main() -> ExitCode {
    start_tangent_tree::run()
}
