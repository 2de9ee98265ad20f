//! Reconf CLI library
//!
//! Scenario loading, offline rendering and the seeded simulator behind the
//! `reconfctl` binary.

#![allow(missing_docs)]

pub mod render;
pub mod scenario;
pub mod simulator;

pub use render::{render_item, RenderReport};
pub use scenario::{Scenario, Step};
pub use simulator::{run_simulation, SimulationReport, SimulatorConfig};

/// Install the global tracing subscriber
///
/// Honors `RUST_LOG`, defaulting to `level`. Logs go to stderr so reports
/// on stdout stay parseable.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("tracing already initialized: {err}");
    }
}
