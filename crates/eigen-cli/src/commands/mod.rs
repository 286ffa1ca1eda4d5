//! CLI commands.

pub mod chat;
pub mod models;
pub mod status;

use eigen_runtime::{Runtime, RuntimeConfig};

/// Runtime configured from the environment.
pub(crate) fn runtime() -> miette::Result<Runtime> {
    Runtime::builder(RuntimeConfig::from_env())
        .build()
        .map_err(|e| miette::miette!("Failed to initialise runtime: {}", e))
}

/// Human-readable byte count.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
