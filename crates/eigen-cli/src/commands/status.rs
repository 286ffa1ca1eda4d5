//! Status command - show configuration and model state.

use eigen_runtime::{ModelRuntimeState, SelectionStore};

use super::models::state_label;
use super::runtime;

pub(crate) async fn run() -> miette::Result<()> {
    let runtime = runtime()?;
    let config = runtime.config();

    println!("Eigen Local Runtime");
    println!("===================");
    println!();
    println!("Data directory:   {}", config.data_dir.display());
    println!("Models directory: {}", config.models_dir().display());
    println!("Server binary:    {}", config.server_binary.display());
    println!("  Exists: {}", config.server_binary.exists());
    match config.port {
        Some(port) => println!("Port:             {}", port),
        None => println!("Port:             ephemeral"),
    }
    println!("Context length:   {}", config.context_length);
    println!();

    let selection = SelectionStore::new(config.selection_path()).load().await;
    match selection {
        Some(selection) => println!("Selected model:   {}", selection.model_id),
        None => println!("Selected model:   (none)"),
    }

    let installed: Vec<_> = runtime
        .list_models()
        .into_iter()
        .filter(|m| m.state != ModelRuntimeState::NotDownloaded)
        .collect();
    if installed.is_empty() {
        println!("Downloaded:       (none)");
    } else {
        println!("Downloaded:");
        for listing in &installed {
            println!("  - {} ({})", listing.descriptor.id, state_label(listing));
        }
    }
    Ok(())
}
