//! Model management commands.

use eigen_runtime::{
    DownloadAccepted, ModelListing, ModelRuntimeState, RuntimeEvent, LOCAL_MODEL_ID,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use super::{format_bytes, runtime};

/// List catalog models.
pub(crate) fn list(json: bool) -> miette::Result<()> {
    let runtime = runtime()?;
    let models = runtime.list_models();

    if json {
        let out = serde_json::to_string_pretty(&models)
            .map_err(|e| miette::miette!("Failed to serialize models: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    println!("Models:");
    for listing in &models {
        let origin = if listing.descriptor.id == LOCAL_MODEL_ID {
            " (placed by hand)"
        } else {
            ""
        };
        println!(
            "  {:<16} {:<10} {:<14} {}{}",
            listing.descriptor.id,
            listing.descriptor.size_label,
            state_label(listing),
            listing.descriptor.name,
            origin
        );
    }
    println!();
    println!("Models directory: {}", runtime.config().models_dir().display());

    if !models
        .iter()
        .any(|m| m.state != ModelRuntimeState::NotDownloaded)
    {
        println!();
        println!("To download a model, run:");
        println!("  eigen models pull <id>");
    }
    Ok(())
}

pub(crate) fn state_label(listing: &ModelListing) -> String {
    match listing.state {
        ModelRuntimeState::NotDownloaded => "-".to_string(),
        ModelRuntimeState::Downloading => match listing.download_percent {
            Some(percent) => format!("{:.0}%", percent),
            None => "downloading".to_string(),
        },
        ModelRuntimeState::Downloaded => "downloaded".to_string(),
        ModelRuntimeState::Current => "current".to_string(),
    }
}

/// Download a model, showing progress. Ctrl-C cancels.
pub(crate) async fn pull(id: &str) -> miette::Result<()> {
    let runtime = runtime()?;
    let mut events = runtime.events();

    let total = match runtime
        .download_model(id)
        .map_err(|e| miette::miette!("{}", e))?
    {
        DownloadAccepted::AlreadyDownloaded => {
            println!("Model '{}' is already downloaded.", id);
            return Ok(());
        }
        DownloadAccepted::Started | DownloadAccepted::AlreadyRunning => runtime
            .catalog()
            .get(id)
            .map(|d| d.files.total_bytes())
            .unwrap_or_default(),
    };

    println!("Downloading model: {} ({})", id, format_bytes(total));
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map_err(|e| miette::miette!("Invalid progress bar template: {}", e))?
            .progress_chars("#>-"),
    );

    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                pb.set_message("cancelling");
                runtime.cancel_download(id);
                continue;
            }
        };
        match event {
            Ok(RuntimeEvent::DownloadProgress {
                model_id,
                bytes_downloaded,
                total_bytes,
                ..
            }) if model_id == id => {
                pb.set_length(total_bytes);
                pb.set_position(bytes_downloaded);
            }
            Ok(RuntimeEvent::DownloadComplete { model_id }) if model_id == id => {
                pb.finish_with_message("Download complete");
                println!("Model '{}' downloaded.", id);
                return Ok(());
            }
            Ok(RuntimeEvent::DownloadCancelled { model_id }) if model_id == id => {
                pb.abandon();
                println!("Download cancelled.");
                return Ok(());
            }
            Ok(RuntimeEvent::DownloadError { model_id, message }) if model_id == id => {
                pb.abandon();
                return Err(miette::miette!("Failed to download model: {}", message));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => {
                return Err(miette::miette!("Event channel closed"));
            }
        }
    }
}

/// Delete a downloaded model.
pub(crate) async fn remove(id: &str) -> miette::Result<()> {
    let runtime = runtime()?;
    runtime
        .delete_model(id)
        .await
        .map_err(|e| miette::miette!("Failed to delete model: {}", e))?;
    println!("Deleted model '{}'.", id);
    Ok(())
}

/// Load a model once to check it works and remember it.
pub(crate) async fn select(id: &str) -> miette::Result<()> {
    let runtime = runtime()?;
    println!("Loading model '{}'...", id);
    let result = runtime.switch_model(id).await;
    runtime.shutdown().await;
    result.map_err(|e| miette::miette!("Failed to switch model: {}", e))?;
    println!("Now using '{}'.", id);
    Ok(())
}
