//! Chat command - stream replies from the loaded model.

use std::io::Write;
use std::path::{Path, PathBuf};

use eigen_runtime::prompt::ImagePayload;
use eigen_runtime::{Attachment, NewTurn, Runtime, RuntimeEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use super::runtime;

pub(crate) struct ChatOptions {
    pub message: Option<String>,
    pub chat_id: String,
    pub images: Vec<PathBuf>,
    pub attachments: Vec<PathBuf>,
    pub show_reasoning: bool,
}

pub(crate) async fn run(options: ChatOptions) -> miette::Result<()> {
    let runtime = runtime()?;
    let mut events = runtime.events();

    let model = runtime
        .boot()
        .await
        .map_err(|e| miette::miette!("Failed to start model: {}", e))?;
    let Some(model) = model else {
        return Err(miette::miette!(
            "No model downloaded. Run `eigen models pull <id>` first."
        ));
    };

    let mut pending = NewTurn {
        text: String::new(),
        attachments: read_attachments(&options.attachments)?,
        images: read_images(&options.images)?,
    };

    let result = match &options.message {
        Some(message) => {
            pending.text = message.clone();
            send(&runtime, &mut events, &options, pending).await
        }
        None => {
            println!("Chatting with {}. Ctrl-C stops a reply, Ctrl-D exits.", model);
            repl(&runtime, &mut events, &options, pending).await
        }
    };

    runtime.shutdown().await;
    result
}

async fn repl(
    runtime: &Runtime,
    events: &mut broadcast::Receiver<RuntimeEvent>,
    options: &ChatOptions,
    mut first: NewTurn,
) -> miette::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut titled = false;

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line
                .map_err(|e| miette::miette!("Failed to read input: {}", e))?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let turn = NewTurn {
            text: text.to_string(),
            ..std::mem::take(&mut first)
        };
        send(runtime, events, options, turn).await?;

        if !titled {
            titled = true;
            match runtime.suggest_title(text).await {
                Ok(title) => println!("[{}]", title),
                Err(e) => tracing::debug!("No title: {}", e),
            }
        }
    }
}

/// Send one turn and print the reply as it streams.
async fn send(
    runtime: &Runtime,
    events: &mut broadcast::Receiver<RuntimeEvent>,
    options: &ChatOptions,
    turn: NewTurn,
) -> miette::Result<()> {
    let started = runtime
        .chat_stream(&options.chat_id, turn)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    for warning in &started.warnings {
        eprintln!("warning: {}", warning);
    }

    let mut in_reasoning = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                runtime.cancel_generation();
                continue;
            }
        };
        match event {
            Ok(RuntimeEvent::GenerationDelta {
                chat_id,
                content,
                reasoning,
            }) if chat_id == options.chat_id => {
                if options.show_reasoning && !reasoning.is_empty() {
                    if !in_reasoning {
                        print!("\x1b[2m");
                        in_reasoning = true;
                    }
                    print!("{}", reasoning);
                }
                if !content.is_empty() {
                    if in_reasoning {
                        print!("\x1b[0m\n\n");
                        in_reasoning = false;
                    }
                    print!("{}", content);
                }
                std::io::stdout().flush().ok();
            }
            Ok(RuntimeEvent::GenerationEnd {
                chat_id,
                elapsed_ms,
                ..
            }) if chat_id == options.chat_id => {
                if in_reasoning {
                    print!("\x1b[0m");
                }
                println!();
                tracing::debug!("Reply took {}ms", elapsed_ms);
                return Ok(());
            }
            Ok(RuntimeEvent::GenerationError {
                chat_id, message, ..
            }) if chat_id == options.chat_id => {
                if in_reasoning {
                    print!("\x1b[0m");
                }
                println!();
                return Err(miette::miette!("Generation failed: {}", message));
            }
            Ok(RuntimeEvent::ModelError { message, .. }) => {
                eprintln!("model error: {}", message);
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(miette::miette!("Event channel closed")),
        }
    }
}

/// Suggest a title using the selected model.
pub(crate) async fn title(text: &str) -> miette::Result<()> {
    let runtime = runtime()?;
    let booted = runtime
        .boot()
        .await
        .map_err(|e| miette::miette!("Failed to start model: {}", e))?;
    if booted.is_none() {
        return Err(miette::miette!(
            "No model downloaded. Run `eigen models pull <id>` first."
        ));
    }
    let result = runtime.suggest_title(text).await;
    runtime.shutdown().await;
    println!("{}", result.map_err(|e| miette::miette!("{}", e))?);
    Ok(())
}

fn read_attachments(paths: &[PathBuf]) -> miette::Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|path| {
            let text = std::fs::read_to_string(path)
                .map_err(|e| miette::miette!("Failed to read {}: {}", path.display(), e))?;
            Ok(Attachment {
                file_name: file_name(path),
                text,
            })
        })
        .collect()
}

fn read_images(paths: &[PathBuf]) -> miette::Result<Vec<ImagePayload>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .map_err(|e| miette::miette!("Failed to read {}: {}", path.display(), e))?;
            Ok(ImagePayload::from_bytes(
                ImagePayload::mime_for_path(path),
                &bytes,
            ))
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_attachments_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes").unwrap();

        let attachments = read_attachments(&[path]).unwrap();
        assert_eq!(
            attachments,
            [Attachment {
                file_name: "notes.md".into(),
                text: "# Notes".into(),
            }]
        );
        assert!(read_attachments(&[dir.path().join("missing.txt")]).is_err());
    }

    #[test]
    fn test_read_images_detects_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.PNG");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let images = read_images(&[path]).unwrap();
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].data_base64, "AQID");
    }
}
