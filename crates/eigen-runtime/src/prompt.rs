//! Prompt construction for chat completions.

use std::fmt;
use std::path::Path;

use base64::Engine;
use eigen_local::{
    ChatMessage, ContentPart, ImageUrl, MessageContent, ModelCapabilities, ReasoningSplitter, Role,
};
use serde::{Deserialize, Serialize};

use crate::store::{ChatTurn, TurnRole};

/// System prompt for chat title generation.
pub const TITLE_PROMPT: &str =
    "Generate a short chat title (3-6 words max). Return ONLY the title, no quotes, no explanation.";

/// Token budget for a title.
pub const TITLE_MAX_TOKENS: u32 = 30;

/// Title used when the model gives nothing usable.
pub const FALLBACK_TITLE: &str = "New chat";

const TITLE_INPUT_CHARS: usize = 300;
const TITLE_MAX_CHARS: usize = 80;

/// An image attached to a turn, already base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data_base64: String,
}

impl ImagePayload {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Guess the MIME type from a file extension, defaulting to JPEG.
    pub fn mime_for_path(path: &Path) -> &'static str {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("bmp") => "image/bmp",
            _ => "image/jpeg",
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

/// A text document whose contents go inline into the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub text: String,
}

/// The user's new message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTurn {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub images: Vec<ImagePayload>,
}

impl NewTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// What gets stored as the user turn.
    pub fn to_chat_turn(&self) -> ChatTurn {
        ChatTurn {
            images: self.images.clone(),
            ..ChatTurn::user(render_user_text(self))
        }
    }
}

/// Something the caller should tell the user about the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptWarning {
    /// The current model has no vision support.
    ImagesDropped { count: usize },
}

impl fmt::Display for PromptWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptWarning::ImagesDropped { count } => write!(
                f,
                "{} image(s) dropped: the current model does not support vision",
                count
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedPrompt {
    pub messages: Vec<ChatMessage>,
    pub warnings: Vec<PromptWarning>,
}

/// Build the message list for one generation.
///
/// System prompt first, then the last `history_limit` turns of `history`
/// in order, then `turn`.
pub fn build_prompt(
    history: &[ChatTurn],
    turn: &NewTurn,
    system_prompt: &str,
    capabilities: &ModelCapabilities,
    history_limit: usize,
) -> FormattedPrompt {
    let mut messages = Vec::with_capacity(history.len().min(history_limit) + 2);
    messages.push(ChatMessage::text(Role::System, system_prompt));

    let recent = &history[history.len().saturating_sub(history_limit)..];
    for past in recent {
        let role = match past.role {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
        };
        let images: &[ImagePayload] = if capabilities.vision {
            &past.images
        } else {
            &[]
        };
        messages.push(ChatMessage {
            role,
            content: content(&past.content, images),
        });
    }

    let mut warnings = Vec::new();
    let images: &[ImagePayload] = if capabilities.vision {
        &turn.images
    } else {
        if !turn.images.is_empty() {
            warnings.push(PromptWarning::ImagesDropped {
                count: turn.images.len(),
            });
        }
        &[]
    };
    messages.push(ChatMessage {
        role: Role::User,
        content: content(&render_user_text(turn), images),
    });

    FormattedPrompt { messages, warnings }
}

fn content(text: &str, images: &[ImagePayload]) -> MessageContent {
    if images.is_empty() {
        return MessageContent::Text(text.to_string());
    }
    let mut parts = vec![ContentPart::Text {
        text: text.to_string(),
    }];
    parts.extend(images.iter().map(|image| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: image.data_url(),
        },
    }));
    MessageContent::Parts(parts)
}

/// User text followed by each attachment as a fenced block.
fn render_user_text(turn: &NewTurn) -> String {
    let mut text = turn.text.clone();
    for attachment in &turn.attachments {
        let longest_run = longest_backtick_run(&attachment.text);
        let fence = "`".repeat(longest_run.max(2) + 1);
        let language = language_hint(&attachment.file_name);
        text.push_str(&format!(
            "\n\n**{}**\n{}{}\n{}\n{}",
            attachment.file_name,
            fence,
            language,
            attachment.text.trim_end_matches('\n'),
            fence
        ));
    }
    text
}

fn longest_backtick_run(text: &str) -> usize {
    text.split(|c| c != '`').map(str::len).max().unwrap_or(0)
}

/// Fence language for a file name, empty when unknown.
pub fn language_hint(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("js" | "mjs" | "cjs") => "javascript",
        Some("jsx") => "jsx",
        Some("ts") => "typescript",
        Some("tsx") => "tsx",
        Some("json") => "json",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        Some("md" | "markdown") => "markdown",
        Some("sh" | "bash" | "zsh") => "bash",
        Some("c" | "h") => "c",
        Some("cpp" | "cc" | "cxx" | "hpp") => "cpp",
        Some("go") => "go",
        Some("java") => "java",
        Some("kt") => "kotlin",
        Some("swift") => "swift",
        Some("rb") => "ruby",
        Some("html" | "htm") => "html",
        Some("css") => "css",
        Some("sql") => "sql",
        Some("csv") => "csv",
        Some("xml") => "xml",
        _ => "",
    }
}

/// Messages asking the model to title a chat starting with `first_message`.
pub fn title_messages(first_message: &str) -> Vec<ChatMessage> {
    let mut input: String = first_message.chars().take(TITLE_INPUT_CHARS).collect();
    if input.len() < first_message.len() {
        input.push_str("...");
    }
    vec![
        ChatMessage::text(Role::System, TITLE_PROMPT),
        ChatMessage::text(Role::User, input),
    ]
}

/// Reduce a raw completion to a single-line title.
pub fn clean_title(raw: &str) -> String {
    let mut splitter = ReasoningSplitter::new();
    let mut answer = splitter.push(raw).content;
    answer.push_str(&splitter.finish().content);

    let title: String = answer
        .trim()
        .lines()
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect();

    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISION: ModelCapabilities = ModelCapabilities {
        vision: true,
        reasoning: false,
    };
    const TEXT_ONLY: ModelCapabilities = ModelCapabilities {
        vision: false,
        reasoning: false,
    };

    fn text_of(message: &ChatMessage) -> &str {
        match &message.content {
            MessageContent::Text(text) => text,
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::Text { text } => text,
                ContentPart::ImageUrl { .. } => "",
            },
        }
    }

    fn image() -> ImagePayload {
        ImagePayload::from_bytes("image/png", &[0x89, b'P', b'N', b'G'])
    }

    #[test]
    fn test_system_first_then_history_then_turn() {
        let history = vec![ChatTurn::user("a"), ChatTurn::assistant("b", "thinking")];
        let prompt = build_prompt(&history, &NewTurn::text("c"), "sys", &TEXT_ONLY, 20);

        let roles: Vec<Role> = prompt.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::System, Role::User, Role::Assistant, Role::User]);
        let texts: Vec<&str> = prompt.messages.iter().map(text_of).collect();
        assert_eq!(texts, ["sys", "a", "b", "c"]);
        assert!(prompt.warnings.is_empty());
    }

    #[test]
    fn test_history_is_truncated_to_most_recent() {
        let history: Vec<ChatTurn> = (0..30).map(|i| ChatTurn::user(i.to_string())).collect();
        let prompt = build_prompt(&history, &NewTurn::text("new"), "sys", &TEXT_ONLY, 20);

        assert_eq!(prompt.messages.len(), 22);
        assert_eq!(text_of(&prompt.messages[1]), "10");
        assert_eq!(text_of(&prompt.messages[20]), "29");
    }

    #[test]
    fn test_deterministic() {
        let history = vec![ChatTurn::user("a")];
        let turn = NewTurn {
            text: "b".into(),
            attachments: vec![Attachment {
                file_name: "x.rs".into(),
                text: "fn main() {}".into(),
            }],
            images: vec![image()],
        };
        assert_eq!(
            build_prompt(&history, &turn, "s", &VISION, 20),
            build_prompt(&history, &turn, "s", &VISION, 20)
        );
    }

    #[test]
    fn test_images_for_vision_model() {
        let turn = NewTurn {
            text: "what is this?".into(),
            images: vec![image()],
            ..NewTurn::default()
        };
        let prompt = build_prompt(&[], &turn, "sys", &VISION, 20);

        match &prompt.messages[1].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                match &parts[1] {
                    ContentPart::ImageUrl { image_url } => {
                        assert!(image_url.url.starts_with("data:image/png;base64,"))
                    }
                    other => panic!("unexpected part: {:?}", other),
                }
            }
            other => panic!("unexpected content: {:?}", other),
        }
        assert!(prompt.warnings.is_empty());
    }

    #[test]
    fn test_images_dropped_without_vision() {
        let turn = NewTurn {
            text: "what is this?".into(),
            images: vec![image(), image()],
            ..NewTurn::default()
        };
        let prompt = build_prompt(&[], &turn, "sys", &TEXT_ONLY, 20);

        assert_eq!(
            prompt.messages[1].content,
            MessageContent::Text("what is this?".into())
        );
        assert_eq!(prompt.warnings, [PromptWarning::ImagesDropped { count: 2 }]);
    }

    #[test]
    fn test_attachments_are_fenced() {
        let turn = NewTurn {
            text: "review".into(),
            attachments: vec![
                Attachment {
                    file_name: "main.rs".into(),
                    text: "fn main() {}\n".into(),
                },
                Attachment {
                    file_name: "README.md".into(),
                    text: "```sh\ncargo run\n```".into(),
                },
            ],
            ..NewTurn::default()
        };
        let prompt = build_prompt(&[], &turn, "sys", &TEXT_ONLY, 20);

        assert_eq!(
            text_of(&prompt.messages[1]),
            "review\n\n**main.rs**\n```rust\nfn main() {}\n```\
             \n\n**README.md**\n````markdown\n```sh\ncargo run\n```\n````"
        );
    }

    #[test]
    fn test_language_hint() {
        assert_eq!(language_hint("lib.RS"), "rust");
        assert_eq!(language_hint("config.yml"), "yaml");
        assert_eq!(language_hint("notes"), "");
    }

    #[test]
    fn test_title_messages_truncate_long_input() {
        let long = "é".repeat(400);
        let messages = title_messages(&long);
        assert_eq!(messages[0], ChatMessage::text(Role::System, TITLE_PROMPT));
        let input = text_of(&messages[1]);
        assert_eq!(input.chars().count(), 303);
        assert!(input.ends_with("..."));
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  \"Rust Ownership Basics\"\n"), "Rust Ownership Basics");
        assert_eq!(clean_title("'Trip plan'\nExplanation: ..."), "Trip plan");
        assert_eq!(clean_title("<think>hmm</think>\nBaking Bread"), "Baking Bread");
        assert_eq!(clean_title("   "), FALLBACK_TITLE);
        assert_eq!(clean_title(&"x".repeat(200)).len(), 80);
    }
}
