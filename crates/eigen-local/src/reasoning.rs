//! Splits a raw token stream into reasoning and answer text.
//!
//! Reasoning models wrap their chain of thought in `<think>` ... `</think>`.
//! Tags may arrive split across any number of fragments, so the splitter
//! holds back only the trailing text that could still become a tag.

/// Opening reasoning tag.
pub const REASONING_OPEN: &str = "<think>";
/// Closing reasoning tag.
pub const REASONING_CLOSE: &str = "</think>";

/// Text routed to each channel by one `push`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub content: String,
    pub reasoning: String,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty()
    }

    fn append(&mut self, channel: Channel, text: &str) {
        match channel {
            Channel::Content => self.content.push_str(text),
            Channel::Reasoning => self.reasoning.push_str(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Content,
    Reasoning,
}

/// Two-state machine over {Content, Reasoning}.
#[derive(Debug, Clone)]
pub struct ReasoningSplitter {
    channel: Channel,
    pending: String,
    open: String,
    close: String,
}

impl ReasoningSplitter {
    pub fn new() -> Self {
        Self::with_tags(REASONING_OPEN, REASONING_CLOSE)
    }

    /// Use custom delimiters.
    pub fn with_tags(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            channel: Channel::Content,
            pending: String::new(),
            open: open.into(),
            close: close.into(),
        }
    }

    /// True while inside a reasoning block.
    pub fn in_reasoning(&self) -> bool {
        self.channel == Channel::Reasoning
    }

    /// Feed one fragment, returning the text that is now unambiguous.
    pub fn push(&mut self, fragment: &str) -> Delta {
        self.pending.push_str(fragment);
        let mut delta = Delta::default();

        loop {
            let tag = match self.channel {
                Channel::Content => self.open.as_str(),
                Channel::Reasoning => self.close.as_str(),
            };

            if let Some(idx) = self.pending.find(tag) {
                let end = idx + tag.len();
                delta.append(self.channel, &self.pending[..idx]);
                self.pending.drain(..end);
                self.channel = match self.channel {
                    Channel::Content => Channel::Reasoning,
                    Channel::Reasoning => Channel::Content,
                };
                continue;
            }

            let keep = tag_prefix_suffix(&self.pending, tag);
            let emit = self.pending.len() - keep;
            delta.append(self.channel, &self.pending[..emit]);
            self.pending.drain(..emit);
            return delta;
        }
    }

    /// Flush held-back text at end of stream.
    ///
    /// An unterminated reasoning block keeps its text in the reasoning channel.
    pub fn finish(&mut self) -> Delta {
        let mut delta = Delta::default();
        let rest = std::mem::take(&mut self.pending);
        delta.append(self.channel, &rest);
        delta
    }
}

impl Default for ReasoningSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
fn tag_prefix_suffix(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            tag.is_char_boundary(k)
                && text.is_char_boundary(text.len() - k)
                && text.ends_with(&tag[..k])
        })
        .unwrap_or(0)
}
