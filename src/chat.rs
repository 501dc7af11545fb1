//! Conversation state for the coder
//!
//! A transcript is the fixed system preamble, a few example turns for the
//! active edit format, injected file contents, sealed prior turns, and the
//! in-progress turn. The in-progress turn stays mutable until the edit cycle
//! completes or the caller abandons it.

use crate::error::CoderError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// System prompt for commit message generation.
pub const COMMIT_MESSAGE_PROMPT: &str = "You are an expert software engineer. \
Reply with a single-line commit message for the diff below, in the imperative \
mood, at most 72 characters, with no quotes and no trailing period.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message content: plain text, or opaque multimodal parts passed through
/// to the provider unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    /// Flatten to text for token estimation and logging. Multimodal parts
    /// contribute their serialized form.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: &str) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.to_string()),
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.to_string()),
        }
    }
}

/// What to do when the projected prompt exceeds the model's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Proceed and flag the overflow to the caller.
    #[default]
    Warn,
    /// Refuse to send the request.
    Strict,
}

/// File contents injected into the prompt, split by mutability.
#[derive(Debug, Default)]
pub struct FileContext {
    pub editable: Vec<(PathBuf, String)>,
    pub read_only: Vec<(PathBuf, String)>,
}

/// Ordered message history: sealed turns plus the in-progress turn.
#[derive(Debug, Default)]
pub struct ChatHistory {
    done_messages: Vec<Message>,
    cur_messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or extend) the current turn with a user message.
    pub fn append_user(&mut self, text: &str) {
        self.cur_messages.push(Message::user(text));
    }

    pub fn append_assistant(&mut self, text: &str) {
        self.cur_messages.push(Message::assistant(text));
    }

    pub fn has_open_turn(&self) -> bool {
        !self.cur_messages.is_empty()
    }

    /// Seal the current turn into the permanent transcript.
    pub fn seal_turn(&mut self) {
        self.done_messages.append(&mut self.cur_messages);
    }

    /// Drop the current turn without sealing it.
    pub fn abandon_turn(&mut self) {
        self.cur_messages.clear();
    }

    pub fn done_messages(&self) -> &[Message] {
        &self.done_messages
    }

    pub fn cur_messages(&self) -> &[Message] {
        &self.cur_messages
    }

    /// Render the full transcript for a model request: system prompt, edit
    /// format examples, read-only then editable file blocks, sealed turns,
    /// then the in-progress turn.
    pub fn render_for_model(
        &self,
        system_prompt: &str,
        format_examples: &[Message],
        files: &FileContext,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(
            2 + format_examples.len() + self.done_messages.len() + self.cur_messages.len(),
        );
        messages.push(Message::system(system_prompt));
        messages.extend_from_slice(format_examples);

        if !files.read_only.is_empty() {
            let mut block = String::from(
                "These files are for reference only. Do NOT propose edits to them:\n\n",
            );
            for (path, content) in &files.read_only {
                block.push_str(&format!("{} (READ ONLY)\n```\n{}\n```\n\n", path.display(), content));
            }
            messages.push(Message::user(block.trim_end()));
            messages.push(Message::assistant(
                "Understood. I will not edit those files.",
            ));
        }

        if !files.editable.is_empty() {
            let mut block = String::from("I have added these files to the chat:\n\n");
            for (path, content) in &files.editable {
                block.push_str(&format!("{}\n```\n{}\n```\n\n", path.display(), content));
            }
            messages.push(Message::user(block.trim_end()));
            messages.push(Message::assistant(
                "Thanks. I will propose edits to those files when asked.",
            ));
        }

        messages.extend_from_slice(&self.done_messages);
        messages.extend_from_slice(&self.cur_messages);
        messages
    }

    /// Enforce the overflow policy for a rendered transcript. Returns the
    /// projected token count; under `Warn` an overflow is reported as
    /// `Ok(Some(tokens))` so the caller can flag it and proceed.
    pub fn check_window(
        messages: &[Message],
        model: &dyn crate::model::ModelClient,
        policy: OverflowPolicy,
    ) -> Result<Option<usize>, CoderError> {
        let tokens = model.token_count(messages);
        let window = model.context_window();
        if tokens <= window {
            return Ok(None);
        }
        match policy {
            OverflowPolicy::Warn => Ok(Some(tokens)),
            OverflowPolicy::Strict => Err(CoderError::ContextOverflow { tokens, window }),
        }
    }
}

/// Humanize a token count: 812, 3.4k, 52k.
pub fn format_tokens(count: usize) -> String {
    if count < 1000 {
        format!("{}", count)
    } else if count < 10_000 {
        format!("{:.1}k", count as f64 / 1000.0)
    } else {
        format!("{}k", (count as f64 / 1000.0).round() as usize)
    }
}
