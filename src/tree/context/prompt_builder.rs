//! Final prompt construction.

use crate::llm::{ChatMessage, ChatRole};
use crate::tree::core::config::PromptConfig;

use super::assembler::{AssembledContext, ContextHints};
use super::documents::DocumentSnippet;

/// Builds the message list sent to the provider.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    config: PromptConfig,
}

impl PromptBuilder {
    /// Create a builder from prompt configuration.
    #[must_use]
    pub const fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    /// Prompt configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PromptConfig {
        &self.config
    }

    /// Prepend the system block to the assembled messages.
    ///
    /// The system block is only added when the context does not already open with a
    /// system message.
    #[must_use]
    pub fn build(&self, context: AssembledContext, documents: &[DocumentSnippet]) -> Vec<ChatMessage> {
        let starts_with_system = context
            .messages
            .first()
            .is_some_and(|message| message.role == ChatRole::System);
        if starts_with_system {
            return context.messages;
        }

        let mut out = Vec::with_capacity(context.messages.len() + 1);
        out.push(ChatMessage::system(self.system_block(&context.hints, documents)));
        out.extend(context.messages);
        out
    }

    fn system_block(&self, hints: &ContextHints, documents: &[DocumentSnippet]) -> String {
        let mut out = String::with_capacity(self.config.system_prompt.len() + 256);
        out.push_str(&self.config.system_prompt);

        if self.config.include_branch_hints {
            out.push_str("\n\n[CONTEXT]\n");
            render_hints(&mut out, hints);
        }

        if !documents.is_empty() {
            out.push_str("\n\n[DOCUMENTS]\n");
            for doc in documents {
                render_document(&mut out, doc);
            }
        }

        out
    }
}

fn render_hints(out: &mut String, hints: &ContextHints) {
    match hints {
        ContextHints::Branch(path) => {
            out.push_str("You are ");
            out.push_str(&path.turns.to_string());
            out.push_str(if path.turns == 1 { " turn" } else { " turns" });
            out.push_str(" deep in ");
            match &path.branch_name {
                Some(name) => {
                    out.push_str("branch \"");
                    out.push_str(name);
                    out.push('"');
                }
                None => out.push_str("the main thread"),
            }
            out.push_str(".\n");
        }
        ContextHints::Tangent {
            nesting,
            highlighted_text,
        } => {
            out.push_str("This is a side discussion ");
            out.push_str(&nesting.to_string());
            out.push_str(if *nesting == 1 { " level" } else { " levels" });
            out.push_str(" deep about the highlighted text \"");
            out.push_str(highlighted_text);
            out.push_str("\". Stay focused on it.\n");
        }
    }
}

fn render_document(out: &mut String, doc: &DocumentSnippet) {
    out.push_str("* (");
    out.push_str(&doc.source_name);
    out.push_str(") ");
    out.push_str(&doc.content);
    out.push('\n');
}
