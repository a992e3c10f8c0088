//! Prompt context assembly.

pub mod assembler;
pub mod documents;
pub mod prompt_builder;

pub use assembler::{AssembledContext, ContextHints, assemble_for_node, assemble_for_tangent};
pub use documents::{
    DocumentContextProvider, DocumentFuture, DocumentSnippet, NoDocuments, StaticDocuments,
    gather_documents,
};
pub use prompt_builder::PromptBuilder;
