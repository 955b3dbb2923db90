//! Conversational layer for Marquee.
//!
//! Wires the query engine to a language model: response synthesis with a
//! context-only fallback, and the `MediaRag` facade consumed by the
//! application layer.

pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod response;

pub use error::ChatError;
pub use llm::{CohereClient, GenerationRequest, LanguageModel, OfflineModel};
pub use orchestrator::{MediaRag, RagAnswer};
pub use response::{ResponseSynthesizer, Synthesis, SynthesisStatus};
