//! Response synthesis from ranked catalog records.
//!
//! Builds a context block from the records and asks the language model to
//! answer with it. Without records, a canned message is returned and the
//! model is never called. When the model fails or times out, the context
//! block itself is returned behind a short notice.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marquee_core::config::LlmConfig;
use marquee_core::types::{MediaRecord, MediaType, QueryPhase};

use crate::llm::{GenerationRequest, LanguageModel};

/// How a [`Synthesis`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    /// The language model answered.
    Generated,
    /// No records; canned message, no model call.
    NoContext,
    /// The model failed; the context block was returned instead.
    Fallback,
}

impl SynthesisStatus {
    /// Terminal query phase for this outcome.
    pub fn phase(&self) -> QueryPhase {
        match self {
            SynthesisStatus::Fallback => QueryPhase::Degraded,
            SynthesisStatus::Generated | SynthesisStatus::NoContext => QueryPhase::Done,
        }
    }
}

/// Text returned to the user plus how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub text: String,
    pub status: SynthesisStatus,
}

/// Turns ranked records into a user-facing answer.
pub struct ResponseSynthesizer {
    llm: Arc<dyn LanguageModel>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl ResponseSynthesizer {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            temperature,
            max_tokens,
            timeout,
        }
    }

    pub fn from_config(llm: Arc<dyn LanguageModel>, config: &LlmConfig) -> Self {
        Self::new(
            llm,
            config.temperature,
            config.max_tokens,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn model_id(&self) -> &str {
        self.llm.model_id()
    }

    /// Answer `query` from `items`, in rank order.
    pub async fn synthesize(
        &self,
        query: &str,
        items: &[MediaRecord],
        media_type: Option<MediaType>,
    ) -> Synthesis {
        if items.is_empty() {
            return Synthesis {
                text: no_content_message(media_type),
                status: SynthesisStatus::NoContext,
            };
        }

        let context = build_context(items);
        let request = GenerationRequest {
            system: format!(
                "You are an expert assistant for {}.\n\n\
                 Guidelines:\n\
                 - Be conversational and engaging\n\
                 - Reference specific titles from the context\n\
                 - Explain your recommendations clearly\n\
                 - Connect information across several items when relevant\n\
                 - Offer insight into themes, genres or trends\n\n\
                 Context:\n{}",
                content_label(media_type),
                context
            ),
            message: format!(
                "User question: '{}'\n\nGive a helpful, engaging answer using the provided context.",
                query
            ),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        match self.generate(&request).await {
            Some(text) => Synthesis {
                text,
                status: SynthesisStatus::Generated,
            },
            None => Synthesis {
                text: format!(
                    "The text generation service is unavailable right now. \
                     Here are the relevant items I found:\n\n{}",
                    context
                ),
                status: SynthesisStatus::Fallback,
            },
        }
    }

    /// Describe visual matches. `method` names the embedding path used.
    pub async fn synthesize_visual(
        &self,
        items: &[MediaRecord],
        media_type: Option<MediaType>,
        method: &str,
    ) -> Synthesis {
        if items.is_empty() {
            return Synthesis {
                text: no_visual_match_message(media_type),
                status: SynthesisStatus::NoContext,
            };
        }

        let context = build_context(items);
        let label = match media_type {
            Some(media_type) => media_type.plural(),
            None => "entertainment content",
        };
        let request = GenerationRequest {
            system: format!(
                "You are a visual analysis expert for {}.\n\n\
                 Analyse the visual connections, focusing on:\n\
                 - Colour palettes and lighting\n\
                 - Composition and style\n\
                 - Character design or poster aesthetics\n\
                 - Visual genre cues\n\
                 - Mood and atmosphere\n\n\
                 Analysis method: {}\n\
                 Most similar items found:\n{}",
                label, method, context
            ),
            message: format!(
                "Analyse the visual similarities between the uploaded image and these matches \
                 using {}. Focus on visual elements, styles and aesthetic connections.",
                method
            ),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        match self.generate(&request).await {
            Some(text) => Synthesis {
                text,
                status: SynthesisStatus::Generated,
            },
            None => Synthesis {
                text: format!(
                    "The text generation service is unavailable right now. \
                     Visual analysis with {} found these similar items:\n\n{}",
                    method, context
                ),
                status: SynthesisStatus::Fallback,
            },
        }
    }

    /// Call the model under the timeout. `None` on any failure.
    async fn generate(&self, request: &GenerationRequest) -> Option<String> {
        debug!(phase = ?QueryPhase::Synthesizing, model = %self.llm.model_id(), "Query phase");
        match tokio::time::timeout(self.timeout, self.llm.generate(request)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => {
                warn!("Language model returned an empty answer, using context fallback");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Language model call failed, using context fallback");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Language model call timed out, using context fallback");
                None
            }
        }
    }
}

/// Format one record for the context block.
///
/// Movies include their vote count; games do not.
pub fn format_item(record: &MediaRecord) -> String {
    let release = record.metadata.release_date.as_deref().unwrap_or("unknown");
    let rating = match record.media_type {
        MediaType::Movie => format!(
            "{}/10 ({} votes)",
            record.metadata.vote_average, record.metadata.vote_count
        ),
        MediaType::Game => format!("{}/10", record.metadata.vote_average),
    };
    format!(
        "Title: {} ({})\nReleased: {}\nRating: {}\nGenres: {}\nSummary: {}",
        record.title,
        record.media_type.label(),
        release,
        rating,
        record.metadata.genres.join(", "),
        record.description
    )
}

/// Context block for a ranked list of records.
pub fn build_context(items: &[MediaRecord]) -> String {
    items
        .iter()
        .map(format_item)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Canned answer when no record matched a text query.
pub fn no_content_message(media_type: Option<MediaType>) -> String {
    format!(
        "I couldn't find any relevant {} for your search. Try different terms.",
        content_label(media_type)
    )
}

/// Canned answer when no record matched a query image.
pub fn no_visual_match_message(media_type: Option<MediaType>) -> String {
    format!(
        "I couldn't find any {} visually similar to your image.",
        content_label(media_type)
    )
}

fn content_label(media_type: Option<MediaType>) -> &'static str {
    match media_type {
        Some(media_type) => media_type.plural(),
        None => "movies or games",
    }
}
