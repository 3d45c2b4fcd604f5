//! Agent Module
//!
//! LLM provider abstraction and the reasoner that turns chat completions into
//! typed reasoning-service results.

mod provider;
mod reasoner;

pub use provider::{LLMProvider, OpenAICompatibleProvider};
pub use reasoner::{extract_json, LlmReasoner};
