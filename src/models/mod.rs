pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod registry;

#[cfg(test)]
pub mod testing;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAICompatibleProvider;
pub use provider::{Message, MessageRole, Provider, ProviderAdapter, ProviderError, ProviderReply};
pub use registry::ProviderRegistry;
