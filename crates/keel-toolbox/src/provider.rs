//! Language-model provider contract.

use async_trait::async_trait;

use keel_protocols::ProviderError;

/// One structured-generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Full prompt, including the tool catalog and the task.
    pub prompt: String,
    /// JSON Schema the response content is expected to satisfy.
    pub schema: serde_json::Value,
}

/// Raw provider response.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Response content; expected to be a JSON document.
    pub content: String,
}

/// A language model that proposes tool selections.
///
/// Treated as an unreliable external dependency: calls fail, and responses
/// are validated and re-prompted like any other untrusted input.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a response for the request.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}
