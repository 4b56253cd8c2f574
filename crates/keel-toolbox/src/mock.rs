//! Scripted provider for tests and local development.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use keel_protocols::ProviderError;

use crate::provider::{GenerateRequest, GenerateResponse, LlmProvider};

/// Provider that replays scripted responses in order.
///
/// Ships as a normal module so downstream crates can use it in their own
/// tests without a features dance.
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response body.
    pub fn enqueue(&self, content: impl Into<String>) {
        self.responses.lock().push_back(Ok(content.into()));
    }

    /// Queue a well-formed selection response.
    pub fn enqueue_selections(&self, selections: serde_json::Value) {
        let body = serde_json::json!({ "selections": selections });
        self.enqueue(body.to_string());
    }

    /// Queue a provider-level failure.
    pub fn enqueue_error(&self, error: ProviderError) {
        self.responses.lock().push_back(Err(error));
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, _request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        match self.responses.lock().pop_front() {
            Some(Ok(content)) => Ok(GenerateResponse { content }),
            Some(Err(e)) => Err(e),
            None => Err(ProviderError::RequestFailed(
                "mock provider has no scripted responses left".to_string(),
            )),
        }
    }
}
