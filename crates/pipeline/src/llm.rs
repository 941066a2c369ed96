use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::LlmConfig,
    error::{PipelineError, PipelineResult},
};

/// System prompt for turning a free-form situation into a single video prompt.
pub const VIDEO_PROMPT_SYSTEM: &str = "You write prompts for a text-to-video model that produces \
15-second vertical video ads filmed like authentic, handheld user-generated content.

Given a situation, write ONE prompt that covers:
- the person on camera (age, look, wardrobe, energy) and where they are
- camera framing and movement, lighting, time of day
- the exact words they say, written as natural speech with pauses and fillers
- a beat-by-beat timeline from 0s to 15s ending on a clear call to action

Return only the prompt text, with no preamble or commentary.";

#[async_trait]
pub trait PromptGenerator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> PipelineResult<String>;
}

/// Builds the continuation request for the next clip featuring a saved character.
pub fn continuation_request(base_prompt: &str, character: &str, situation: &str) -> (String, String) {
    let system = format!(
        "{VIDEO_PROMPT_SYSTEM}

CHARACTER CONTINUATION

The first 15-second clip of this ad already exists. Its on-camera person is saved as the \
character `{character}`.

Write the prompt for the NEXT 15 seconds:
- the same person appears; reference them as character_user_name: {character}
- continue naturally from where the first clip ended, mid-conversation or mid-thought
- keep the same environment, lighting, camera style, archetype and delivery
- do NOT repeat anything said or shown in the first clip"
    );

    let user = format!(
        "Original situation: {situation}

First 15s prompt that was generated:
{base_prompt}

Now write the NEXT 15-second continuation prompt using the same character ({character})."
    );

    (system, user)
}

#[derive(Clone)]
pub struct AnthropicClient {
    config: LlmConfig,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PromptGenerator for AnthropicClient {
    async fn generate(&self, system: &str, user: &str) -> PipelineResult<String> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&MessagesRequest {
                model: &self.config.model,
                max_tokens: 4096,
                system,
                messages: [Message {
                    role: "user",
                    content: user,
                }],
            })
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Provider(format!(
                "LLM API error ({status}): {error_text}"
            )));
        }

        let body: MessagesResponse = response.json().await?;
        first_text(body)
    }
}

fn first_text(body: MessagesResponse) -> PipelineResult<String> {
    body.content
        .into_iter()
        .find_map(|block| block.text)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| PipelineError::Provider("LLM returned no text".to_string()))
}
