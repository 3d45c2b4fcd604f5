use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String>;

    /// `image_base64` is a PNG. Text-only providers keep the default.
    async fn generate_with_image(
        &self,
        model: &str,
        prompt: String,
        system: Option<String>,
        image_base64: &str,
    ) -> Result<String> {
        let _ = (model, prompt, system, image_base64);
        anyhow::bail!("provider does not accept images")
    }
}

/// Any `/chat/completions` endpoint: OpenAI, vLLM, llama.cpp server, LM Studio.
pub struct OpenAICompatibleProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl OpenAICompatibleProvider {
    async fn chat(&self, model: &str, system: Option<String>, user: serde_json::Value) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        messages.push(json!({ "role": "user", "content": user }));

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?.error_for_status()?;
        let json: serde_json::Value = res.json().await?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .context("Failed to parse content from chat completion response")?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        self.chat(model, system, json!(prompt)).await
    }

    async fn generate_with_image(
        &self,
        model: &str,
        prompt: String,
        system: Option<String>,
        image_base64: &str,
    ) -> Result<String> {
        let content = json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{}", image_base64) } }
        ]);
        self.chat(model, system, content).await
    }
}
