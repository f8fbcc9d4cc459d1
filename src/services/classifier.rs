use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Structured identification produced by the classification capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub scientific_label: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rejected the request with status {0}")]
    Rejected(u16),

    #[error("Failed to parse model response as an identification: {0}")]
    Parse(#[from] serde_json::Error),
}

/// External species classification capability.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<Classification, ClassifyError>;
}

/// Client for the Cloudflare Workers AI LLaVA model.
pub struct WorkersAiClassifier {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClassifier {
    pub fn new(
        account_id: &str,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, ClassifyError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Classifier for WorkersAiClassifier {
    /// Send an image to Workers AI LLaVA and extract a structured
    /// identification.
    async fn classify(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<Classification, ClassifyError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/@cf/llava-hf/llava-1.5-7b-hf",
            self.account_id
        );

        let prompt = concat!(
            "Identify the plant or animal in this image and return the ",
            "following fields as JSON: label (common name), scientific_label ",
            "(Latin binomial name), description (two sentences about the ",
            "species), confidence (0 to 1). ",
            "Return ONLY valid JSON with these exact field names."
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "prompt": prompt,
            "mime_type": mime_type,
            "max_tokens": 512
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(ClassifyError::Http)?;

        if !response.status().is_success() {
            return Err(ClassifyError::Rejected(response.status().as_u16()));
        }

        let llava_resp: LlavaResponse = response.json().await.map_err(ClassifyError::Http)?;

        serde_json::from_str(&llava_resp.result.description).map_err(ClassifyError::Parse)
    }
}
