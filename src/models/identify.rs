use garde::Validate;
use serde::Serialize;

/// Metadata portion of an identification submission (multipart text fields).
#[derive(Debug, Default, Validate)]
pub struct IdentifyRequest {
    #[garde(length(min = 1, max = 64))]
    pub user_id: Option<String>,
}

/// Response after submitting an image for identification.
#[derive(Debug, Serialize)]
pub struct IdentifyResponse {
    pub job_id: String,
    pub state: String,
    pub message: String,
}
