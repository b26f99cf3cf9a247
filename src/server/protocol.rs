use super::WebError;
use crate::classifier::Prediction;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Body of `POST /api/predict`. `image` is a data-URL or bare base 64
#[derive(Deserialize)]
pub struct PredictRequest {
    pub image: String,
}

impl Debug for PredictRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PredictRequest {{ image: <{} bytes> }}", self.image.len())
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    #[serde(flatten)]
    pub prediction: Prediction,

    /// URL of the normalized input, when it was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_image: Option<String>,
}

/// Strip an optional `data:image/...;base64,` prefix and decode the rest
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, WebError> {
    let data = strip_data_url(payload.trim())?;
    Ok(general_purpose::STANDARD.decode(data)?)
}

fn strip_data_url(payload: &str) -> Result<&str, WebError> {
    let Some(rest) = payload.strip_prefix("data:") else {
        return Ok(payload);
    };
    let (media_type, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| WebError::bad_request("data URL is not base64 encoded"))?;
    if !media_type.starts_with("image/") {
        return Err(WebError::bad_request(format!(
            "unsupported media type {media_type:?}"
        )));
    }
    Ok(data)
}
