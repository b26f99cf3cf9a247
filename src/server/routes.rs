//! The prediction route

use super::protocol::{self, PredictRequest, PredictResponse};
use super::{AppState, WebError};
use crate::config::DEBUG_IMAGE_NAME;
use crate::normalize::{self, MnistImage};
use actix_web::{post, web, Responder};
use anyhow::anyhow;
use image::ImageOutputFormat;
use std::fs;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, WebError>;

/// Classify one drawn digit
#[post("/api/predict")]
pub async fn predict(
    req: web::Json<PredictRequest>,
    state: web::Data<AppState>,
) -> Result<impl Responder> {
    let req = req.into_inner();
    debug!("got request {req:?}");
    if req.image.is_empty() {
        return Err(WebError::bad_request("Invalid image data"));
    }

    // Decode and normalize; failures here are the client's
    let bytes = protocol::decode_image_payload(&req.image)?;
    let image = normalize::normalize_bytes(&bytes)?;

    // File I/O and the model both run off the async workers
    let classifier = state.classifier.clone();
    let debug_path = state.debug_image.clone();
    let (predictions, debug_image) = web::block(move || {
        let debug_image = debug_path.and_then(|path| write_debug_image(&path, &image));
        (classifier.classify(std::slice::from_ref(&image)), debug_image)
    })
    .await
    .map_err(|e| WebError::internal("inference failed", anyhow!("{e}")))?;

    let prediction = predictions
        .map_err(|e| WebError::internal("inference failed", e))?
        .pop()
        .ok_or_else(|| {
            WebError::internal("inference failed", anyhow!("classifier returned nothing"))
        })?;

    info!(
        "predicted {} with confidence {:.3}",
        prediction.digit, prediction.confidence
    );

    Ok(web::Json(PredictResponse {
        prediction,
        debug_image,
    }))
}

/// Save what the network sees so the client can show it. Returns its URL
fn write_debug_image(path: &Path, image: &MnistImage) -> Option<String> {
    match replace_png(path, image) {
        Ok(()) => Some(format!("/{DEBUG_IMAGE_NAME}")),
        Err(e) => {
            warn!("failed to write debug image {}: {e:#}", path.display());
            None
        }
    }
}

/// Encode into a temp file next to `path`, then rename it over `path`, so a
/// reader never sees a half-written file
fn replace_png(path: &Path, image: &MnistImage) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    image
        .to_gray_image()
        .write_to(file.as_file_mut(), ImageOutputFormat::Png)?;
    file.persist(path)?;
    Ok(())
}
