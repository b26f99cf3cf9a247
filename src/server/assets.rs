//! Serves the client bundle. Unknown paths get the index document so the
//! client can do its own routing.

use super::{AppState, WebError};
use actix_web::{get, web, HttpResponse};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const INDEX: &str = "index.html";

#[get("/{path:.*}")]
pub async fn serve(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, WebError> {
    if let Some(file) = resolve(&state.static_dir, &path) {
        match tokio::fs::read(&file).await {
            Ok(bytes) => return Ok(file_response(&file, bytes)),
            Err(e) => debug!("could not read {}: {e}", file.display()),
        }
    }

    let index = state.static_dir.join(INDEX);
    match tokio::fs::read(&index).await {
        Ok(bytes) => Ok(file_response(&index, bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(WebError::not_found("client bundle is not built"))
        }
        Err(e) => Err(WebError::internal(
            "failed to read client bundle",
            e.into(),
        )),
    }
}

/// Map a request path to a file under `root`. Only plain relative paths to
/// existing files resolve.
fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    let relative = Path::new(path);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let full = root.join(relative);
    full.is_file().then_some(full)
}

fn file_response(path: &Path, bytes: Vec<u8>) -> HttpResponse {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    HttpResponse::Ok()
        .content_type(mime.to_string())
        .body(bytes)
}
