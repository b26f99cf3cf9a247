//! The JSON web server: the prediction route and the client bundle

use crate::classifier::Classifier;
use crate::config::Settings;
use actix_cors::Cors;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{middleware, web, App, HttpResponse};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

pub mod assets;
pub mod protocol;
pub mod routes;

/// Shared, read-only state of every worker
pub struct AppState {
    pub classifier: Arc<dyn Classifier>,
    pub static_dir: PathBuf,

    /// Where to write the normalized input, if enabled
    pub debug_image: Option<PathBuf>,
}

impl AppState {
    pub fn new(classifier: Arc<dyn Classifier>, settings: &Settings) -> Self {
        AppState {
            classifier,
            static_dir: settings.static_dir.clone(),
            debug_image: settings.debug_image.then(|| settings.debug_image_path()),
        }
    }
}

/// The full application: routes, access log and permissive CORS, which also
/// answers preflight requests
pub fn app(
    state: web::Data<AppState>,
    max_payload_bytes: usize,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(state)
        .wrap(Cors::permissive())
        .wrap(middleware::Logger::default())
        .configure(|cfg| configure(cfg, max_payload_bytes))
}

/// Register all routes. The catch-all asset route goes last.
pub fn configure(cfg: &mut web::ServiceConfig, max_payload_bytes: usize) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(max_payload_bytes)
            .error_handler(|err, _req| WebError::bad_request(err.to_string()).into()),
    )
    .service(routes::predict)
    .service(assets::serve);
}

/// An error returned to the HTTP client as `{"error": message}`
#[derive(Debug)]
pub struct WebError {
    status: StatusCode,

    /// What the client gets to see
    message: String,

    /// Detail that is logged but never sent
    source: Option<anyhow::Error>,
}

impl WebError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        WebError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        WebError {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            source: None,
        }
    }

    /// A server-side failure. `message` is generic, `err` is only logged
    pub fn internal(message: impl Into<String>, err: anyhow::Error) -> Self {
        WebError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            source: Some(err),
        }
    }
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        if let Some(err) = &self.source {
            error!("{}: {err:#}", self.message);
        }
        let err = HashMap::from([("error", self.message.clone())]);

        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(err)
    }

    fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for WebError {
    fn from(err: anyhow::Error) -> WebError {
        WebError::internal("internal server error", err)
    }
}

impl From<base64::DecodeError> for WebError {
    fn from(err: base64::DecodeError) -> Self {
        WebError::bad_request(format!("invalid base64 image data: {err}"))
    }
}

impl From<image::ImageError> for WebError {
    fn from(err: image::ImageError) -> Self {
        WebError::bad_request(format!("could not decode image: {err}"))
    }
}
