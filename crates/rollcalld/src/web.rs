//! HTTP façade: status polling, the video feed, student queries, and
//! registration uploads.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use rollcall_attendance::format::capitalize;
use rollcall_attendance::{AttendanceEngine, Registry, StatusSnapshot, StudentInfo, StudentSummary};
use serde::Serialize;
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use crate::stream::{self, VideoFeed};

/// Upload extensions accepted by `/register`.
const UPLOAD_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Staging directory for uploads, inside the image archive.
const INCOMING_DIR: &str = ".incoming";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Student {0} not found")]
    NotFound(String),

    #[error("Registration failed. Please check the details.")]
    RegistrationFailed,

    #[error("Camera unavailable")]
    CameraUnavailable,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MalformedPayload(_) | AppError::RegistrationFailed => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CameraUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::MalformedPayload(err.body_text())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AttendanceEngine>,
    pub registry: Arc<Registry>,
    /// Absent when no camera could be opened.
    pub video: Option<Arc<VideoFeed>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/video_feed", get(video_feed))
        .route("/students", get(list_students))
        .route("/students/:reg_number", get(student_info))
        .route("/register", post(register))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, AppError> {
    let engine = state.engine.clone();
    let snapshot = tokio::task::spawn_blocking(move || engine.status()).await?;
    Ok(Json(snapshot))
}

pub async fn video_feed(State(state): State<AppState>) -> Result<Response, AppError> {
    let rx = state
        .video
        .as_ref()
        .and_then(|video| video.subscribe())
        .ok_or(AppError::CameraUnavailable)?;

    // A lagging client skips frames instead of stalling the camera.
    let parts = BroadcastStream::new(rx)
        .filter_map(|part| futures::future::ready(part.ok().map(Ok::<Bytes, Infallible>)));

    Response::builder()
        .header(header::CONTENT_TYPE, stream::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(parts))
        .map_err(|e| AppError::InternalError(e.to_string()))
}

pub async fn list_students(State(state): State<AppState>) -> Result<Json<Vec<StudentSummary>>, AppError> {
    let registry = state.registry.clone();
    let students = tokio::task::spawn_blocking(move || registry.list_all()).await?;
    Ok(Json(students))
}

pub async fn student_info(
    State(state): State<AppState>,
    Path(reg_number): Path<String>,
) -> Result<Json<StudentInfo>, AppError> {
    let reg_number = reg_number.trim().to_string();
    if reg_number.is_empty() {
        return Err(AppError::MalformedPayload("empty registration number".into()));
    }
    let registry = state.registry.clone();
    let lookup = reg_number.clone();
    tokio::task::spawn_blocking(move || registry.info(&lookup))
        .await?
        .map(Json)
        .ok_or(AppError::NotFound(reg_number))
}

#[derive(Debug, Serialize)]
pub struct Registered {
    pub reg_number: String,
    pub name: String,
    pub known_faces: usize,
}

/// Fields of a `/register` upload.
#[derive(Debug, Default)]
pub struct RegistrationForm {
    pub name: Option<String>,
    pub reg_number: Option<String>,
    pub major: Option<String>,
    pub file_name: Option<String>,
    pub image: Option<Bytes>,
}

impl RegistrationForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let field_name = field.name().map(str::to_string);
            match field_name.as_deref() {
                Some("name") => form.name = Some(field.text().await?),
                Some("reg_number") => form.reg_number = Some(field.text().await?),
                Some("major") => form.major = Some(field.text().await?),
                Some("image") => {
                    form.file_name = field.file_name().map(str::to_string);
                    form.image = Some(field.bytes().await?);
                }
                _ => {}
            }
        }
        Ok(form)
    }
}

pub async fn register(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Registered>), AppError> {
    let form = RegistrationForm::read(&mut multipart).await?;
    let registered = register_upload(&state, form).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// Stage the upload, register it, and teach the engine the new face.
pub async fn register_upload(state: &AppState, form: RegistrationForm) -> Result<Registered, AppError> {
    let required = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let (Some(name), Some(reg_number), Some(major)) =
        (required(form.name), required(form.reg_number), required(form.major))
    else {
        return Err(AppError::MalformedPayload("Missing required fields".into()));
    };
    let image = form
        .image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| AppError::MalformedPayload("No file uploaded".into()))?;
    let extension = form
        .file_name
        .as_deref()
        .and_then(upload_extension)
        .ok_or_else(|| AppError::MalformedPayload("Unsupported file type".into()))?;

    let name = capitalize(&name);
    let reg_number = reg_number.to_uppercase();

    let incoming = state.registry.images_dir().join(INCOMING_DIR);
    tokio::fs::create_dir_all(&incoming).await?;
    let staged: PathBuf = incoming.join(format!("{reg_number}.{extension}"));
    tokio::fs::write(&staged, &image).await?;

    let registry = state.registry.clone();
    let engine = state.engine.clone();
    let (n, r, m, path) = (name.clone(), reg_number.clone(), major, staged.clone());
    let known_faces = tokio::task::spawn_blocking(move || {
        if !registry.register(&n, &r, &m, &path) {
            return None;
        }
        if !engine.learn_student(&r) {
            tracing::warn!(reg_number = %r, "cannot add new student directly, rescanning archive");
            engine.reload_known_faces();
        }
        Some(engine.known_face_count())
    })
    .await?;

    match known_faces {
        Some(known_faces) => Ok(Registered {
            reg_number,
            name,
            known_faces,
        }),
        None => {
            if let Err(err) = tokio::fs::remove_file(&staged).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %staged.display(), error = %err, "failed to remove rejected upload");
                }
            }
            Err(AppError::RegistrationFailed)
        }
    }
}

/// Lower-cased extension of an accepted upload file name.
fn upload_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    UPLOAD_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}
