//! # Transcription Endpoint
//!
//! `POST /v1/audio/transcriptions`, compatible with OpenAI's audio API.
//!
//! ## Request:
//! Multipart form data:
//! - `file` (required): the audio file, with a filename
//! - `model` (optional): model name; also accepted as `?model=` query parameter
//!
//! ## Response:
//! ```json
//! {
//!   "id": "transcription-6f1c0d8e9a2b4c3d8e7f6a5b4c3d2e1f",
//!   "object": "transcription",
//!   "created": 1735732800,
//!   "model": "base",
//!   "text": "Hello there.",
//!   "segments": [{"id": 0, "seek": 0, "start": 0.0, "end": 1.5, "text": " Hello there.", ...}]
//! }
//! ```

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{Segment, WhisperError};
use crate::upload::TempUpload;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Characters of the transcript included in the completion log.
const LOG_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct TranscriptionQuery {
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub text: String,
    pub segments: Vec<Segment>,
}

/// The parts of the form this endpoint reads.
struct TranscriptionForm {
    filename: Option<String>,
    file: Option<Vec<u8>>,
    model: Option<String>,
}

async fn read_form(mut payload: Multipart, max_bytes: usize) -> AppResult<TranscriptionForm> {
    let mut form = TranscriptionForm {
        filename: None,
        file: None,
        model: None,
    };

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::BadRequest("Missing content disposition".to_string())
        })?;
        let field_name = content_disposition.get_name().unwrap_or_default().to_string();

        match field_name.as_str() {
            "file" => {
                form.filename = content_disposition.get_filename().map(|s| s.to_string());

                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk.map_err(|e| {
                        error!(error = %e, "Failed to read upload");
                        AppError::BadRequest("Unable to read uploaded file.".to_string())
                    })?;
                    if bytes.len() + chunk.len() > max_bytes {
                        return Err(AppError::PayloadTooLarge(format!(
                            "Uploaded file exceeds the {} MB limit.",
                            max_bytes / (1024 * 1024)
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                form.file = Some(bytes);
            }
            "model" => {
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| AppError::BadRequest(format!("Invalid model field: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                }
                form.model = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            _ => {
                // response_format, language, prompt...: accepted and ignored
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| {
                        AppError::BadRequest(format!("Invalid multipart body: {}", e))
                    })?;
                }
            }
        }
    }

    Ok(form)
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /v1/audio/transcriptions`
///
/// ## Status Codes:
/// - **200**: Transcription succeeded
/// - **400**: No file, no filename, unreadable or empty upload
/// - **413**: Upload larger than `upload.max_size_mb`
/// - **503**: Model files are not available locally
/// - **500**: Any other transcription failure
pub async fn create_transcription(
    state: web::Data<AppState>,
    query: web::Query<TranscriptionQuery>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let form = read_form(payload, state.config.upload.max_size_bytes()).await?;

    let file_bytes = form
        .file
        .ok_or_else(|| AppError::BadRequest("A file upload is required.".to_string()))?;
    let filename = form
        .filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::BadRequest("Uploaded file must include a filename.".to_string()))?;
    if file_bytes.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty.".to_string()));
    }

    let upload = TempUpload::create(&filename, &file_bytes)
        .map_err(|e| AppError::Internal(format!("failed to buffer upload: {}", e)))?;

    let requested = form
        .model
        .filter(|model| !model.is_empty())
        .or_else(|| query.into_inner().model);
    let selected_model = state.normalizer.normalize(requested.as_deref());

    info!(
        file = %filename,
        size_mb = %format!("{:.2}", file_bytes.len() as f64 / (1024.0 * 1024.0)),
        model = %selected_model,
        "Received transcription request"
    );
    drop(file_bytes);

    let start_time = Instant::now();
    let transcriber = Arc::clone(&state.transcriber);
    let model = selected_model.clone();
    let outcome = web::block(move || {
        let upload = upload;
        transcriber.transcribe(upload.path(), &model)
    })
    .await;

    let transcript = match outcome {
        Ok(Ok(transcript)) => transcript,
        Ok(Err(e @ WhisperError::ModelUnavailable(_))) => {
            error!(model = %selected_model, error = %e, "Whisper model not available locally");
            return Err(AppError::from_whisper(&e, &selected_model));
        }
        Ok(Err(e)) => {
            error!(model = %selected_model, error = ?e, "Whisper transcription failed");
            return Err(AppError::from_whisper(&e, &selected_model));
        }
        Err(e) => {
            error!(model = %selected_model, error = %e, "Whisper transcription task failed");
            return Err(AppError::TranscriptionFailed);
        }
    };

    let preview: String = transcript.text.chars().take(LOG_PREVIEW_CHARS).collect();
    info!(
        file = %filename,
        model = %selected_model,
        duration_secs = %format!("{:.2}", start_time.elapsed().as_secs_f64()),
        text_preview = ?preview,
        "Completed transcription"
    );

    Ok(HttpResponse::Ok().json(TranscriptionResponse {
        id: format!("transcription-{}", uuid::Uuid::new_v4().simple()),
        object: "transcription".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: selected_model,
        text: transcript.text,
        segments: transcript.segments,
    }))
}
