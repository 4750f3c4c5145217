use super::{ApiError, AppState, PredictResponse, ResultRecord};
use crate::config::LinkMode;
use crate::detection::{output_format, DetectionError, DetectionResult};
use crate::identifier::Namespace;
use crate::storage::{object_key, ObjectStore, StorageError};
use crate::validator::{FileValidator, UploadedImage};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{header::CONTENT_LENGTH, StatusCode},
    Json,
};
use bytes::Bytes;
use image::DynamicImage;
use metrics::{counter, histogram};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Multipart field carrying images
pub const IMAGE_FIELD: &str = "image";

/// `POST <predict-route>`
#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    counter!("predict.requests.total").increment(1);

    match handle(&state, multipart).await {
        Ok(response) => {
            info!(items = response.results.len(), "Prediction complete");
            Ok(Json(response))
        }
        Err(err) => {
            counter!("predict.requests.failed", "code" => err.code()).increment(1);
            if let ApiError::Internal(ref details) = err {
                error!(error = %details, "Prediction failed");
                state
                    .alerter
                    .notify("Prediction request failed", details)
                    .await;
            } else {
                debug!(code = err.code(), "Prediction rejected");
            }
            Err(err)
        }
    }
}

async fn handle(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<PredictResponse, ApiError> {
    let multipart = multipart.map_err(|e| {
        debug!(error = %e, "Rejected multipart payload");
        ApiError::RequestMalformed
    })?;

    let uploads = collect_images(multipart, &state.settings.validator).await?;
    if uploads.is_empty() {
        return Err(ApiError::RequestMalformed);
    }

    let mut results = Vec::with_capacity(uploads.len());
    for (index, upload) in uploads.into_iter().enumerate() {
        results.push(process_item(state, index, upload).await?);
    }

    Ok(PredictResponse::new(results))
}

/// Buffer every `image` part, failing as soon as the item limit is exceeded
async fn collect_images(
    mut multipart: Multipart,
    validator: &FileValidator,
) -> Result<Vec<UploadedImage>, ApiError> {
    let mut images = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(field_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            debug!(field = ?field.name(), "Skipping unexpected field");
            continue;
        }
        if !validator.is_valid_count(images.len() + 1) {
            warn!(max_items = validator.max_items(), "Too many items in payload");
            return Err(ApiError::PayloadTooLarge);
        }

        let content_type = field.content_type().map(str::to_string);
        let filename = field.file_name().map(str::to_string);
        let declared_length = field
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let data = field.bytes().await.map_err(field_error)?;

        images.push(UploadedImage {
            data,
            content_type,
            filename,
            declared_length,
        });
    }

    Ok(images)
}

fn field_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        debug!(error = %err, "Malformed multipart field");
        ApiError::RequestMalformed
    }
}

#[instrument(skip(state, upload), fields(filename = ?upload.filename))]
async fn process_item(
    state: &AppState,
    index: usize,
    upload: UploadedImage,
) -> Result<ResultRecord, ApiError> {
    let settings = &state.settings;
    let filelength = upload.len();

    if !settings.validator.is_valid(Some(&upload), Some(filelength)) {
        counter!("predict.items.rejected").increment(1);
        debug!(
            content_type = ?upload.content_type,
            filelength,
            "Item failed validation"
        );
        return Err(ApiError::UnsupportedMedia);
    }

    let filename = sanitize_filename(upload.filename.as_deref(), index);
    let (image, result) = decode_and_detect(state, upload.data).await?;

    if result.is_empty() {
        counter!("predict.items.empty").increment(1);
        return Ok(ResultRecord::empty(index, filename, filelength));
    }

    let id = settings
        .ids
        .generate(Namespace::Cloud {
            base: &settings.result_dir,
            prefix: &settings.storage_prefix,
            store: state.storage.as_ref(),
        })
        .await
        .map_err(ApiError::internal)?;

    let dir = settings.result_dir.join(&id);
    let (format, content_type) = output_format(&filename);
    let save_name = filename.clone();
    let (saved, encoded, detections) = tokio::task::spawn_blocking(move || {
        let saved = result.save(&image, &dir, &save_name)?;
        let encoded = result.encode_annotated(format);
        Ok::<_, DetectionError>((saved, encoded, result.into_detections()))
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(ApiError::internal)?;

    let key = object_key(&settings.storage_prefix, &id, &filename);
    let public = settings.link_mode == LinkMode::Public;
    let link = upload_result(
        state.storage.as_ref(),
        &key,
        encoded,
        content_type,
        &saved,
        public,
    )
    .await
    .map_err(ApiError::internal)?;

    let link = match link {
        Some(link) => link,
        None => state
            .storage
            .signed_url(&key, settings.presigned_url_expiry)
            .await
            .map_err(ApiError::internal)?,
    };

    counter!("predict.items.processed").increment(1);
    info!(
        id = %id,
        key = %key,
        detections = detections.len(),
        "Stored prediction result"
    );

    Ok(ResultRecord::stored(
        index,
        id,
        settings.storage_prefix.clone(),
        detections,
        filename,
        link,
        filelength,
    ))
}

async fn decode_and_detect(
    state: &AppState,
    data: Bytes,
) -> Result<(DynamicImage, DetectionResult), ApiError> {
    let detector = state.detector.clone();
    let resolution = state.settings.resolution;
    let started = Instant::now();

    let outcome = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&data).map_err(|e| {
            debug!(error = %e, "Undecodable image");
            ApiError::UnsupportedMedia
        })?;
        let result = detector
            .detect(&image, resolution)
            .map_err(ApiError::internal)?;
        Ok::<_, ApiError>((image, result))
    })
    .await
    .map_err(ApiError::internal)?;

    histogram!("predict.inference.duration_seconds").record(started.elapsed().as_secs_f64());
    outcome
}

/// Upload the in-memory encoding, falling back to the saved file when the
/// encoding is missing or the stream upload fails
pub async fn upload_result(
    store: &dyn ObjectStore,
    key: &str,
    encoded: Result<Vec<u8>, DetectionError>,
    content_type: &str,
    saved: &Path,
    public: bool,
) -> Result<Option<String>, StorageError> {
    let streamed = match encoded {
        Ok(bytes) => store
            .upload_bytes(key, Bytes::from(bytes), content_type, public)
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match streamed {
        Ok(link) => {
            counter!("predict.uploads.stream").increment(1);
            Ok(link)
        }
        Err(reason) => {
            counter!("predict.uploads.fallback").increment(1);
            warn!(key = %key, reason = %reason, "Stream upload failed, uploading saved file");
            store.upload_file(key, saved, content_type, public).await
        }
    }
}

/// Reduce a client filename to a safe base name.
///
/// Parts without a usable name become `image_{index}.jpg`.
pub fn sanitize_filename(name: Option<&str>, index: usize) -> String {
    let base = name
        .and_then(|n| n.rsplit(['/', '\\']).next())
        .map(str::trim)
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        format!("image_{}.jpg", index)
    } else {
        cleaned.to_string()
    }
}
