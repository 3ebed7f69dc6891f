//! MJPEG preview endpoint
//!
//! GET /api/stream?streamId=webcam

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::{AppState, ErrorResponse};
use crate::preview::{PreviewCursor, CONTENT_TYPE};

/// Stream id served from the producer WebSocket
pub const WEBCAM_STREAM_ID: &str = "webcam";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "streamId")]
    pub stream_id: Option<String>,
}

pub async fn stream_preview(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let stream_id = match query.stream_id.as_deref() {
        None | Some("") => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "stream_id_required".to_string(),
                    message: "Stream ID is required".to_string(),
                }),
            )
                .into_response();
        }
        Some(id) => id,
    };

    if stream_id != WEBCAM_STREAM_ID {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "stream_not_found".to_string(),
                message: format!("Stream {} not found", stream_id),
            }),
        )
            .into_response();
    }

    tracing::debug!(stream_id, "Preview consumer attached");

    let cursor = PreviewCursor::new(state.pipeline.buffer().clone(), &state.config.preview);
    let body = Body::from_stream(cursor.into_stream());

    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}
