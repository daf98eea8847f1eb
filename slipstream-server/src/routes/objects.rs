//! Upload and download target for presigned URLs issued by the in-process
//! attachment store.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::put,
};
use tracing::{debug, warn};

use crate::{app_state::AppState, services::storage::StorageError};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Rejected(_) => StatusCode::BAD_REQUEST,
        StorageError::Http(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    match state.storage.put_object(&key, body, mime).await {
        Ok(head) => {
            debug!(key = %key, size = head.size, "object uploaded");
            let mut response = StatusCode::OK.into_response();
            if let Some(etag) = head.etag.and_then(|etag| HeaderValue::from_str(&etag).ok()) {
                response.headers_mut().insert(header::ETAG, etag);
            }
            response
        }
        Err(err) => {
            warn!(key = %key, error = %err, "object upload rejected");
            (storage_status(&err), err.to_string()).into_response()
        }
    }
}

async fn get_object(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.storage.get_object(&key).await {
        Ok((body, mime)) => {
            let content_type = HeaderValue::from_str(&mime)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(err) => (storage_status(&err), err.to_string()).into_response(),
    }
}

pub fn create_objects_router() -> Router<Arc<AppState>> {
    Router::new().route("/objects/{*key}", put(put_object).get(get_object))
}
