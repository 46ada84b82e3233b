//! HTTP control surface: POST /start, POST /stop, GET /status, GET /health.
//!
//! A thin shell over the session coordinator. Setup failures come back on
//! the start request itself; runtime failures only ever surface through the
//! status projection.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::errors::StreamError;
use crate::session::{SessionHandle, SourceRef, StreamStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Direct-URL mode: hand this media URL straight to the encoder.
    pub source_url: Option<String>,
    /// Rendered-page mode: capture this page's screencast.
    pub page_url: Option<String>,
    /// Comma/semicolon-delimited playback selectors (rendered mode only).
    pub selector_list: Option<String>,
}

#[derive(Debug, Serialize)]
struct OkReply {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

fn stream_error_status(e: &StreamError) -> StatusCode {
    match e {
        StreamError::AlreadyStreaming
        | StreamError::NotStreaming
        | StreamError::StartCancelled => StatusCode::CONFLICT,
        StreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn source_from(req: StartRequest) -> Result<SourceRef, &'static str> {
    match (req.source_url, req.page_url) {
        (Some(_), Some(_)) => Err("provide either sourceUrl or pageUrl, not both"),
        (Some(url), None) => Ok(SourceRef::DirectUrl(url)),
        (None, Some(url)) => Ok(SourceRef::RenderedPage {
            url,
            selectors: req.selector_list.unwrap_or_default(),
        }),
        (None, None) => Err("provide sourceUrl or pageUrl"),
    }
}

pub fn router(handle: SessionHandle) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(handle)
}

async fn start(
    State(handle): State<SessionHandle>,
    Json(req): Json<StartRequest>,
) -> ApiResult<OkReply> {
    let source =
        source_from(req).map_err(|msg| api_error(StatusCode::BAD_REQUEST, msg))?;
    match handle.start(source).await {
        Ok(()) => Ok(Json(OkReply { ok: true })),
        Err(e) => Err(api_error(stream_error_status(&e), e.to_string())),
    }
}

async fn stop(State(handle): State<SessionHandle>) -> ApiResult<OkReply> {
    match handle.stop().await {
        Ok(()) => Ok(Json(OkReply { ok: true })),
        Err(e) => Err(api_error(stream_error_status(&e), e.to_string())),
    }
}

async fn status(State(handle): State<SessionHandle>) -> Json<StreamStatus> {
    Json(handle.status().await)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_maps_to_one_source_mode() {
        let direct = source_from(StartRequest {
            source_url: Some("https://cdn/x.mp4".into()),
            page_url: None,
            selector_list: None,
        })
        .unwrap();
        assert!(matches!(direct, SourceRef::DirectUrl(url) if url == "https://cdn/x.mp4"));

        let page = source_from(StartRequest {
            source_url: None,
            page_url: Some("https://x/page".into()),
            selector_list: Some("button.play".into()),
        })
        .unwrap();
        match page {
            SourceRef::RenderedPage { url, selectors } => {
                assert_eq!(url, "https://x/page");
                assert_eq!(selectors, "button.play");
            }
            other => panic!("expected RenderedPage, got {other:?}"),
        }

        assert!(source_from(StartRequest {
            source_url: Some("a".into()),
            page_url: Some("b".into()),
            selector_list: None,
        })
        .is_err());
        assert!(source_from(StartRequest {
            source_url: None,
            page_url: None,
            selector_list: None,
        })
        .is_err());
    }

    #[test]
    fn conflicts_map_to_409_and_bad_input_to_400() {
        assert_eq!(
            stream_error_status(&StreamError::AlreadyStreaming),
            StatusCode::CONFLICT
        );
        assert_eq!(
            stream_error_status(&StreamError::NotStreaming),
            StatusCode::CONFLICT
        );
        assert_eq!(
            stream_error_status(&StreamError::StartCancelled),
            StatusCode::CONFLICT
        );
        assert_eq!(
            stream_error_status(&StreamError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            stream_error_status(&StreamError::ShuttingDown),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
