use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::debug;

use crate::{
    error::ApiError,
    metadata::MediaMetadata,
    pipeline::{DownloadPipeline, MediaRequest},
};

pub const SERVICE_NAME: &str = "Solidarity Media Hub API";
const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DownloadPipeline>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/metadata", post(get_metadata).options(no_content))
        .route("/api/download", post(download_media).options(no_content))
        .route("/api/health", get(health).options(no_content))
        .route("/api/platforms", get(platforms).options(no_content))
        .layer(build_cors_layer())
        .layer(middleware::from_fn(preflight_no_content));

    Router::new()
        .route("/", get(home))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ])
}

/// Preflights answer `204 No Content`, whichever layer produced them.
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options && response.status().is_success() {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Unreadable bodies count as a missing URL; a body that names a URL but has
/// other malformed fields reports what was wrong with it.
fn read_request(payload: Result<Json<Value>, JsonRejection>) -> Result<MediaRequest, ApiError> {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            debug!("Rejected request body: {rejection}");
            return Err(ApiError::invalid_request("URL is required"));
        }
    };

    let has_url = body
        .get("url")
        .and_then(Value::as_str)
        .is_some_and(|url| !url.trim().is_empty());

    serde_json::from_value::<MediaRequest>(body).map_err(|error| {
        debug!("Rejected request body: {error}");
        if has_url {
            ApiError::invalid_request(format!("Invalid request body: {error}"))
        } else {
            ApiError::invalid_request("URL is required")
        }
    })
}

async fn get_metadata(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<MediaMetadata>, ApiError> {
    let request = read_request(payload)?;
    let metadata = state.pipeline.metadata(&request).await?;
    Ok(Json(metadata))
}

async fn download_media(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = read_request(payload)?;
    let prepared = state.pipeline.fetch(&request).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(prepared.content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(prepared.content_length));

    let content_disposition = build_content_disposition(&prepared.filename);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&prepared.filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    Ok((headers, prepared.body).into_response())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn home() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/api/metadata": "POST - Get media metadata",
            "/api/download": "POST - Download media",
            "/api/health": "GET - Health check",
            "/api/platforms": "GET - Supported platforms",
        }
    }))
}

async fn platforms() -> Json<Value> {
    let platforms = [
        ("youtube", "YouTube"),
        ("tiktok", "TikTok"),
        ("instagram", "Instagram"),
        ("twitter", "X / Twitter"),
        ("facebook", "Facebook"),
        ("vimeo", "Vimeo"),
        ("reddit", "Reddit"),
        ("soundcloud", "SoundCloud"),
        ("twitch", "Twitch (clips and VODs)"),
        ("dailymotion", "Dailymotion"),
    ]
    .into_iter()
    .map(|(id, name)| json!({ "id": id, "name": name, "metadata": true, "download": true }))
    .collect::<Vec<_>>();

    Json(json!({
        "platforms": platforms,
        "note": "Informational only. Any site the extractor understands may work; live streams and subscription-only content are refused.",
    }))
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.mp4".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        extractor::{ExtractOptions, ExtractionClient, ExtractionError, RawInfo},
        pipeline::PipelineSettings,
    };

    /// Writes a small mp4 next to the requested template.
    struct FixtureClient {
        probe_failure: Option<&'static str>,
    }

    #[async_trait]
    impl ExtractionClient for FixtureClient {
        async fn probe(
            &self,
            _url: &str,
            _options: &ExtractOptions,
        ) -> Result<RawInfo, ExtractionError> {
            if let Some(message) = self.probe_failure {
                return Err(ExtractionError::from_message(message));
            }
            Ok(serde_json::from_str(
                r#"{"title":"Clip","uploader":"Up","extractor_key":"Vimeo","formats":[{}]}"#,
            )?)
        }

        async fn download(
            &self,
            _url: &str,
            options: &ExtractOptions,
        ) -> Result<(RawInfo, PathBuf), ExtractionError> {
            let template = options.output_template.clone().unwrap_or_default();
            let path = PathBuf::from(
                template
                    .replace("%(title).50s", "Clip ü")
                    .replace("%(ext)s", "mp4"),
            );
            let mut bytes = b"\x00\x00\x00\x18ftypisom".to_vec();
            bytes.resize(2048, 1);
            tokio::fs::write(&path, bytes).await.map_err(ExtractionError::Spawn)?;
            Ok((RawInfo::default(), path))
        }
    }

    fn app(work: &TempDir, probe_failure: Option<&'static str>) -> Router {
        let pipeline = DownloadPipeline::new(
            Arc::new(FixtureClient { probe_failure }),
            PipelineSettings {
                work_dir: work.path().to_path_buf(),
                deadline: Duration::from_secs(5),
                probe_options: ExtractOptions::default(),
                download_options: ExtractOptions::default(),
            },
        );
        build_router(AppState {
            pipeline: Arc::new(pipeline),
        })
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_url_is_a_bad_request_on_both_endpoints() {
        let work = TempDir::new().unwrap();

        for uri in ["/api/metadata", "/api/download"] {
            for body in [r#"{"solidarity":"Aid"}"#, r#"{"url":""}"#, "not json"] {
                let response = app(&work, None).oneshot(post_json(uri, body)).await.unwrap();
                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri} {body}");

                let value = json_body(response).await;
                assert_eq!(value["error"], "URL is required");
                assert_eq!(value["code"], "INVALID_REQUEST");
            }
        }

        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_fields_next_to_a_url_are_reported() {
        let work = TempDir::new().unwrap();

        for uri in ["/api/metadata", "/api/download"] {
            let response = app(&work, None)
                .oneshot(post_json(uri, r#"{"url":"https://vimeo.com/1","quality":720}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");

            let value = json_body(response).await;
            assert_eq!(value["code"], "INVALID_REQUEST");
            assert!(
                value["error"]
                    .as_str()
                    .unwrap()
                    .starts_with("Invalid request body:")
            );
        }

        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn metadata_returns_the_public_schema() {
        let work = TempDir::new().unwrap();
        let response = app(&work, None)
            .oneshot(post_json(
                "/api/metadata",
                r#"{"url":"https://vimeo.com/1","solidarity":"Aid"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = json_body(response).await;
        assert_eq!(value["title"], "Clip");
        assert_eq!(value["uploader"], "Up");
        assert_eq!(value["platform"], "vimeo");
        assert_eq!(value["solidarity"], "Aid");
        assert_eq!(value["url"], "https://vimeo.com/1");
    }

    #[tokio::test]
    async fn metadata_failures_are_server_errors() {
        let work = TempDir::new().unwrap();
        let response = app(&work, Some("ERROR: Unsupported URL: https://nowhere"))
            .oneshot(post_json("/api/metadata", r#"{"url":"https://nowhere"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = json_body(response).await;
        assert!(value["error"].as_str().unwrap().contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn download_failures_use_the_taxonomy() {
        let work = TempDir::new().unwrap();
        let response = app(&work, Some("ERROR: [youtube] x: Sign in to confirm you're not a bot"))
            .oneshot(post_json("/api/download", r#"{"url":"https://youtu.be/x"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "BLOCKED");
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn download_streams_an_attachment() {
        let work = TempDir::new().unwrap();
        let response = app(&work, None)
            .oneshot(post_json(
                "/api/download",
                r#"{"url":"https://vimeo.com/1","solidarity":"Aid","quality":"720p"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[CONTENT_LENGTH], "2048");
        let disposition = headers[CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=\"Aid_Aid_"));
        assert!(disposition.contains("filename*=UTF-8''Aid_Aid_"));
        assert!(disposition.contains("Clip%20%C3%BC.mp4"));
        assert!(
            headers[DOWNLOAD_FILENAME_HEADER]
                .to_str()
                .unwrap()
                .ends_with("_Clip _.mp4")
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 2048);

        // The finished body hands its directory to the blocking pool.
        let mut remaining = usize::MAX;
        for _ in 0..200 {
            remaining = std::fs::read_dir(work.path()).unwrap().count();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn preflight_answers_no_content_for_any_origin() {
        let work = TempDir::new().unwrap();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/download")
            .header("origin", "https://example.org")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app(&work, None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(
            response
                .headers()
                .get("access-control-allow-credentials")
                .is_none()
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn bare_options_answers_no_content() {
        let work = TempDir::new().unwrap();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/metadata")
            .body(Body::empty())
            .unwrap();

        let response = app(&work, None).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn informational_endpoints() {
        let work = TempDir::new().unwrap();

        let health = app(&work, None)
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let value = json_body(health).await;
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["service"], SERVICE_NAME);
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));

        let platforms = app(&work, None)
            .oneshot(Request::builder().uri("/api/platforms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(platforms.status(), StatusCode::OK);
        assert!(json_body(platforms).await["platforms"].as_array().unwrap().len() > 1);

        let home = app(&work, None)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(home.status(), StatusCode::OK);
        assert!(json_body(home).await["endpoints"]["/api/download"].is_string());
    }

    #[test]
    fn content_disposition_escapes_non_ascii() {
        assert_eq!(
            build_content_disposition("Aid_Clip ü.mp4"),
            "attachment; filename=\"Aid_Clip _.mp4\"; filename*=UTF-8''Aid_Clip%20%C3%BC.mp4"
        );
        assert_eq!(sanitize_ascii_filename("///"), "___");
        assert_eq!(sanitize_ascii_filename("   "), "download.mp4");
    }
}
