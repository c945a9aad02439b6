use crate::auth::{AuthService, LoginRequest, LoginResponse, Profile};
use crate::config::RateLimitConfig;
use crate::converter::{Converter, UploadedFile};
use crate::error::{AppError, Result};
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Room for multipart framing on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

pub struct AppState {
    pub converter: Converter,
    pub auth: AuthService,
}

/// Build the application router
pub fn router(state: Arc<AppState>, rate_limit: &RateLimitConfig) -> Result<Router> {
    let body_limit = state.converter.max_upload_bytes() as usize + MULTIPART_OVERHEAD_BYTES;

    // One token replenishes every window/max, with bursts of up to `max`
    let replenish_ms = (rate_limit.window.as_millis() as u64 / u64::from(rate_limit.max)).max(1);
    let governor = GovernorConfigBuilder::default()
        .key_extractor(PeerIpKeyExtractor)
        .per_millisecond(replenish_ms)
        .burst_size(rate_limit.max)
        .finish()
        .ok_or_else(|| AppError::Internal(format!("Invalid rate limit: {:?}", rate_limit)))?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/files/convert/pdf", post(convert_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/me", get(me_handler))
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/", get(info_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(GovernorLayer {
            config: Arc::new(governor),
        })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state))
}

/// Caller identity established from the `Authorization: Bearer` header
pub struct AuthenticatedUser(pub Profile);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Malformed authorization header".to_string()))?;

        state.auth.authenticate(token).await.map(AuthenticatedUser)
    }
}

/// Convert the uploaded `file` field to PDF
pub async fn convert_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user): AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<Response> {
    let max = state.converter.max_upload_bytes();
    let mut upload: Option<UploadedFile> = None;

    // Parse multipart form data
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let name = field
            .file_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AppError::InvalidRequest("No filename provided".to_string()))?
            .to_string();
        let mime_type = resolve_mime_type(field.content_type(), &name);

        let content = field.bytes().await.map_err(|e| multipart_error(e, max))?;

        info!(
            "Received file from {}: {} ({}, {} bytes)",
            user.email,
            name,
            mime_type,
            content.len()
        );
        upload = Some(UploadedFile {
            name,
            mime_type,
            size_bytes: content.len() as u64,
            content,
        });
    }

    let result = state.converter.convert_to_pdf(upload).await?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/pdf"),
            ),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&result.filename)?,
            ),
        ],
        result.data,
    )
        .into_response())
}

fn multipart_error(err: axum::extract::multipart::MultipartError, max: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::FileTooLarge { size: max + 1, max }
    } else {
        AppError::InvalidRequest(format!("Failed to parse multipart data: {}", err))
    }
}

/// Use the declared type unless it is missing or generic, then guess from the name
fn resolve_mime_type(declared: Option<&str>, filename: &str) -> String {
    match declared.map(str::trim) {
        Some(declared)
            if !declared.is_empty()
                && !declared.eq_ignore_ascii_case(mime::APPLICATION_OCTET_STREAM.as_ref()) =>
        {
            declared.to_string()
        }
        _ => mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// `attachment` header with an ASCII fallback and the exact UTF-8 name
fn content_disposition(filename: &str) -> Result<HeaderValue> {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    ))
    .map_err(|e| AppError::Internal(format!("Invalid download filename: {}", e)))
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    state.auth.login(&credentials).await.map(Json)
}

pub async fn me_handler(AuthenticatedUser(user): AuthenticatedUser) -> Json<Profile> {
    Json(user)
}

/// Health check endpoint
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "pdfforge",
        "renderEngineRunning": state.converter.is_render_engine_running().await,
    }))
}

/// Information endpoint - lists supported formats
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "service": "pdfforge",
        "version": env!("CARGO_PKG_VERSION"),
        "supported_formats": state.converter.supported_extensions(),
        "max_upload_bytes": state.converter.max_upload_bytes(),
        "endpoints": {
            "login": {
                "path": "/auth/login",
                "method": "POST",
                "description": "Authenticate and receive a bearer access token",
                "content_type": "application/json",
                "fields": {
                    "email": "Account email (required)",
                    "password": "Account password (required)"
                }
            },
            "me": {
                "path": "/auth/me",
                "method": "GET",
                "description": "Return the authenticated user profile (bearer token required)"
            },
            "convert": {
                "path": "/files/convert/pdf",
                "method": "POST",
                "description": "Convert a DOCX, Markdown, HTML, PNG or JPEG file to PDF (bearer token required)",
                "content_type": "multipart/form-data",
                "fields": {
                    "file": "The file to convert (required)"
                }
            },
            "health": {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint"
            },
            "info": {
                "path": "/info",
                "method": "GET",
                "description": "Service information and supported formats"
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::auth_config;
    use crate::converter::DEFAULT_MAX_UPLOAD_BYTES;
    use crate::engines::image::tests::png_fixture;
    use crate::engines::{Counters, FakeLauncher, RenderEngine};
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use axum::Extension;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "pdfforge-test-boundary";

    const GENEROUS_LIMIT: RateLimitConfig = RateLimitConfig {
        max: 1000,
        window: Duration::from_secs(1),
    };

    fn client(last_octet: u8) -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([10, 0, 0, last_octet], 40000)))
    }

    /// Router without a peer address; callers attach one per request
    fn bare_app(max_upload_bytes: u64, rate_limit: &RateLimitConfig) -> Router {
        let counters = Arc::new(Counters::default());
        let engine = RenderEngine::new(FakeLauncher::new(counters), Duration::from_secs(5));
        let state = AppState {
            converter: Converter::new(Arc::new(engine), max_upload_bytes),
            auth: AuthService::new(&auth_config("hunter22", Duration::from_secs(300))).unwrap(),
        };
        router(Arc::new(state), rate_limit).unwrap()
    }

    fn app() -> Router {
        bare_app(DEFAULT_MAX_UPLOAD_BYTES, &GENEROUS_LIMIT).layer(Extension(client(1)))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router) -> String {
        let request = Request::post("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"email":"admin@example.com","password":"hunter22"}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["accessToken"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn multipart_body(field: &str, filename: &str, content_type: Option<&str>, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            BOUNDARY, field, filename
        )
        .into_bytes();
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn convert_request(token: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::post("/files/convert/pdf").header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_login_and_profile() {
        let app = app();
        let token = login(&app).await;

        let request = Request::get("/auth/me")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let profile = body_json(response).await;
        assert_eq!(profile["email"], "admin@example.com");
        assert!(profile.get("password").is_none());
    }

    #[tokio::test]
    async fn test_bad_login_is_unauthorized() {
        let request = Request::post("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email":"admin@example.com","password":"nope"}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_convert_requires_token() {
        let body = multipart_body("file", "notes.md", Some("text/markdown"), b"# Hi");
        let response = app().oneshot(convert_request(None, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = multipart_body("file", "notes.md", Some("text/markdown"), b"# Hi");
        let response = app()
            .oneshot(convert_request(Some("forged"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_convert_markdown() {
        let app = app();
        let token = login(&app).await;

        let body = multipart_body("file", "Notes.MD", Some("text/markdown"), b"# Hello");
        let response = app
            .clone()
            .oneshot(convert_request(Some(&token), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Notes.pdf\"; filename*=UTF-8''Notes.pdf"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_convert_image_with_generic_content_type() {
        let app = app();
        let token = login(&app).await;

        let body = multipart_body(
            "file",
            "pixel.png",
            Some("application/octet-stream"),
            &png_fixture(2, 2),
        );
        let response = app
            .clone()
            .oneshot(convert_request(Some(&token), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_convert_error_statuses() {
        let app = app();
        let token = login(&app).await;

        let body = multipart_body("file", "notes.txt", Some("text/plain"), b"plain");
        let response = app
            .clone()
            .oneshot(convert_request(Some(&token), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let error = body_json(response).await;
        assert!(error["error"].as_str().unwrap().contains("docx"));

        let body = multipart_body("attachment", "notes.md", Some("text/markdown"), b"# Hi");
        let response = app
            .clone()
            .oneshot(convert_request(Some(&token), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "A file must be provided");
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let app = app();

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["renderEngineRunning"], false);

        let response = app
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info = body_json(response).await;
        assert_eq!(info["supported_formats"].as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_body_over_limit_is_file_too_large() {
        let app = bare_app(1024, &GENEROUS_LIMIT).layer(Extension(client(1)));
        let token = login(&app).await;

        let oversized = vec![b'#'; MULTIPART_OVERHEAD_BYTES + 4096];
        let body = multipart_body("file", "huge.md", Some("text/markdown"), &oversized);
        let response = app
            .clone()
            .oneshot(convert_request(Some(&token), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(response).await["error"],
            "File exceeds the upload limit of 1024 bytes"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_client() {
        let limit = RateLimitConfig {
            max: 2,
            window: Duration::from_secs(60),
        };
        let app = bare_app(DEFAULT_MAX_UPLOAD_BYTES, &limit);
        let health = |peer: ConnectInfo<SocketAddr>| {
            Request::get("/health")
                .extension(peer)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(health(client(7))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(health(client(7))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(health(client(8))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_content_disposition_fallback() {
        let value = content_disposition("résumé \"final\".pdf").unwrap();
        assert_eq!(
            value,
            "attachment; filename=\"r_sum_ _final_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22final%22.pdf"
        );
    }

    #[test]
    fn test_resolve_mime_type() {
        assert_eq!(resolve_mime_type(Some("image/png"), "a.jpg"), "image/png");
        assert_eq!(resolve_mime_type(None, "a.jpg"), "image/jpeg");
        assert_eq!(
            resolve_mime_type(Some("application/octet-stream"), "a.png"),
            "image/png"
        );
    }
}
