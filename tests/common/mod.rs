#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderName, Request, Response},
};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use vidtube::{
    ServerConfig, create_app,
    db::Database,
    jwt::JwtConfig,
    media::{MediaError, MediaStore, StoredMedia},
    password::HashingConfig,
};

pub const ACCESS_SECRET: &[u8] = b"test-access-secret-0123456789abcdef";
pub const REFRESH_SECRET: &[u8] = b"test-refresh-secret-0123456789abcdef";
pub const PASSWORD: &str = "p@ss1234";

type UploadHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// In-memory media store that remembers what is currently stored.
#[derive(Default)]
pub struct RecordingMediaStore {
    stored: Mutex<HashSet<String>>,
    uploads: AtomicUsize,
    deletes: AtomicUsize,
    upload_limit: Mutex<Option<usize>>,
    upload_hook: Mutex<Option<UploadHook>>,
}

impl RecordingMediaStore {
    pub fn stored(&self) -> HashSet<String> {
        self.stored.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every upload after the first `n` fail.
    pub fn fail_uploads_after(&self, n: usize) {
        *self.upload_limit.lock().unwrap() = Some(n);
    }

    /// Run `hook` while the next upload is in flight, before it completes.
    pub fn during_next_upload<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.upload_hook.lock().unwrap() = Some(Box::new(move || Box::pin(hook())));
    }
}

#[async_trait]
impl MediaStore for RecordingMediaStore {
    async fn upload(&self, bytes: &[u8], file_name: &str) -> Result<StoredMedia, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }
        let hook = self.upload_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
        let n = self.uploads.load(Ordering::SeqCst);
        if self.upload_limit.lock().unwrap().is_some_and(|limit| n >= limit) {
            return Err(MediaError::Io(std::io::Error::other("storage unavailable")));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let public_id = format!("media-{}-{}", n, file_name);
        self.stored.lock().unwrap().insert(public_id.clone());
        Ok(StoredMedia {
            url: format!("http://media.test/{}", public_id),
            public_id,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), MediaError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.stored.lock().unwrap().remove(public_id);
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub db: Database,
    pub media: Arc<RecordingMediaStore>,
    pub jwt: JwtConfig,
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub struct TestOptions {
    pub access_token_expiry: u64,
    pub rate_limit: bool,
    pub ip_header: Option<HeaderName>,
    pub store_timeout: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            access_token_expiry: 900,
            rate_limit: false,
            ip_header: None,
            store_timeout: Duration::from_secs(5),
        }
    }
}

pub async fn create_test_app() -> TestApp {
    create_test_app_with(TestOptions::default()).await
}

pub async fn create_test_app_with(options: TestOptions) -> TestApp {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let media = Arc::new(RecordingMediaStore::default());
    let config = ServerConfig {
        db: db.clone(),
        media: media.clone(),
        access_secret: ACCESS_SECRET.to_vec(),
        refresh_secret: REFRESH_SECRET.to_vec(),
        access_token_expiry: options.access_token_expiry,
        refresh_token_expiry: 864000,
        secure_cookies: false,
        hashing: HashingConfig {
            memory_kib: 1024,
            iterations: 1,
            max_concurrent: 4,
        },
        store_timeout: options.store_timeout,
        rate_limit: options.rate_limit,
        ip_header: options.ip_header,
    };
    let router = create_app(&config).expect("Failed to create app");
    let jwt = JwtConfig::new(ACCESS_SECRET, REFRESH_SECRET)
        .with_durations(options.access_token_expiry, 864000);
    TestApp {
        router,
        db,
        media,
        jwt,
    }
}

pub const BOUNDARY: &str = "vidtube-test-boundary";

/// Build a multipart/form-data body.
pub fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    for (name, file_name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, name, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Multipart request with an access token, for the profile image endpoints.
pub fn authed_multipart_request(
    method: &str,
    uri: &str,
    token: &str,
    body: Vec<u8>,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, json: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

pub fn bearer_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

/// Register a user with an avatar and the default password.
pub async fn register_user(app: &TestApp, username: &str, email: &str) -> Response<Body> {
    let body = multipart_body(
        &[
            ("username", username),
            ("fullName", "Test User"),
            ("email", email),
            ("password", PASSWORD),
        ],
        &[("avatar", "avatar.png", &b"fake-png-bytes"[..])],
    );
    app.request(multipart_request("/api/v1/users/register", body))
        .await
}

/// Log in by username and return (access_token, refresh_token).
pub async fn login_user(app: &TestApp, username: &str) -> (String, String) {
    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/login",
            &format!(r#"{{"username": "{}", "password": "{}"}}"#, username, PASSWORD),
        ))
        .await;
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    (
        json["data"]["accessToken"].as_str().unwrap().to_string(),
        json["data"]["refreshToken"].as_str().unwrap().to_string(),
    )
}

/// Register then log in; returns (access_token, refresh_token).
pub async fn create_logged_in_user(app: &TestApp, username: &str) -> (String, String) {
    let response = register_user(app, username, &format!("{}@example.com", username)).await;
    assert_eq!(response.status(), 201);
    login_user(app, username).await
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Extract Set-Cookie headers from response
pub fn extract_set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect()
}

/// Check if cookies contain a token being cleared (Max-Age=0)
pub fn has_cleared_cookie(cookies: &[String], cookie_name: &str) -> bool {
    cookies
        .iter()
        .any(|c| c.starts_with(&format!("{}=", cookie_name)) && c.contains("Max-Age=0"))
}

/// Value of a cookie being set (not cleared)
pub fn cookie_value(cookies: &[String], cookie_name: &str) -> Option<String> {
    let prefix = format!("{}=", cookie_name);
    cookies
        .iter()
        .filter(|c| !c.contains("Max-Age=0"))
        .find_map(|c| c.strip_prefix(&prefix))
        .and_then(|rest| rest.split(';').next())
        .map(|v| v.to_string())
}
