//! User and session endpoints.
//!
//! - POST `/register` - Create an account (multipart, avatar required)
//! - POST `/login` - Exchange credentials for an access/refresh pair
//! - POST `/logout` - Clear the session and both cookies
//! - POST `/refresh-token` - Rotate the refresh token
//! - GET `/current-user` - Profile of the authenticated user
//! - PATCH `/update-details` - Change full name and/or email
//! - PATCH `/change-password` - Replace the password
//! - PATCH `/update-avatar` - Replace the avatar (multipart)
//! - PATCH `/update-cover-image` - Replace or set the cover image (multipart)
//! - GET `/c/{username}` - Public channel profile
//! - GET `/search?q=` - Find users by username or full name

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::Field},
    http::{HeaderMap, HeaderName, header::SET_COOKIE},
    middleware,
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, patch, post},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::{ApiError, ResultExt};
use super::extract::{ApiJson, ApiQuery};
use super::response::ApiResponse;
use crate::auth::{
    ACCESS_COOKIE_NAME, Auth, OptionalAuth, REFRESH_COOKIE_NAME, SessionError, SessionManager,
    TokenPair, bearer_token, clear_cookie, get_cookie, session_cookie,
};
use crate::db::{Database, ImageSlot, NewUser, User, is_unique_violation};
use crate::impl_has_auth_backend;
use crate::media::{MediaStore, StoredMedia};
use crate::rate_limit::{
    RateLimitConfig, rate_limit_login, rate_limit_refresh, rate_limit_register,
};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_SEARCH_TERM_LEN: usize = 64;
const DEFAULT_SEARCH_LIMIT: u32 = 10;
const MAX_SEARCH_LIMIT: u32 = 50;
const MAX_IMAGE_SWAP_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct UsersState {
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub media: Arc<dyn MediaStore>,
    pub secure_cookies: bool,
    pub rate_limit: Option<Arc<RateLimitConfig>>,
}

impl_has_auth_backend!(UsersState);

pub fn router(state: UsersState) -> Router {
    let mut register_router = Router::new()
        .route("/register", post(register))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state.clone());
    let upload_router = Router::new()
        .route("/update-avatar", patch(update_avatar))
        .route("/update-cover-image", patch(update_cover_image))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state.clone());
    let mut login_router = Router::new()
        .route("/login", post(login))
        .with_state(state.clone());
    let mut refresh_router = Router::new()
        .route("/refresh-token", post(refresh_token))
        .with_state(state.clone());

    if let Some(config) = &state.rate_limit {
        register_router = register_router.layer(middleware::from_fn_with_state(
            config.clone(),
            rate_limit_register,
        ));
        login_router =
            login_router.layer(middleware::from_fn_with_state(config.clone(), rate_limit_login));
        refresh_router = refresh_router.layer(middleware::from_fn_with_state(
            config.clone(),
            rate_limit_refresh,
        ));
    }

    let session_router = Router::new()
        .route("/logout", post(logout))
        .route("/current-user", get(current_user))
        .route("/update-details", patch(update_details))
        .route("/change-password", patch(change_password))
        .route("/c/{username}", get(channel_profile))
        .route("/search", get(search_users))
        .with_state(state);

    Router::new()
        .merge(register_router)
        .merge(login_router)
        .merge(refresh_router)
        .merge(upload_router)
        .merge(session_router)
}

type CookieHeaders = AppendHeaders<[(HeaderName, String); 2]>;

fn session_cookies(tokens: &TokenPair, secure: bool) -> CookieHeaders {
    AppendHeaders([
        (
            SET_COOKIE,
            session_cookie(
                ACCESS_COOKIE_NAME,
                &tokens.access_token,
                tokens.access_expires_in,
                secure,
            ),
        ),
        (
            SET_COOKIE,
            session_cookie(
                REFRESH_COOKIE_NAME,
                &tokens.refresh_token,
                tokens.refresh_expires_in,
                secure,
            ),
        ),
    ])
}

fn cleared_cookies(secure: bool) -> CookieHeaders {
    AppendHeaders([
        (SET_COOKIE, clear_cookie(ACCESS_COOKIE_NAME, secure)),
        (SET_COOKIE, clear_cookie(REFRESH_COOKIE_NAME, secure)),
    ])
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    user: User,
    access_token: String,
    refresh_token: String,
}

#[derive(Serialize)]
struct Empty {}

// --- Registration ---

struct UploadedFile {
    file_name: String,
    bytes: Bytes,
}

#[derive(Default)]
struct RegistrationForm {
    username: Option<String>,
    full_name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    avatar: Option<UploadedFile>,
    cover_image: Option<UploadedFile>,
}

fn invalid_form(e: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(format!("Invalid form data: {}", e))
}

async fn text_field(field: Field<'_>) -> Result<Option<String>, ApiError> {
    let value = field.text().await.map_err(invalid_form)?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

async fn file_field(field: Field<'_>) -> Result<Option<UploadedFile>, ApiError> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    let bytes = field.bytes().await.map_err(invalid_form)?;
    Ok((!bytes.is_empty()).then_some(UploadedFile { file_name, bytes }))
}

impl RegistrationForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "username" => form.username = text_field(field).await?,
                "fullName" => form.full_name = text_field(field).await?,
                "email" => form.email = text_field(field).await?,
                "password" => {
                    // Passwords are taken verbatim, surrounding whitespace included
                    let password = field.text().await.map_err(invalid_form)?;
                    form.password = (!password.is_empty()).then_some(password);
                }
                "avatar" => form.avatar = file_field(field).await?,
                "coverImage" => form.cover_image = file_field(field).await?,
                _ => {}
            }
        }
        Ok(form)
    }
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.len() > MAX_USERNAME_LEN {
        return Err(ApiError::bad_request(
            "Username cannot be longer than 32 characters",
        ));
    }

    // Only allow alphanumeric and underscores
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ApiError::bad_request(
            "Username can only contain letters, numbers, and underscores",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ApiError::bad_request("Invalid email address")),
    }
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters long",
        ));
    }
    Ok(())
}

/// Delete media uploaded for a request that did not complete.
async fn discard_uploads(media: &dyn MediaStore, uploads: &[StoredMedia]) {
    let results = join_all(uploads.iter().map(|stored| media.delete(&stored.public_id))).await;
    for (stored, result) in uploads.iter().zip(results) {
        if let Err(e) = result {
            error!(public_id = %stored.public_id, error = %e, "Failed to delete orphaned upload");
        }
    }
}

async fn register(
    State(state): State<UsersState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = RegistrationForm::read(multipart).await?;

    let (Some(username), Some(full_name), Some(email), Some(password)) =
        (form.username, form.full_name, form.email, form.password)
    else {
        return Err(ApiError::bad_request("All fields are required"));
    };
    let username = username.to_lowercase();
    validate_username(&username)?;
    validate_email(&email)?;
    validate_password(&password)?;

    let avatar = form
        .avatar
        .ok_or_else(|| ApiError::bad_request("Avatar file is required"))?;

    let taken = state
        .sessions
        .bounded(state.db.users().is_identifier_taken(&username, &email))
        .await?;
    if taken {
        return Err(ApiError::conflict(
            "User with email or username already exists",
        ));
    }

    let password_hash = state
        .sessions
        .passwords()
        .hash(&password)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to hash password");
            ApiError::internal("Something went wrong while registering the user")
        })?;

    let media = state.media.as_ref();
    let mut uploads = Vec::with_capacity(2);

    let stored_avatar = media
        .upload(&avatar.bytes, &avatar.file_name)
        .await
        .media_err("Failed to upload avatar")?;
    uploads.push(stored_avatar.clone());

    let stored_cover = match &form.cover_image {
        Some(cover) => match media.upload(&cover.bytes, &cover.file_name).await {
            Ok(stored) => {
                uploads.push(stored.clone());
                Some(stored)
            }
            Err(e) => {
                discard_uploads(media, &uploads).await;
                return Err(ApiError::media_error("Failed to upload cover image", e));
            }
        },
        None => None,
    };

    let uuid = uuid::Uuid::new_v4().to_string();
    let new_user = NewUser {
        uuid: &uuid,
        username: &username,
        email: &email,
        full_name: &full_name,
        password_hash: &password_hash,
        avatar_url: &stored_avatar.url,
        avatar_id: &stored_avatar.public_id,
        cover_image_url: stored_cover.as_ref().map(|c| c.url.as_str()),
        cover_image_id: stored_cover.as_ref().map(|c| c.public_id.as_str()),
    };

    let id = match state.sessions.bounded(state.db.users().create(&new_user)).await {
        Ok(id) => id,
        Err(e) => {
            discard_uploads(media, &uploads).await;
            if matches!(&e, SessionError::Database(db) if is_unique_violation(db)) {
                return Err(ApiError::conflict(
                    "User with email or username already exists",
                ));
            }
            error!(error = %e, "Failed to create user");
            return Err(ApiError::internal(
                "Something went wrong while registering the user",
            ));
        }
    };

    let user = state
        .sessions
        .bounded(state.db.users().get_by_id(id))
        .await?
        .ok_or_else(|| ApiError::internal("Something went wrong while registering the user"))?;

    info!(user = %user.uuid, username = %user.username, "User registered");
    Ok(ApiResponse::created(user, "User registered successfully"))
}

// --- Login / logout / refresh ---

#[derive(Deserialize)]
struct LoginRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

async fn login(
    State(state): State<UsersState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .login(
            payload.username.as_deref(),
            payload.email.as_deref(),
            payload.password.as_deref().unwrap_or_default(),
        )
        .await
        .inspect_err(|e| warn!(reason = %e, "Login failed"))?;

    let cookies = session_cookies(&session.tokens, state.secure_cookies);
    Ok((
        cookies,
        ApiResponse::ok(
            SessionResponse {
                user: session.user,
                access_token: session.tokens.access_token,
                refresh_token: session.tokens.refresh_token,
            },
            "User logged in successfully",
        ),
    ))
}

async fn logout(
    State(state): State<UsersState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.logout(&auth.user).await?;
    Ok((
        cleared_cookies(state.secure_cookies),
        ApiResponse::ok(Empty {}, "User logged out"),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: Option<String>,
}

/// Refresh token from the cookie, then the JSON body, then the bearer header.
fn presented_refresh_token(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(token) = get_cookie(headers, REFRESH_COOKIE_NAME) {
        return Some(token.to_string());
    }
    if !body.is_empty() {
        if let Some(token) = serde_json::from_slice::<RefreshRequest>(body)
            .ok()
            .and_then(|r| r.refresh_token)
            .filter(|t| !t.is_empty())
        {
            return Some(token);
        }
    }
    bearer_token(headers).map(str::to_string)
}

/// Any failure clears both cookies; the client must log in again.
async fn refresh_token(State(state): State<UsersState>, headers: HeaderMap, body: Bytes) -> Response {
    let secure = state.secure_cookies;

    let Some(presented) = presented_refresh_token(&headers, &body) else {
        return (
            cleared_cookies(secure),
            ApiError::unauthorized("Unauthorized request"),
        )
            .into_response();
    };

    match state.sessions.rotate(&presented).await {
        Ok(session) => (
            session_cookies(&session.tokens, secure),
            ApiResponse::ok(
                SessionResponse {
                    user: session.user,
                    access_token: session.tokens.access_token,
                    refresh_token: session.tokens.refresh_token,
                },
                "Access token refreshed",
            ),
        )
            .into_response(),
        Err(e) => (cleared_cookies(secure), ApiError::from(e)).into_response(),
    }
}

// --- Profile ---

async fn current_user(Auth(auth): Auth) -> impl IntoResponse {
    ApiResponse::ok(auth.user, "Current user fetched successfully")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDetailsRequest {
    full_name: Option<String>,
    email: Option<String>,
}

async fn update_details(
    State(state): State<UsersState>,
    Auth(auth): Auth,
    ApiJson(payload): ApiJson<UpdateDetailsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let full_name = payload
        .full_name
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let email = payload
        .email
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if full_name.is_none() && email.is_none() {
        return Err(ApiError::bad_request(
            "At least one of fullName or email is required",
        ));
    }
    if let Some(email) = email {
        validate_email(email)?;
    }

    match state
        .sessions
        .bounded(state.db.users().update_details(auth.user.id, full_name, email))
        .await
    {
        Ok(_) => {}
        Err(SessionError::Database(e)) if is_unique_violation(&e) => {
            return Err(ApiError::conflict("Email is already in use"));
        }
        Err(e) => return Err(e.into()),
    }

    let user = state
        .sessions
        .bounded(state.db.users().get_by_id(auth.user.id))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(ApiResponse::ok(user, "Account details updated successfully"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<UsersState>,
    Auth(auth): Auth,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_password(&payload.new_password)?;

    match state
        .sessions
        .change_password(&auth.user, &payload.old_password, &payload.new_password)
        .await
    {
        Ok(()) => Ok(ApiResponse::ok(Empty {}, "Password changed successfully")),
        Err(SessionError::InvalidPassword) => Err(ApiError::bad_request("Invalid old password")),
        Err(e) => Err(e.into()),
    }
}

// --- Profile images ---

impl ImageSlot {
    fn field_name(self) -> &'static str {
        match self {
            ImageSlot::Avatar => "avatar",
            ImageSlot::CoverImage => "coverImage",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ImageSlot::Avatar => "avatar",
            ImageSlot::CoverImage => "cover image",
        }
    }
}

/// Read the single file field named `name`; other fields are ignored.
async fn read_single_file(
    mut multipart: Multipart,
    name: &str,
) -> Result<Option<UploadedFile>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        if field.name() == Some(name) {
            return file_field(field).await;
        }
    }
    Ok(None)
}

/// Point the slot at the uploaded image, retrying while concurrent updates
/// keep replacing the image read. Returns the replaced image's ID.
async fn swap_image(
    state: &UsersState,
    user_id: i64,
    slot: ImageSlot,
    stored: &StoredMedia,
) -> Result<Option<String>, ApiError> {
    let users = state.db.users();
    for _ in 0..MAX_IMAGE_SWAP_ATTEMPTS {
        let current = state
            .sessions
            .bounded(users.image_id(user_id, slot))
            .await?
            .ok_or_else(|| ApiError::not_found("User not found"))?;

        let swapped = state
            .sessions
            .bounded(users.swap_image(
                user_id,
                slot,
                current.as_deref(),
                &stored.url,
                &stored.public_id,
            ))
            .await?;
        if swapped {
            return Ok(current);
        }
    }
    Err(ApiError::conflict("Image was changed concurrently, try again"))
}

/// Upload the new image, swap it in and delete the one it replaced.
/// The upload is deleted again if the user record could not be updated.
async fn replace_image(
    state: &UsersState,
    user: &User,
    slot: ImageSlot,
    multipart: Multipart,
) -> Result<User, ApiError> {
    let file = read_single_file(multipart, slot.field_name())
        .await?
        .ok_or_else(|| ApiError::bad_request(format!("The {} file is missing", slot.label())))?;

    let media = state.media.as_ref();
    let stored = media
        .upload(&file.bytes, &file.file_name)
        .await
        .media_err(&format!("Failed to upload {}", slot.label()))?;

    let replaced = match swap_image(state, user.id, slot, &stored).await {
        Ok(replaced) => replaced,
        Err(e) => {
            discard_uploads(media, std::slice::from_ref(&stored)).await;
            return Err(e);
        }
    };

    if let Some(old) = replaced {
        if let Err(e) = media.delete(&old).await {
            error!(public_id = %old, error = %e, "Failed to delete replaced image");
        }
    }

    info!(user = %user.uuid, image = slot.label(), "Profile image updated");

    state
        .sessions
        .bounded(state.db.users().get_by_id(user.id))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

async fn update_avatar(
    State(state): State<UsersState>,
    Auth(auth): Auth,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let user = replace_image(&state, &auth.user, ImageSlot::Avatar, multipart).await?;
    Ok(ApiResponse::ok(user, "Avatar image updated successfully"))
}

async fn update_cover_image(
    State(state): State<UsersState>,
    Auth(auth): Auth,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let user = replace_image(&state, &auth.user, ImageSlot::CoverImage, multipart).await?;
    Ok(ApiResponse::ok(user, "Cover image updated successfully"))
}

// --- Public profiles ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelProfile {
    #[serde(flatten)]
    user: User,
    is_owner: bool,
}

async fn channel_profile(
    State(state): State<UsersState>,
    OptionalAuth(viewer): OptionalAuth,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let username = username.trim().to_lowercase();
    if username.is_empty() {
        return Err(ApiError::bad_request("Username is missing"));
    }

    let user = state
        .sessions
        .bounded(state.db.users().get_by_username(&username))
        .await?
        .ok_or_else(|| ApiError::not_found("Channel does not exist"))?;

    let is_owner = viewer.is_some_and(|v| v.user.id == user.id);

    Ok(ApiResponse::ok(
        ChannelProfile { user, is_owner },
        "User channel fetched successfully",
    ))
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(flatten)]
    user: User,
    is_self: bool,
}

async fn search_users(
    State(state): State<UsersState>,
    OptionalAuth(viewer): OptionalAuth,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let term = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("Search query is required"))?;
    if term.chars().count() > MAX_SEARCH_TERM_LEN {
        return Err(ApiError::bad_request(
            "Search query cannot be longer than 64 characters",
        ));
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let users = state
        .sessions
        .bounded(state.db.users().search(term, limit))
        .await?;

    let viewer_id = viewer.map(|v| v.user.id);
    let results: Vec<SearchResult> = users
        .into_iter()
        .map(|user| SearchResult {
            is_self: viewer_id == Some(user.id),
            user,
        })
        .collect();

    Ok(ApiResponse::ok(results, "Users fetched successfully"))
}
