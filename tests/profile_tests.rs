//! Account detail and password updates.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    PASSWORD, TestApp, authed_multipart_request, bearer_request, body_json,
    create_logged_in_user, create_test_app, json_request, login_user, multipart_body,
    multipart_request,
};

fn authed_json(method: &str, uri: &str, token: &str, json: &str) -> Request<Body> {
    let mut request = json_request(method, uri, json);
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", token).parse().unwrap(),
    );
    request
}

#[tokio::test]
async fn test_update_details() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/update-details",
            &access,
            r#"{"fullName": "Alice Liddell", "email": "liddell@example.com"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["fullName"], "Alice Liddell");
    assert_eq!(json["data"]["email"], "liddell@example.com");

    // Email is now a login handle
    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/login",
            &format!(
                r#"{{"email": "liddell@example.com", "password": "{}"}}"#,
                PASSWORD
            ),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_update_details_partial() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/update-details",
            &access,
            r#"{"fullName": "Only Name"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["fullName"], "Only Name");
    assert_eq!(json["data"]["email"], "alice@example.com");
}

#[tokio::test]
async fn test_update_details_requires_a_field() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/update-details",
            &access,
            r#"{"fullName": "  "}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_details_email_conflict() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    let _ = create_logged_in_user(&app, "bob").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/update-details",
            &access,
            r#"{"email": "bob@example.com"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_update_details_requires_auth() {
    let app = create_test_app().await;

    let response = app
        .request(json_request(
            "PATCH",
            "/api/v1/users/update-details",
            r#"{"fullName": "Mallory"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_change_password() {
    let app = create_test_app().await;
    let (access, refresh) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/change-password",
            &access,
            &format!(
                r#"{{"oldPassword": "{}", "newPassword": "brand-new-pass"}}"#,
                PASSWORD
            ),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/login",
            &format!(r#"{{"username": "alice", "password": "{}"}}"#, PASSWORD),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/login",
            r#"{"username": "alice", "password": "brand-new-pass"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The login above replaced the session; the pre-change token is stale
    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/refresh-token",
            &format!(r#"{{"refreshToken": "{}"}}"#, refresh),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_change_password_keeps_session() {
    let app = create_test_app().await;
    let (access, refresh) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/change-password",
            &access,
            &format!(
                r#"{{"oldPassword": "{}", "newPassword": "brand-new-pass"}}"#,
                PASSWORD
            ),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(json_request(
            "POST",
            "/api/v1/users/refresh-token",
            &format!(r#"{{"refreshToken": "{}"}}"#, refresh),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_change_password_wrong_old_password() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/change-password",
            &access,
            r#"{"oldPassword": "not-my-password", "newPassword": "brand-new-pass"}"#,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["message"], "Invalid old password");

    // Old password still works
    let _ = login_user(&app, "alice").await;
}

#[tokio::test]
async fn test_change_password_too_short() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    let response = app
        .request(authed_json(
            "PATCH",
            "/api/v1/users/change-password",
            &access,
            &format!(r#"{{"oldPassword": "{}", "newPassword": "short"}}"#, PASSWORD),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Profile images
// =============================================================================

fn image_upload(uri: &str, token: &str, field: &str, file_name: &str) -> Request<Body> {
    authed_multipart_request(
        "PATCH",
        uri,
        token,
        multipart_body(&[], &[(field, file_name, &b"new-image-bytes"[..])]),
    )
}

async fn stored_user(app: &TestApp, username: &str) -> vidtube::db::User {
    app.db
        .users()
        .get_by_username(username)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_update_avatar_replaces_old_image() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    let old_avatar = stored_user(&app, "alice").await.avatar;
    assert_eq!(app.media.stored().len(), 1);

    let response = app
        .request(image_upload(
            "/api/v1/users/update-avatar",
            &access,
            "avatar",
            "new.png",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["message"], "Avatar image updated successfully");
    let new_avatar = json["data"]["avatar"].as_str().unwrap().to_string();
    assert_ne!(new_avatar, old_avatar);
    assert_eq!(stored_user(&app, "alice").await.avatar, new_avatar);

    // Only the new image remains stored
    let stored = app.media.stored();
    assert_eq!(stored.len(), 1);
    assert!(new_avatar.ends_with(stored.iter().next().unwrap().as_str()));
}

#[tokio::test]
async fn test_update_cover_image_sets_and_replaces() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    assert!(stored_user(&app, "alice").await.cover_image.is_none());

    let response = app
        .request(image_upload(
            "/api/v1/users/update-cover-image",
            &access,
            "coverImage",
            "cover.jpg",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let first_cover = json["data"]["coverImage"].as_str().unwrap().to_string();
    assert_eq!(app.media.stored().len(), 2);

    let response = app
        .request(image_upload(
            "/api/v1/users/update-cover-image",
            &access,
            "coverImage",
            "cover2.jpg",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_ne!(json["data"]["coverImage"].as_str().unwrap(), first_cover);

    // Avatar and the latest cover
    assert_eq!(app.media.stored().len(), 2);
    assert_eq!(app.media.delete_count(), 1);
}

#[tokio::test]
async fn test_update_avatar_requires_file() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;

    // Wrong field name
    let response = app
        .request(image_upload(
            "/api/v1/users/update-avatar",
            &access,
            "coverImage",
            "new.png",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["message"], "The avatar file is missing");
    assert_eq!(app.media.upload_count(), 1);
}

#[tokio::test]
async fn test_update_avatar_requires_auth() {
    let app = create_test_app().await;

    let mut request = multipart_request(
        "/api/v1/users/update-avatar",
        multipart_body(&[], &[("avatar", "a.png", &b"bytes"[..])]),
    );
    *request.method_mut() = axum::http::Method::PATCH;

    let response = app.request(request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.media.upload_count(), 0);
}

#[tokio::test]
async fn test_update_avatar_upload_failure_keeps_old_image() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    let old_avatar = stored_user(&app, "alice").await.avatar;
    app.media.fail_uploads_after(1);

    let response = app
        .request(image_upload(
            "/api/v1/users/update-avatar",
            &access,
            "avatar",
            "new.png",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(stored_user(&app, "alice").await.avatar, old_avatar);
    assert_eq!(app.media.stored().len(), 1);
}

#[tokio::test]
async fn test_update_avatar_discards_upload_when_user_vanishes() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    let user = stored_user(&app, "alice").await;

    // The account is deleted while the new image uploads
    let db = app.db.clone();
    app.media.during_next_upload(move || async move {
        db.users().delete(user.id).await.unwrap();
    });

    let response = app
        .request(image_upload(
            "/api/v1/users/update-avatar",
            &access,
            "avatar",
            "new.png",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Only the registration avatar is left; the new upload was deleted
    assert_eq!(app.media.upload_count(), 2);
    assert_eq!(app.media.stored().len(), 1);
    assert_eq!(app.media.delete_count(), 1);
}

// =============================================================================
// Search
// =============================================================================

fn search(query: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("/api/v1/users/search?{}", query))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_search_users() {
    let app = create_test_app().await;
    let _ = create_logged_in_user(&app, "alice").await;
    let _ = create_logged_in_user(&app, "malice").await;
    let _ = create_logged_in_user(&app, "bob").await;

    let response = app.request(search("q=LIC")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let results = json["data"].as_array().unwrap();
    let names: Vec<_> = results
        .iter()
        .map(|u| u["username"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["alice", "malice"]);
    assert!(results.iter().all(|u| u["isSelf"] == false));
    assert!(results.iter().all(|u| u.get("passwordHash").is_none()));

    // Every full name is "Test User"
    let response = app.request(search("q=test%20user&limit=2")).await;
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_search_marks_viewer() {
    let app = create_test_app().await;
    let (access, _) = create_logged_in_user(&app, "alice").await;
    let _ = create_logged_in_user(&app, "malice").await;

    let response = app
        .request(bearer_request("GET", "/api/v1/users/search?q=alice", &access))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    for result in json["data"].as_array().unwrap() {
        let is_alice = result["username"] == "alice";
        assert_eq!(result["isSelf"], is_alice);
    }

    // A bad token is treated as anonymous
    let response = app
        .request(bearer_request("GET", "/api/v1/users/search?q=alice", "garbled"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["data"].as_array().unwrap().iter().all(|u| u["isSelf"] == false));
}

#[tokio::test]
async fn test_search_requires_query() {
    let app = create_test_app().await;

    for query in ["", "q=", "q=%20%20"] {
        let response = app.request(search(query)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {:?}", query);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
    }

    // Malformed parameters keep the error envelope
    let response = app.request(search("q=alice&limit=lots")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["statusCode"], 400);
}
