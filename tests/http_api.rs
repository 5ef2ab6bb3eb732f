#![cfg(feature = "web")]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use trialsheet::Store;
use trialsheet::app::{AppState, router};
use trialsheet::login::{NewUser, create_location, register_user};
use trialsheet::model::Role;

const LAYOUT: &str = "\
exp_id,location,year,season,replication,block,treatment,Height,Yield
EXP1,Hisar,2024,Rabi,1,1,T1,,
EXP1,Hisar,2024,Rabi,1,2,T2,,
";

fn app() -> Router {
    let store = Store::open_in_memory().unwrap();
    let loc = create_location(&store, "Hisar").unwrap();
    let other = create_location(&store, "Ludhiana").unwrap();
    for (username, role, location_id) in [
        ("root", Role::SuperAdmin, None),
        ("boss", Role::Admin, Some(loc.id)),
        ("field", Role::User, Some(loc.id)),
        ("far", Role::User, Some(other.id)),
    ] {
        register_user(
            &store,
            &NewUser {
                username: username.into(),
                password: "pw".into(),
                role,
                location_id,
            },
        )
        .unwrap();
    }
    router(Arc::new(AppState::new(store, Duration::from_secs(3600))))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn login(app: &Router, username: &str) -> String {
    let request = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"username": username, "password": "pw"}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    cookie.split(';').next().unwrap().to_string()
}

async fn call(
    app: &Router,
    cookie: &str,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::COOKIE, cookie);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let (status, bytes) = send(app, builder.body(body).unwrap()).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn upload(app: &Router, cookie: &str, filename: &str, content: &str) -> (StatusCode, Value) {
    let boundary = "trialsheetboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
         Content-Type: text/csv\r\n\r\n{c}\r\n--{b}--\r\n",
        b = boundary,
        f = filename,
        c = content
    );
    let request = Request::post("/api/experiment/upload")
        .header(header::COOKIE, cookie)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, bytes) = send(app, request).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn requests_without_a_session_are_rejected() {
    let app = app();
    let (status, body) = call(&app, "session=bogus", Method::GET, "/api/me", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let request = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"username": "field", "password": "nope"}).to_string()))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_ends_the_session() {
    let app = app();
    let cookie = login(&app, "field").await;
    let (status, me) = call(&app, &cookie, Method::GET, "/api/me", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["role"], "user");

    call(&app, &cookie, Method::POST, "/logout", None).await;
    let (status, _) = call(&app, &cookie, Method::GET, "/api/me", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn super_admin_manages_accounts() {
    let app = app();
    let root = login(&app, "root").await;
    let (status, loc) = call(
        &app,
        &root,
        Method::POST,
        "/api/locations",
        Some(json!({"name": "Karnal"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        &app,
        &root,
        Method::POST,
        "/api/users",
        Some(json!({"username": "new", "password": "pw", "role": "admin", "location_id": loc["id"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, users) = call(&app, &root, Method::GET, "/api/users", None).await;
    assert_eq!(users.as_array().unwrap().len(), 5);

    let admin = login(&app, "boss").await;
    let (status, _) = call(&app, &admin, Method::GET, "/api/users", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn upload_entry_submit_and_reopen() {
    let app = app();
    let admin = login(&app, "boss").await;
    let field = login(&app, "field").await;

    let (status, _) = upload(&app, &field, "layout.csv", LAYOUT).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, summary) = upload(&app, &admin, "layout.csv", LAYOUT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["treatments"], 2);

    let (_, grid) = call(&app, &field, Method::GET, "/api/entry?traits=Height,Yield", None).await;
    let t1 = grid["rows"][0]["treatment_id"].as_i64().unwrap();
    assert_eq!(grid["rows"][1]["values"][0], 0.0);

    let (status, saved) = call(
        &app,
        &field,
        Method::POST,
        "/api/entry",
        Some(json!({"edits": [{"treatment_id": t1, "trait": "Height", "value": 12.5}], "submit": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["changed"], 1);

    let (status, _) = call(
        &app,
        &field,
        Method::POST,
        "/api/entry",
        Some(json!({"edits": [{"treatment_id": t1, "trait": "Height", "value": 1.0}]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, &field, Method::POST, "/api/reopen", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, reopened) = call(&app, &admin, Method::POST, "/api/reopen", None).await;
    assert_eq!(reopened["changed"], 2);

    let (_, history) = call(&app, &admin, Method::GET, "/api/history?traits=Height", None).await;
    assert_eq!(history["rows"][0]["values"][0], 12.5);
}

#[tokio::test]
async fn other_locations_cannot_touch_treatments() {
    let app = app();
    let admin = login(&app, "boss").await;
    upload(&app, &admin, "layout.csv", LAYOUT).await;
    let (_, treatments) = call(&app, &admin, Method::GET, "/api/treatments", None).await;
    let t1 = treatments[0]["id"].as_i64().unwrap();

    let far = login(&app, "far").await;
    let (status, _) = call(
        &app,
        &far,
        Method::POST,
        "/api/entry",
        Some(json!({"edits": [{"treatment_id": t1, "trait": "Height", "value": 1.0}]})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn export_sets_download_headers() {
    let app = app();
    let admin = login(&app, "boss").await;
    upload(&app, &admin, "layout.csv", LAYOUT).await;

    let request = Request::get("/api/export?status=Draft&format=csv")
        .header(header::COOKIE, &admin)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"Draft_data.csv\""
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("exp_id,location,year,season,replication,block,treatment,Height,Yield"));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn purge_needs_the_confirmation_word() {
    let app = app();
    let admin = login(&app, "boss").await;
    upload(&app, &admin, "layout.csv", LAYOUT).await;

    let (status, _) = call(
        &app,
        &admin,
        Method::POST,
        "/api/danger/purge",
        Some(json!({"confirm": "delete"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        &admin,
        Method::POST,
        "/api/danger/purge",
        Some(json!({"confirm": "DELETE"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, treatments) = call(&app, &admin, Method::GET, "/api/treatments", None).await;
    assert!(treatments.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn admin_edits_traits_and_treatments() {
    let app = app();
    let admin = login(&app, "boss").await;
    upload(&app, &admin, "layout.csv", LAYOUT).await;

    let (status, def) = call(
        &app,
        &admin,
        Method::POST,
        "/api/traits",
        Some(json!({"name": "Notes", "data_type": "text"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = def["id"].as_i64().unwrap();
    let (_, toggled) = call(&app, &admin, Method::POST, &format!("/api/traits/{}/toggle", id), None).await;
    assert_eq!(toggled["active"], false);

    let field = login(&app, "field").await;
    let (_, active) = call(&app, &field, Method::GET, "/api/entry/traits", None).await;
    assert_eq!(active.as_array().unwrap().len(), 2);

    let (_, treatments) = call(&app, &admin, Method::GET, "/api/treatments", None).await;
    let t2 = treatments[1]["id"].as_i64().unwrap();
    let (status, _) = call(&app, &admin, Method::DELETE, &format!("/api/treatments/{}", t2), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, &admin, Method::POST, &format!("/api/treatments/{}/reset", t2), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
